//! Model-level caching and invalidation for the classifieds application.

pub mod cache;
pub mod config;
pub mod error;
pub mod telemetry;
