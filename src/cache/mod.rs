//! Model-level cache for the classifieds application.
//!
//! - [`KeyBuilder`] turns an entity kind and a parameter bag into a stable key.
//! - [`VersionStore`] keeps one counter per kind for stores without tags.
//! - [`CacheManager`] is the facade used by repositories and services.
//! - [`InvalidationHook`] invalidates a kind (and related kinds) when one of
//!   its entities changes.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! default_ttl_secs = 3600
//! strategy = "auto"
//!
//! [cache.models.Post]
//! ttl_secs = 600
//! # ... see config.rs for all options
//! ```

mod config;
mod diagnostics;
mod events;
mod hook;
mod keys;
mod lock;
mod manager;
pub mod scope;
mod store;
mod tags;
mod version;

pub use config::{
    AutoInvalidation, AutoInvalidationOverrides, CacheConfig, EnvironmentOverrides, FALLBACK_TTL,
    ModelOverrides, StrategyPreference,
};
pub use diagnostics::{DiagnosticEvent, DiagnosticsSink, NoopSink, TracingSink};
pub use events::{Epoch, LifecycleEvent, ModelEvent, ModelEvents, ModelListener};
pub use hook::{Cacheable, HookOutcome, InvalidationHook, Invalidator};
pub use keys::{
    HashAlgorithm, KeyBuilder, ParamValue, ParameterBag, canonicalize, escape_kind,
};
pub use manager::{CacheManager, CacheStats, Invalidation, Strategy};
pub use scope::{InvalidationScope, ScopeGuard, with_scope};
pub use store::{CacheStore, MemoryStore, StoreCapabilities};
pub use tags::TagIndex;
pub use version::VersionStore;
