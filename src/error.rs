use std::fmt;

use thiserror::Error;

use crate::config::LoadError;

/// Failure reported by a backing store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
    #[error("operation `{operation}` is not supported by this store")]
    Unsupported { operation: &'static str },
    #[error("compare-and-set on `{key}` lost {attempts} consecutive races")]
    Contention { key: String, attempts: u32 },
    #[error("corrupt value under `{key}`: {message}")]
    Corrupt { key: String, message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn corrupt(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// One entity kind that could not be invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationFailure {
    pub kind: String,
    pub error: StoreError,
}

impl fmt::Display for InvalidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.error)
    }
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache parameters cannot be serialized: {message}")]
    Serialization { message: String },
    #[error("cache store unavailable during `{operation}`: {source}")]
    StoreUnavailable {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("invalidation failed for {} kind(s): {}", .failed.len(), join_failures(.failed))]
    InvalidationPartialFailure {
        failed: Vec<InvalidationFailure>,
        invalidated: Vec<String>,
    },
    #[error("cache configuration error: {message}")]
    Configuration { message: String },
}

impl CacheError {
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn store(operation: &'static str, source: StoreError) -> Self {
        Self::StoreUnavailable { operation, source }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Kinds that failed to invalidate, if this is a partial failure.
    pub fn failed_kinds(&self) -> Vec<&str> {
        match self {
            Self::InvalidationPartialFailure { failed, .. } => {
                failed.iter().map(|failure| failure.kind.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn join_failures(failed: &[InvalidationFailure]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Top-level failure of the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("validation failed: {0}")]
    Validation(String),
}

impl AppError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
