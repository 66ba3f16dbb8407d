//! Structured diagnostic events.
//!
//! The manager and hooks report what they did to a [`DiagnosticsSink`]. The
//! default sink turns events into tracing records; [`NoopSink`] discards them.

use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    /// `cache_invalidated`
    Invalidated { kind: String, detail: String },
    /// `cache_invalidation_skipped_recursive`
    InvalidationSkippedRecursive { kind: String },
    /// `cache_store_unavailable`
    StoreUnavailable {
        operation: &'static str,
        kind: String,
        reason: String,
    },
}

impl DiagnosticEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invalidated { .. } => "cache_invalidated",
            Self::InvalidationSkippedRecursive { .. } => "cache_invalidation_skipped_recursive",
            Self::StoreUnavailable { .. } => "cache_store_unavailable",
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Invalidated { kind, .. }
            | Self::InvalidationSkippedRecursive { kind }
            | Self::StoreUnavailable { kind, .. } => kind,
        }
    }
}

pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, event: &DiagnosticEvent);
}

/// Emits every event as a tracing record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, event: &DiagnosticEvent) {
        match event {
            DiagnosticEvent::Invalidated { kind, detail } => {
                info!(event = event.name(), kind = %kind, detail = %detail, "Cache invalidated");
            }
            DiagnosticEvent::InvalidationSkippedRecursive { kind } => {
                info!(
                    event = event.name(),
                    kind = %kind,
                    "Cache invalidation skipped: already invalidating this kind"
                );
            }
            DiagnosticEvent::StoreUnavailable {
                operation,
                kind,
                reason,
            } => {
                warn!(
                    event = event.name(),
                    operation,
                    kind = %kind,
                    reason = %reason,
                    "Cache store unavailable"
                );
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DiagnosticsSink for NoopSink {
    fn record(&self, _event: &DiagnosticEvent) {}
}
