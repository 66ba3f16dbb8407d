use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::AppError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr; stdout carries command output.
pub fn init(logging: &LoggingSettings) -> Result<(), AppError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            AppError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every cache metric. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "classifieds_cache_hit_total",
            Unit::Count,
            "Total number of cache hits, labelled by entity kind."
        );
        describe_counter!(
            "classifieds_cache_miss_total",
            Unit::Count,
            "Total number of cache misses, labelled by entity kind."
        );
        describe_counter!(
            "classifieds_cache_write_total",
            Unit::Count,
            "Total number of cache writes, labelled by entity kind."
        );
        describe_counter!(
            "classifieds_cache_invalidation_total",
            Unit::Count,
            "Total number of kind invalidations, labelled by entity kind."
        );
        describe_counter!(
            "classifieds_cache_store_error_total",
            Unit::Count,
            "Total number of failed store operations, labelled by operation."
        );
        describe_counter!(
            "classifieds_cache_evict_total",
            Unit::Count,
            "Total number of in-memory store evictions due to capacity."
        );
    });
}
