use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the coherence core emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "template_engine_cache_hit_total",
            Unit::Count,
            "Total number of local cache hits."
        );
        describe_counter!(
            "template_engine_cache_miss_total",
            Unit::Count,
            "Total number of local cache misses."
        );
        describe_counter!(
            "template_engine_cache_evict_total",
            Unit::Count,
            "Total number of local cache evictions, labelled by cause."
        );
        describe_counter!(
            "template_engine_cache_store_load_total",
            Unit::Count,
            "Total number of document store reads issued on cache misses."
        );
        describe_counter!(
            "template_engine_cache_event_applied_total",
            Unit::Count,
            "Total number of change events applied, labelled by outcome."
        );
        describe_counter!(
            "template_engine_cache_event_stale_total",
            Unit::Count,
            "Total number of change events dropped as stale or duplicate."
        );
        describe_counter!(
            "template_engine_cache_event_malformed_total",
            Unit::Count,
            "Total number of undecodable bus records skipped."
        );
        describe_gauge!(
            "template_engine_cache_publish_queue_len",
            Unit::Count,
            "Current number of change events waiting to be published."
        );
        describe_counter!(
            "template_engine_cache_publish_dropped_total",
            Unit::Count,
            "Total number of change events dropped before publishing."
        );
        describe_counter!(
            "template_engine_cache_publish_retry_total",
            Unit::Count,
            "Total number of publish retries."
        );
        describe_counter!(
            "template_engine_cache_publish_failed_total",
            Unit::Count,
            "Total number of change events given up on after retries."
        );
        describe_histogram!(
            "template_engine_cache_consume_ms",
            Unit::Milliseconds,
            "Time to decode, apply and acknowledge one bus record."
        );
        describe_histogram!(
            "template_engine_cache_event_lag_ms",
            Unit::Milliseconds,
            "Delay between producing a change event and applying it."
        );
    });
}
