use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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

/// Register descriptions for every metric the engine emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        for (name, help) in [
            ("fathom_cache_local_hit_total", "Lookups served by the process-local tier."),
            ("fathom_cache_remote_hit_total", "Lookups served by the networked tier."),
            ("fathom_cache_miss_total", "Lookups that found no live entry in either tier."),
            ("fathom_cache_evict_total", "Local-tier evictions due to capacity."),
            ("fathom_cache_remote_error_total", "Failed calls to the networked tier."),
            ("fathom_cache_invalidated_total", "Entries removed by tag invalidation."),
            ("fathom_query_compute_total", "Full computations delegated to the data source."),
            ("fathom_query_coalesced_total", "Callers that joined an in-flight computation."),
            ("fathom_strategy_unavailable_total", "Resolution strategies skipped as unavailable."),
            ("fathom_alert_fired_total", "Alerts raised by threshold evaluation."),
            ("fathom_alert_resolved_total", "Alerts resolved by threshold evaluation."),
        ] {
            describe_counter!(name, Unit::Count, help);
        }
        describe_histogram!(
            "fathom_query_resolve_ms",
            Unit::Milliseconds,
            "End-to-end query resolution latency in milliseconds."
        );
    });
}
