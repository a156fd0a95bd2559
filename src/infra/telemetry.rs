use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::StoreError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), StoreError> {
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
            StoreError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_histogram!(
            "scirocco_sweep_ms",
            Unit::Milliseconds,
            "Change-notification sweep latency in milliseconds."
        );
        describe_histogram!(
            "scirocco_cleanup_ms",
            Unit::Milliseconds,
            "Cache cleanup pass latency in milliseconds."
        );
        describe_counter!(
            "scirocco_purge_total",
            Unit::Count,
            "Total number of full page-cache purges."
        );
        describe_counter!(
            "scirocco_keys_removed_total",
            Unit::Count,
            "Total number of cache keys removed."
        );
        describe_gauge!(
            "scirocco_scheduled_queue_len",
            Unit::Count,
            "Current number of pending scheduled invalidations."
        );
    });
}
