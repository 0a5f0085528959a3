use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    application::jobs::{
        METRIC_RECONCILE_FLUSHED_TOTAL, METRIC_RECONCILE_MISMATCH_TOTAL, METRIC_RECONCILE_MS,
        METRIC_RECONCILE_SKIPPED_TOTAL,
    },
    cache::{
        METRIC_CACHE_HIT_TOTAL, METRIC_CACHE_MISS_TOTAL, METRIC_KV_ERROR_TOTAL,
        METRIC_TRENDING_REFRESH_TOTAL, METRIC_VIEW_INCREMENT_TOTAL,
    },
    config::{LogFormat, LoggingSettings},
};

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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_KV_ERROR_TOTAL,
            Unit::Count,
            "Total number of key-value operations that failed and served a fallback."
        );
        describe_counter!(
            METRIC_CACHE_HIT_TOTAL,
            Unit::Count,
            "Total number of tiered cache hits, labelled by cache and tier."
        );
        describe_counter!(
            METRIC_CACHE_MISS_TOTAL,
            Unit::Count,
            "Total number of tiered cache misses on both tiers."
        );
        describe_counter!(
            METRIC_VIEW_INCREMENT_TOTAL,
            Unit::Count,
            "Total number of view increments recorded in the cache."
        );
        describe_counter!(
            METRIC_RECONCILE_FLUSHED_TOTAL,
            Unit::Count,
            "Total number of view counters written and verified in the durable store."
        );
        describe_counter!(
            METRIC_RECONCILE_MISMATCH_TOTAL,
            Unit::Count,
            "Total number of view counters whose persisted value did not match after write."
        );
        describe_counter!(
            METRIC_RECONCILE_SKIPPED_TOTAL,
            Unit::Count,
            "Total number of dirty posts skipped because their cached counter had expired."
        );
        describe_histogram!(
            METRIC_RECONCILE_MS,
            Unit::Milliseconds,
            "Reconciliation run latency in milliseconds."
        );
        describe_counter!(
            METRIC_TRENDING_REFRESH_TOTAL,
            Unit::Count,
            "Total number of trending warm attempts, labelled by outcome."
        );
    });
}
