//! Prometheus metrics for the request pipeline.
//!
//! Metrics are exposed on a dedicated HTTP listener (`METRICS_PORT`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `pipeline_requests_total` - Requests by method, status and outcome
//! - `pipeline_cache_lookups_total` - Cache lookups by result (hit, miss)
//! - `pipeline_rate_limit_rejections_total` - Requests rejected by the limiter
//!
//! ## Histograms
//! - `pipeline_request_duration_seconds` - End-to-end duration by method and status
//!
//! ## Gauges
//! - `pipeline_cache_entries` - Entries held by the response cache
//! - `pipeline_rate_limit_keys` - Keys tracked by the rate limiter

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

use crate::recorder::OutcomeRecord;

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "pipeline_requests_total";
    pub const CACHE_LOOKUPS_TOTAL: &str = "pipeline_cache_lookups_total";
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "pipeline_rate_limit_rejections_total";
    pub const REQUEST_DURATION_SECONDS: &str = "pipeline_request_duration_seconds";
    pub const CACHE_ENTRIES: &str = "pipeline_cache_entries";
    pub const RATE_LIMIT_KEYS: &str = "pipeline_rate_limit_keys";
}

/// Install the Prometheus exporter and describe all metrics.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REQUESTS_TOTAL,
        "Total number of requests handled by the pipeline"
    );
    describe_counter!(
        names::CACHE_LOOKUPS_TOTAL,
        "Total number of response cache lookups"
    );
    describe_counter!(
        names::RATE_LIMIT_REJECTIONS_TOTAL,
        "Total number of requests rejected by the rate limiter"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "End-to-end request duration in seconds"
    );
    describe_gauge!(
        names::CACHE_ENTRIES,
        "Number of entries held by the response cache"
    );
    describe_gauge!(
        names::RATE_LIMIT_KEYS,
        "Number of keys tracked by the rate limiter"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Record one request outcome.
pub fn record_outcome(outcome: &OutcomeRecord) {
    let status = outcome.status_code.to_string();
    let result = if outcome.success { "success" } else { "failure" };

    counter!(
        names::REQUESTS_TOTAL,
        "method" => outcome.method.clone(),
        "status" => status.clone(),
        "outcome" => result
    )
    .increment(1);
    histogram!(
        names::REQUEST_DURATION_SECONDS,
        "method" => outcome.method.clone(),
        "status" => status
    )
    .record(outcome.duration_ms / 1000.0);
}

/// Record a cache lookup (`"hit"` or `"miss"`).
pub fn record_cache_lookup(result: &'static str) {
    counter!(names::CACHE_LOOKUPS_TOTAL, "result" => result).increment(1);
}

/// Record a rate-limit rejection.
pub fn record_rate_limit_rejection() {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL).increment(1);
}

/// Update the store size gauges.
pub fn set_store_sizes(cache_entries: usize, rate_limit_keys: usize) {
    gauge!(names::CACHE_ENTRIES).set(cache_entries as f64);
    gauge!(names::RATE_LIMIT_KEYS).set(rate_limit_keys as f64);
}
