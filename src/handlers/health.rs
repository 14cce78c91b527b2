//! Health endpoint.
//!
//! `GET /health` is served outside the pipeline so probes are never rate
//! limited, cached or counted. Always returns 200 OK with details in the body.

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use tracing::instrument;

use crate::models::{CacheHealth, HealthResponse, RateLimiterHealth};
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 42,
///   "outcomes": { "total": 10, "success": 9, "failure": 1, ... },
///   "cache": { "enabled": true, "entries": 3, "max_entries": 10000 },
///   "rate_limiter": { "enabled": true, "tracked_keys": 2 },
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let pipeline = &state.pipeline;
    let config = pipeline.config();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        outcomes: pipeline.stats(),
        cache: CacheHealth {
            enabled: config.enable_caching,
            entries: pipeline.cache().len(),
            max_entries: pipeline.cache().max_entries(),
        },
        rate_limiter: RateLimiterHealth {
            enabled: config.enable_rate_limiting,
            tracked_keys: pipeline.limiter().tracked_keys(),
        },
        timestamp: Utc::now(),
    })
}
