use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recorder::OutcomeSummary;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Seconds since startup
    pub uptime_seconds: u64,
    /// Aggregate outcome counts
    pub outcomes: OutcomeSummary,
    pub cache: CacheHealth,
    pub rate_limiter: RateLimiterHealth,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Response cache liveness.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheHealth {
    pub enabled: bool,
    pub entries: usize,
    pub max_entries: usize,
}

/// Rate limiter liveness.
#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimiterHealth {
    pub enabled: bool,
    /// Keys with a window currently held in memory
    pub tracked_keys: usize,
}

/// Catalog entry served by the demo handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: u32,
    pub name: String,
    pub price_cents: u64,
    pub in_stock: bool,
}

/// Query parameters for listing products.
#[derive(Debug, Default, Deserialize)]
pub struct ListProductsQuery {
    /// Maximum number of products to return
    pub limit: Option<usize>,
    /// Only products currently in stock
    #[serde(default)]
    pub in_stock: bool,
}

/// Query parameters for the slow endpoint.
#[derive(Debug, Deserialize)]
pub struct SlowQuery {
    /// Artificial delay before answering
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_delay_ms() -> u64 {
    1_000
}

/// Query parameters for the failing endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct FailQuery {
    /// Panic instead of returning an error
    #[serde(default)]
    pub panic: bool,
}
