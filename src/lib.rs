//! # Request Pipeline
//!
//! A composable HTTP request middleware pipeline for axum/tower services:
//!
//! - **Throttling**: fixed-window rate limiting per client, with per-route policies
//! - **Response reuse**: TTL cache for successful `GET`/`HEAD` responses
//! - **Bounded execution**: request size guard and handler timeout
//! - **Failure reporting**: every handler failure or panic becomes a structured error
//! - **Observability**: one outcome record per request, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Performance → Security Headers → Compression               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Response Cache → Rate Limiter        (shared DashMap stores)│
//! ├─────────────────────────────────────────────────────────────┤
//! │  Size Guard → Timeout Guard → Error Normalizer              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handler (any tower::Service or axum Router)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::Router;
//! use axum::routing::get;
//! use request_pipeline::{MiddlewareConfig, Pipeline};
//!
//! # fn main() -> Result<(), request_pipeline::ConfigError> {
//! let handlers = Router::new().route("/api/hello", get(|| async { "hello" }));
//!
//! let pipeline = Pipeline::new(MiddlewareConfig::default())?;
//! let app: Router = Router::new().fallback_service(pipeline.wrap(handlers));
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Cache product reads for 30 seconds and throttle logins:
//! ```bash
//! CACHE_ROUTES=/api/products=30 RATE_LIMIT_ROUTES=/api/login=60:5 cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod keys;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod recorder;
pub mod routes;
pub mod state;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use config::{Config, MiddlewareConfig};
pub use error::{ConfigError, HandlerError, HandlerResult, PipelineError};
pub use pipeline::{PIPELINE_ORDER, Pipeline, PipelineService, Stage};
pub use policy::{CacheHitPolicy, RateLimitPolicy};
pub use recorder::{OutcomeRecord, PerformanceRecorder};
pub use routes::{build_router, build_router_with};
pub use state::AppState;
