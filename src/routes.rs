//! Application routing.
//!
//! # Layout
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ├── /health ──────────────► health_check (outside the pipeline)
//!          │
//!          ▼ (fallback)
//! ┌──────────────────┐
//! │     Pipeline     │ ← enabled stages, see `middleware`
//! └────────┬─────────┘
//!          │
//!          ▼
//!    Sample handlers
//! ```
//!
//! # Route Groups
//!
//! - `/health` - Health & pipeline statistics
//! - `/api/products`, `/api/products/{id}` - Cacheable catalog reads
//! - `/api/slow`, `/api/fail` - Timeout and failure demos

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::pipeline::PipelineService;
use crate::state::AppState;

/// Router with the demo handlers, before any pipeline stage.
pub fn sample_router() -> Router {
    Router::new()
        .route("/api/products", get(handlers::list_products))
        .route("/api/products/{id}", get(handlers::get_product))
        .route("/api/slow", get(handlers::slow))
        .route("/api/fail", get(handlers::fail))
}

/// Build the application router: `/health` plus `app` behind the pipeline.
pub fn build_router_with(state: AppState, app: Router) -> Router {
    let service: PipelineService = state.pipeline.wrap(app);

    info!(
        stages = ?state.pipeline.stages().iter().map(|s| s.name()).collect::<Vec<_>>(),
        "Request pipeline configured"
    );

    Router::new()
        .route("/health", get(handlers::health_check))
        .fallback_service(service)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the application router with the demo handlers.
pub fn build_router(state: AppState) -> Router {
    build_router_with(state, sample_router())
}
