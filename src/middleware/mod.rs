//! Pipeline stages.
//!
//! Each stage is a `tower::Layer` + `tower::Service` pair contributing one
//! cross-cutting concern. [`Pipeline`](crate::pipeline::Pipeline) stacks them
//! in a fixed order, outermost first:
//!
//! ```text
//! Request → Performance → Security Headers → Compression → Cache → Rate Limit
//!         → Size Guard → Timeout → Error Normalizer → Handler
//!
//!   Cache hit ─────────────┘ (short-circuits; limiter never sees it)
//!   Rate limit ─────────────────────────────┘ 429
//!   Size guard ─────────────────────────────────────────┘ 413 / 400
//!   Timeout ──────────────────────────────────────────────────┘ 408
//!   Handler failure or panic ───────────────────────────────────────┘ 4xx/5xx
//! ```
//!
//! Guards answer on their own with a [`PipelineError`](crate::error::PipelineError)
//! response; only the normalizer sees handler failures.

use std::future::Future;
use std::pin::Pin;

use axum::body::Body;
use axum::http::Response;

pub mod cache;
pub mod compression;
pub mod error_normalizer;
pub mod ip;
pub mod performance;
pub mod rate_limit;
pub mod request_size;
pub mod security_headers;
pub mod timeout;

pub use cache::{CacheLayer, CacheService};
pub use compression::{CompressionLayer, CompressionService};
pub use error_normalizer::{ErrorNormalizerLayer, ErrorNormalizerService};
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, client_ip};
pub use performance::{PerformanceLayer, PerformanceService};
pub use rate_limit::{RateLimitLayer, RateLimitService};
pub use request_size::{RequestSizeLayer, RequestSizeService};
pub use security_headers::{SecurityHeadersLayer, SecurityHeadersService};
pub use timeout::{
    MAX_REQUEST_TIMEOUT_MS, MIN_REQUEST_TIMEOUT_MS, REQUEST_TIMEOUT_HEADER, RequestDeadline,
    RequestTimeout, TimeoutLayer, TimeoutService,
};

/// Boxed response future shared by every stage.
pub type BoxResponseFuture<E> =
    Pin<Box<dyn Future<Output = Result<Response<Body>, E>> + Send + 'static>>;
