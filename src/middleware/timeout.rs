//! Timeout guard.
//!
//! Races the rest of the chain against a deadline. The deadline is the
//! configured handler timeout, optionally shortened by the client through
//! `X-Request-Timeout` (milliseconds):
//!
//! ```text
//! X-Request-Timeout: 5000  # give up after 5 seconds
//! ```
//!
//! A client value can never extend the configured timeout. Values outside
//! [`MIN_REQUEST_TIMEOUT_MS`]..=[`MAX_REQUEST_TIMEOUT_MS`] or that fail to
//! parse are ignored.
//!
//! On overrun the handler future is dropped, the request's
//! [`RequestDeadline`] token is cancelled, and a 408 is returned. Work the
//! handler spawned elsewhere keeps running unless it watches the token:
//!
//! ```rust,ignore
//! async fn handler(Extension(deadline): Extension<RequestDeadline>) -> Response {
//!     tokio::select! {
//!         _ = deadline.cancellation.cancelled() => StatusCode::REQUEST_TIMEOUT.into_response(),
//!         body = expensive_call() => body.into_response(),
//!     }
//! }
//! ```

use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::BoxResponseFuture;
use crate::error::PipelineError;

/// Minimum accepted client timeout (100ms).
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;

/// Maximum accepted client timeout (5 minutes).
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

/// Header name for a client-specified timeout.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// A validated client timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeout {
    pub duration: Duration,
    pub requested_ms: u64,
}

impl RequestTimeout {
    /// Returns `None` if `ms` is outside the accepted range.
    pub fn from_millis(ms: u64) -> Option<Self> {
        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&ms) {
            return None;
        }
        Some(Self {
            duration: Duration::from_millis(ms),
            requested_ms: ms,
        })
    }

    /// Parse the `X-Request-Timeout` header, if present and valid.
    pub fn from_request<B>(req: &Request<B>) -> Option<Self> {
        let value = req.headers().get(REQUEST_TIMEOUT_HEADER)?.to_str().ok()?;
        match value.trim().parse::<u64>() {
            Ok(ms) => {
                let timeout = Self::from_millis(ms);
                if timeout.is_none() {
                    debug!(
                        timeout_ms = ms,
                        min = MIN_REQUEST_TIMEOUT_MS,
                        max = MAX_REQUEST_TIMEOUT_MS,
                        "Client timeout outside allowed range, ignoring"
                    );
                }
                timeout
            }
            Err(_) => {
                debug!(value = value, "Invalid X-Request-Timeout header value, ignoring");
                None
            }
        }
    }
}

/// Deadline handed to the handler through request extensions.
#[derive(Debug, Clone)]
pub struct RequestDeadline {
    /// Effective timeout for this request.
    pub timeout: Duration,
    /// Cancelled when the deadline passes.
    pub cancellation: CancellationToken,
}

/// Effective timeout: the configured one, or a shorter client value.
pub fn effective_timeout<B>(req: &Request<B>, configured: Duration) -> Duration {
    RequestTimeout::from_request(req)
        .map(|t| t.duration.min(configured))
        .unwrap_or(configured)
}

/// Timeout guard layer.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

/// Timeout guard service.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Service<Request<Body>> for TimeoutService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxResponseFuture<S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let timeout = effective_timeout(&req, self.timeout);
        let cancellation = CancellationToken::new();
        req.extensions_mut().insert(RequestDeadline {
            timeout,
            cancellation: cancellation.clone(),
        });

        let path = req.uri().path().to_string();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match tokio::time::timeout(timeout, inner.call(req)).await {
                Ok(result) => result,
                Err(_) => {
                    cancellation.cancel();
                    warn!(
                        path = %path,
                        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "Handler exceeded deadline"
                    );
                    Ok(PipelineError::Timeout(timeout).into_response())
                }
            }
        })
    }
}
