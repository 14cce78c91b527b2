//! Rate limiting stage using fixed windows.
//!
//! # Algorithm
//!
//! Each key gets a counter and a window end. The first request in a window
//! starts it; requests are admitted while the counter is below the policy's
//! maximum; once saturated every request is rejected until the window ends,
//! at which point the next request starts a fresh window.
//!
//! # Keys
//!
//! The policy's key function decides the key; by default it is `ip:<addr>`
//! (see [`super::ip`]). Requests matched by a per-route policy are counted
//! under `<route prefix>|<key>`, so a tight login limit does not eat into the
//! global budget and vice versa.
//!
//! # Response Headers
//!
//! Admitted responses carry `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
//! `X-RateLimit-Reset` (Unix seconds). A rejection is a 429 with the same
//! headers plus `Retry-After`, and the handler is never invoked.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};
use axum::response::IntoResponse;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::warn;

use super::BoxResponseFuture;
use crate::config::MiddlewareConfig;
use crate::error::{
    PipelineError, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, retry_after_secs,
};
use crate::keys;
use crate::metrics;
use crate::store::{Admission, FixedWindowLimiter};

/// Rate limiting layer.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<FixedWindowLimiter>,
    config: Arc<MiddlewareConfig>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<FixedWindowLimiter>, config: Arc<MiddlewareConfig>) -> Self {
        Self { limiter, config }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            config: self.config.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<FixedWindowLimiter>,
    config: Arc<MiddlewareConfig>,
}

fn reset_timestamp(reset_in: std::time::Duration) -> i64 {
    let secs = i64::try_from(retry_after_secs(reset_in)).unwrap_or(i64::MAX);
    chrono::Utc::now().timestamp().saturating_add(secs)
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxResponseFuture<S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let (scope, policy) = self.config.rate_limit_for(req.uri().path());
        let base_key = policy.key_for(&req, &self.config.trusted_proxies);
        let key = match scope {
            Some(prefix) => keys::scoped_key(prefix, &base_key),
            None => base_key,
        };
        let limit = policy.max_admissions();

        match self.limiter.admit(&key, policy, Instant::now()) {
            Admission::Admitted {
                remaining,
                reset_in,
            } => {
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);

                Box::pin(async move {
                    let mut response = inner.call(req).await?;

                    let headers = response.headers_mut();
                    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
                    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
                    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_timestamp(reset_in)));

                    Ok(response)
                })
            }
            Admission::Rejected { retry_after } => {
                warn!(
                    key = %key,
                    path = %req.uri().path(),
                    retry_after_secs = retry_after_secs(retry_after),
                    "Rate limit exceeded"
                );
                metrics::record_rate_limit_rejection();

                let rejection = PipelineError::RateLimitExceeded {
                    retry_after,
                    limit,
                    reset_at: reset_timestamp(retry_after),
                    message: policy.message().to_string(),
                };
                Box::pin(std::future::ready(Ok(rejection.into_response())))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorResponse;
    use crate::policy::RateLimitPolicy;
    use axum::body::to_bytes;
    use axum::http::StatusCode;
    use axum::http::header::RETRY_AFTER;
    use std::convert::Infallible;
    use std::time::Duration;
    use tower::ServiceExt;

    fn ok_handler() -> impl Service<
        Request<Body>,
        Response = Response<Body>,
        Error = Infallible,
        Future: Send,
    > + Clone {
        tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from("ok")))
        })
    }

    fn from_ip(path: &str, ip: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    fn config(max: u32) -> MiddlewareConfig {
        MiddlewareConfig {
            rate_limit: RateLimitPolicy::new(Duration::from_secs(60), max).unwrap(),
            ..MiddlewareConfig::default()
        }
    }

    #[tokio::test]
    async fn test_admitted_response_has_headers() {
        let layer = RateLimitLayer::new(Arc::default(), Arc::new(config(5)));
        let response = layer
            .layer(ok_handler())
            .oneshot(from_ip("/", "1.2.3.4"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "5");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "4");
        assert!(response.headers().contains_key(X_RATELIMIT_RESET));
    }

    #[tokio::test]
    async fn test_rejection_shape() {
        let config = MiddlewareConfig {
            rate_limit: RateLimitPolicy::new(Duration::from_secs(60), 1)
                .unwrap()
                .with_message("Slow down."),
            ..MiddlewareConfig::default()
        };
        let service = RateLimitLayer::new(Arc::default(), Arc::new(config)).layer(ok_handler());

        service.clone().oneshot(from_ip("/", "1.2.3.4")).await.unwrap();
        let response = service.oneshot(from_ip("/", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "60");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error, "rate_limit_exceeded");
        assert_eq!(body.message, "Slow down.");
        assert_eq!(body.retry_after_secs, Some(60));
    }

    #[tokio::test]
    async fn test_clients_limited_independently() {
        let service =
            RateLimitLayer::new(Arc::default(), Arc::new(config(1))).layer(ok_handler());

        let first = service.clone().oneshot(from_ip("/", "1.1.1.1")).await.unwrap();
        let other = service.clone().oneshot(from_ip("/", "2.2.2.2")).await.unwrap();
        let again = service.oneshot(from_ip("/", "1.1.1.1")).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(other.status(), StatusCode::OK);
        assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_route_policy_uses_separate_counter() {
        let config = config(100).with_route_rate_limit(
            "/api/login",
            RateLimitPolicy::new(Duration::from_secs(60), 1).unwrap(),
        );
        let limiter = Arc::new(FixedWindowLimiter::new());
        let service = RateLimitLayer::new(limiter.clone(), Arc::new(config)).layer(ok_handler());

        let login = service
            .clone()
            .oneshot(from_ip("/api/login", "1.2.3.4"))
            .await
            .unwrap();
        let login_again = service
            .clone()
            .oneshot(from_ip("/api/login", "1.2.3.4"))
            .await
            .unwrap();
        let elsewhere = service.oneshot(from_ip("/api/products", "1.2.3.4")).await.unwrap();

        assert_eq!(login.status(), StatusCode::OK);
        assert_eq!(login_again.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(elsewhere.status(), StatusCode::OK);
        assert_eq!(limiter.tracked_keys(), 2);
        assert!(
            limiter
                .entry("/api/login|ip:1.2.3.4", Instant::now())
                .is_some()
        );
    }
}
