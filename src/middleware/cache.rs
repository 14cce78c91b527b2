//! Response cache stage.
//!
//! A hit is answered straight from the store; nothing inside this stage runs.
//! On a miss the request proceeds, and the response is stored afterwards when
//! all of the following hold:
//!
//! - the route has a non-zero TTL
//! - the request is `GET`/`HEAD` without `Authorization` or `Cookie`
//! - the response is a 2xx that the pipeline did not mark as a failure
//! - the response has no `Set-Cookie` and no `Cache-Control: no-store|private`
//! - the body's declared size is known and within the configured maximum
//!
//! Responses carry `X-Cache: HIT`, `MISS` or `BYPASS` (eligible route,
//! ineligible request). Stored copies drop per-client rate-limit headers.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, HttpBody, to_bytes};
use axum::http::header::{CACHE_CONTROL, RETRY_AFTER, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Request, Response};
use axum::response::IntoResponse;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::BoxResponseFuture;
use crate::config::MiddlewareConfig;
use crate::error::{
    FailureNote, RaisedFailure, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
    normalize_boxed_error,
};
use crate::keys;
use crate::metrics;
use crate::store::cache::X_CACHE;
use crate::store::{CachedResponse, ResponseCache};

/// Response cache layer.
#[derive(Clone)]
pub struct CacheLayer {
    cache: Arc<ResponseCache>,
    config: Arc<MiddlewareConfig>,
}

impl CacheLayer {
    pub fn new(cache: Arc<ResponseCache>, config: Arc<MiddlewareConfig>) -> Self {
        Self { cache, config }
    }
}

impl<S> Layer<S> for CacheLayer {
    type Service = CacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            cache: self.cache.clone(),
            config: self.config.clone(),
        }
    }
}

/// Response cache service.
#[derive(Clone)]
pub struct CacheService<S> {
    inner: S,
    cache: Arc<ResponseCache>,
    config: Arc<MiddlewareConfig>,
}

/// Whether the response's own headers allow shared caching.
fn is_storable(headers: &HeaderMap) -> bool {
    if headers.contains_key(SET_COOKIE) {
        return false;
    }
    !headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| directive == "no-store" || directive == "private")
}

fn is_successful_pass_through(response: &Response<Body>) -> bool {
    response.status().is_success()
        && response.extensions().get::<FailureNote>().is_none()
        && response.extensions().get::<RaisedFailure>().is_none()
}

fn mark(response: &mut Response<Body>, value: &'static str) {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(value));
}

impl<S> Service<Request<Body>> for CacheService<S>
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
        let ttl = self.config.cache_ttl_for(req.uri().path());
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if ttl.is_zero() {
            return Box::pin(async move { inner.call(req).await });
        }

        if !keys::is_cacheable_request(&req) {
            return Box::pin(async move {
                let mut response = inner.call(req).await?;
                mark(&mut response, "BYPASS");
                Ok(response)
            });
        }

        let key = keys::cache_key(&req);
        let now = Instant::now();
        if let Some(entry) = self.cache.lookup(&key, now) {
            debug!(key = %key, "Cache hit");
            metrics::record_cache_lookup("hit");
            return Box::pin(std::future::ready(Ok(entry.to_response(now))));
        }
        metrics::record_cache_lookup("miss");

        let cache = self.cache.clone();
        let max_body_bytes = self.config.cache_max_body_bytes;
        let diagnostics = self.config.diagnostics;

        Box::pin(async move {
            let mut response = inner.call(req).await?;

            let fits = response
                .body()
                .size_hint()
                .upper()
                .is_some_and(|upper| upper <= u64::try_from(max_body_bytes).unwrap_or(u64::MAX));
            if !(is_successful_pass_through(&response) && is_storable(response.headers()) && fits)
            {
                mark(&mut response, "MISS");
                return Ok(response);
            }

            let (mut parts, body) = response.into_parts();
            let payload = match to_bytes(body, max_body_bytes).await {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(key = %key, error = %err, "Failed to buffer response for caching");
                    return Ok(normalize_boxed_error(&err.into(), diagnostics).into_response());
                }
            };

            let mut stored_headers = parts.headers.clone();
            for name in [X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, RETRY_AFTER] {
                stored_headers.remove(name);
            }
            cache.store(
                &key,
                CachedResponse {
                    status: parts.status,
                    headers: stored_headers,
                    payload: payload.clone(),
                },
                ttl,
                Instant::now(),
            );

            parts
                .headers
                .insert(X_CACHE, HeaderValue::from_static("MISS"));
            Ok(Response::from_parts(parts, Body::from(payload)))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use axum::http::{Method, StatusCode};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn cached_config() -> Arc<MiddlewareConfig> {
        Arc::new(MiddlewareConfig::default().with_route_cache_ttl("/api", Duration::from_secs(60)))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_storable_headers() {
        let mut headers = HeaderMap::new();
        assert!(is_storable(&headers));

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=60"));
        assert!(is_storable(&headers));

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("No-Store"));
        assert!(!is_storable(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(SET_COOKIE, HeaderValue::from_static("session=abc"));
        assert!(!is_storable(&headers));
    }

    #[tokio::test]
    async fn test_second_request_is_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = tower::service_fn(move |_req: Request<Body>| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, Infallible>(Response::new(Body::from(format!("call {n}")))) }
        });
        let cache = Arc::new(ResponseCache::new(100));
        let service = CacheLayer::new(cache.clone(), cached_config()).layer(handler);

        let first = service.clone().oneshot(get("/api/products")).await.unwrap();
        assert_eq!(first.headers()[X_CACHE], "MISS");

        let second = service.oneshot(get("/api/products")).await.unwrap();
        assert_eq!(second.headers()[X_CACHE], "HIT");
        let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"call 0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_never_cached() {
        let handler = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(HandlerError::new("database unavailable").into_response())
        });
        let cache = Arc::new(ResponseCache::new(100));
        let service = CacheLayer::new(cache.clone(), cached_config()).layer(handler);

        let response = service.oneshot(get("/api/products")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_non_get_and_uncached_routes_bypass() {
        let handler = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from("ok")))
        });
        let cache = Arc::new(ResponseCache::new(100));
        let service = CacheLayer::new(cache.clone(), cached_config()).layer(handler);

        let post = Request::builder()
            .method(Method::POST)
            .uri("/api/products")
            .body(Body::empty())
            .unwrap();
        let response = service.clone().oneshot(post).await.unwrap();
        assert_eq!(response.headers()[X_CACHE], "BYPASS");

        let response = service.oneshot(get("/health")).await.unwrap();
        assert!(!response.headers().contains_key(X_CACHE));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_stored_copy_drops_rate_limit_headers() {
        let handler = tower::service_fn(|_req: Request<Body>| async {
            let mut response = Response::new(Body::from("ok"));
            response
                .headers_mut()
                .insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("3"));
            Ok::<_, Infallible>(response)
        });
        let cache = Arc::new(ResponseCache::new(100));
        let service = CacheLayer::new(cache.clone(), cached_config()).layer(handler);

        let response = service.oneshot(get("/api/products")).await.unwrap();
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "3");

        let key = keys::cache_key(&get("/api/products"));
        let entry = cache.lookup(&key, Instant::now()).unwrap();
        assert!(!entry.response.headers.contains_key(X_RATELIMIT_REMAINING));
    }
}
