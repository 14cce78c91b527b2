//! Request size guard.
//!
//! Rejects a request whose declared `Content-Length` exceeds the configured
//! ceiling. The body itself is never read; requests without a declared length
//! (chunked uploads) pass through.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::CONTENT_LENGTH;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::warn;

use super::BoxResponseFuture;
use crate::error::PipelineError;

/// Request size guard layer.
#[derive(Debug, Clone, Copy)]
pub struct RequestSizeLayer {
    max_body_bytes: u64,
}

impl RequestSizeLayer {
    pub fn new(max_body_bytes: u64) -> Self {
        Self { max_body_bytes }
    }
}

impl<S> Layer<S> for RequestSizeLayer {
    type Service = RequestSizeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestSizeService {
            inner,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

/// Request size guard service.
#[derive(Debug, Clone)]
pub struct RequestSizeService<S> {
    inner: S,
    max_body_bytes: u64,
}

/// Check the declared length of `req` against `limit`.
pub fn check_declared_size<B>(req: &Request<B>, limit: u64) -> Result<(), PipelineError> {
    let Some(value) = req.headers().get(CONTENT_LENGTH) else {
        return Ok(());
    };

    let declared = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            PipelineError::ValidationFailed("Content-Length header is not a valid length".into())
        })?;

    if declared > limit {
        return Err(PipelineError::PayloadTooLarge { declared, limit });
    }
    Ok(())
}

impl<S> Service<Request<Body>> for RequestSizeService<S>
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
        if let Err(rejection) = check_declared_size(&req, self.max_body_bytes) {
            warn!(
                path = %req.uri().path(),
                error = %rejection,
                "Request rejected by size guard"
            );
            return Box::pin(std::future::ready(Ok(rejection.into_response())));
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(req).await })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn with_length(value: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .header(CONTENT_LENGTH, value)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_declared_size_checks() {
        assert!(check_declared_size(&with_length("1024"), 1024).is_ok());
        assert!(matches!(
            check_declared_size(&with_length("1025"), 1024),
            Err(PipelineError::PayloadTooLarge {
                declared: 1025,
                limit: 1024
            })
        ));
        assert!(matches!(
            check_declared_size(&with_length("lots"), 1024),
            Err(PipelineError::ValidationFailed(_))
        ));
        assert!(check_declared_size(&Request::new(Body::empty()), 0).is_ok());
    }

    #[tokio::test]
    async fn test_oversized_request_never_reaches_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = tower::service_fn(move |_req: Request<Body>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Infallible>(Response::new(Body::empty())) }
        });

        let service = RequestSizeLayer::new(10).layer(handler);

        let response = service
            .clone()
            .oneshot(with_length("11"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let response = service.oneshot(with_length("10")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_over_fallible_handler() {
        let handler = tower::service_fn(|_req: Request<Body>| async {
            Err::<Response<Body>, tower::BoxError>("handler must not run".into())
        });

        let service = RequestSizeLayer::new(10).layer(handler);
        let response = service.oneshot(with_length("11")).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
