//! Error normalizer: the innermost safety net.
//!
//! Converts every failure raised by the handler into a structured error
//! response, exactly once:
//!
//! - an `Err` returned by a `tower::Service` handler
//! - a [`HandlerError`](crate::error::HandlerError) returned through
//!   `IntoResponse` by an axum handler (carried as [`RaisedFailure`])
//! - a panic while producing the response
//!
//! Responses a handler builds on purpose (including plain 4xx/5xx status
//! responses) pass through untouched. The service error type is
//! [`Infallible`]: nothing escapes unconverted.
//!
//! When performance monitoring is disabled the outer recorder never runs, so
//! the normalizer reports its failures to the recorder it was given directly.

use std::any::Any;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use futures_util::FutureExt;
use tokio::time::Instant;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{error, warn};

use super::BoxResponseFuture;
use crate::error::{
    PipelineError, RaisedFailure, normalize_boxed_error, normalize_handler_error, normalize_panic,
};
use crate::recorder::{OutcomeRecord, PerformanceRecorder};

/// Error normalizer layer.
#[derive(Clone, Default)]
pub struct ErrorNormalizerLayer {
    diagnostics: bool,
    recorder: Option<Arc<dyn PerformanceRecorder>>,
}

impl ErrorNormalizerLayer {
    pub fn new(diagnostics: bool) -> Self {
        Self {
            diagnostics,
            recorder: None,
        }
    }

    /// Report normalized failures directly to `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn PerformanceRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }
}

impl<S> Layer<S> for ErrorNormalizerLayer {
    type Service = ErrorNormalizerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorNormalizerService {
            inner,
            diagnostics: self.diagnostics,
            recorder: self.recorder.clone(),
        }
    }
}

/// Error normalizer service.
#[derive(Clone)]
pub struct ErrorNormalizerService<S> {
    inner: S,
    diagnostics: bool,
    recorder: Option<Arc<dyn PerformanceRecorder>>,
}

/// Best-effort text from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_failure(failure: &PipelineError, method: &str, path: &str) {
    if failure.status().is_server_error() {
        error!(
            method = %method,
            path = %path,
            status = failure.status().as_u16(),
            error = %failure,
            "Handler failed"
        );
    } else {
        warn!(
            method = %method,
            path = %path,
            status = failure.status().as_u16(),
            error = %failure,
            "Handler rejected request"
        );
    }
}

impl<S> Service<Request<Body>> for ErrorNormalizerService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxResponseFuture<Infallible>;

    // Readiness of the handler is awaited inside the call so a failing
    // `poll_ready` is normalized like any other handler failure.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        let diagnostics = self.diagnostics;
        let recorder = self.recorder.clone();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let start = Instant::now();

        Box::pin(async move {
            let outcome = AssertUnwindSafe(inner.oneshot(req)).catch_unwind().await;

            let failure = match outcome {
                Ok(Ok(response)) => match response.extensions().get::<RaisedFailure>() {
                    Some(RaisedFailure(raised)) => normalize_handler_error(raised, diagnostics),
                    None => return Ok(response),
                },
                Ok(Err(err)) => normalize_boxed_error(&err.into(), diagnostics),
                Err(payload) => normalize_panic(&panic_message(&*payload), diagnostics),
            };

            log_failure(&failure, method.as_str(), &path);
            if let Some(recorder) = recorder {
                recorder.record(&OutcomeRecord::failure(
                    &method,
                    &path,
                    start.elapsed(),
                    failure.status(),
                    failure.to_string(),
                ));
            }

            Ok(failure.into_response())
        })
    }
}
