//! Performance recorder stage.
//!
//! Outermost stage: times the whole chain, opens the `request` span and hands
//! one [`OutcomeRecord`] per request to the configured recorder. Failure
//! details come from the note left on failure responses by inner stages.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{Instrument, debug, info_span};

use super::BoxResponseFuture;
use crate::recorder::{OutcomeRecord, PerformanceRecorder};

/// Performance recorder layer.
#[derive(Clone)]
pub struct PerformanceLayer {
    recorder: Arc<dyn PerformanceRecorder>,
}

impl PerformanceLayer {
    pub fn new(recorder: Arc<dyn PerformanceRecorder>) -> Self {
        Self { recorder }
    }
}

impl<S> Layer<S> for PerformanceLayer {
    type Service = PerformanceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PerformanceService {
            inner,
            recorder: self.recorder.clone(),
        }
    }
}

/// Performance recorder service.
#[derive(Clone)]
pub struct PerformanceService<S> {
    inner: S,
    recorder: Arc<dyn PerformanceRecorder>,
}

impl<S> Service<Request<Body>> for PerformanceService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: std::fmt::Display,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxResponseFuture<S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let span = info_span!("request", method = %method, path = %path);
        let recorder = self.recorder.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let start = Instant::now();

        Box::pin(
            async move {
                let result = inner.call(req).await;
                let elapsed = start.elapsed();

                let record = match &result {
                    Ok(response) => OutcomeRecord::from_response(&method, &path, elapsed, response),
                    Err(err) => OutcomeRecord::failure(
                        &method,
                        &path,
                        elapsed,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        err.to_string(),
                    ),
                };
                debug!(
                    status = record.status_code,
                    duration_ms = record.duration_ms,
                    success = record.success,
                    "Request completed"
                );
                recorder.record(&record);

                result
            }
            .instrument(span),
        )
    }
}
