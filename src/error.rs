use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{HeaderName, RETRY_AFTER};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error type accepted from terminal handlers.
pub type BoxError = tower::BoxError;

/// Header carrying the admissions allowed per window.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Header carrying the admissions left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Header carrying the Unix time (seconds) at which the current window resets.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Safe client-facing text for server-side failures.
const INTERNAL_ERROR_MESSAGE: &str =
    "An internal error occurred. Please contact support if the issue persists.";

/// Failures produced by the pipeline itself.
///
/// The first four variants are *expected* outcomes: a guard decided not to
/// admit the request and answered on its own. `UnhandledHandlerFailure` is
/// produced only by the error normalizer, once, for anything the handler
/// raised.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Time until the current window resets.
        retry_after: Duration,
        /// Admissions allowed per window.
        limit: u32,
        /// Unix time (seconds) at which the window resets.
        reset_at: i64,
        /// Policy's human-readable rejection message.
        message: String,
    },

    #[error("Declared body of {declared} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { declared: u64, limit: u64 },

    #[error("Handler did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Invalid request: {0}")]
    ValidationFailed(String),

    #[error("Unhandled handler failure: {cause}")]
    UnhandledHandlerFailure {
        status: StatusCode,
        /// Client-safe message.
        message: String,
        /// Full diagnostic detail, present only in diagnostics mode.
        details: Option<String>,
        /// Internal description, logged and recorded but never sent.
        cause: String,
    },
}

impl PipelineError {
    /// HTTP status for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            PipelineError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            PipelineError::UnhandledHandlerFailure { status, .. } => *status,
        }
    }

    /// Machine-readable error code placed in the `error` field of the body.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            PipelineError::PayloadTooLarge { .. } => "payload_too_large",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::ValidationFailed(_) => "validation_failed",
            PipelineError::UnhandledHandlerFailure { status, .. } => code_for_status(*status),
        }
    }

    fn body(&self) -> ErrorResponse {
        let mut body = ErrorResponse {
            error: self.code().to_string(),
            message: String::new(),
            details: None,
            retry_after_secs: None,
            limit: None,
            limit_bytes: None,
            timeout_ms: None,
        };

        match self {
            PipelineError::RateLimitExceeded {
                retry_after,
                limit,
                message,
                ..
            } => {
                body.message = message.clone();
                body.retry_after_secs = Some(retry_after_secs(*retry_after));
                body.limit = Some(u64::from(*limit));
            }
            PipelineError::PayloadTooLarge { limit, .. } => {
                body.message = format!("Request body exceeds the maximum of {limit} bytes.");
                body.limit_bytes = Some(*limit);
            }
            PipelineError::Timeout(after) => {
                body.message = "The request did not complete in time.".to_string();
                body.timeout_ms = Some(u64::try_from(after.as_millis()).unwrap_or(u64::MAX));
            }
            PipelineError::ValidationFailed(reason) => {
                body.message = reason.clone();
            }
            PipelineError::UnhandledHandlerFailure {
                message, details, ..
            } => {
                body.message = message.clone();
                body.details = details.clone();
            }
        }

        body
    }
}

/// Stable error body returned on every failure path.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Marker left on every response the pipeline produced for a failure.
///
/// The performance stage reads it to fill in the outcome's error message, and
/// the response cache refuses to store any response carrying it.
#[derive(Debug, Clone)]
pub struct FailureNote {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = self.body();
        let mut response = (status, axum::Json(body)).into_response();

        if let PipelineError::RateLimitExceeded {
            retry_after,
            limit,
            reset_at,
            ..
        } = &self
        {
            let headers = response.headers_mut();
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(*retry_after)));
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(*limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(*reset_at));
        }

        response.extensions_mut().insert(FailureNote {
            code: self.code(),
            message: self.to_string(),
        });
        response
    }
}

/// Whole seconds until `retry_after` elapses, rounded up and never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

fn code_for_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "bad_request",
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::FORBIDDEN => "forbidden",
        StatusCode::NOT_FOUND => "not_found",
        StatusCode::CONFLICT => "conflict",
        StatusCode::UNPROCESSABLE_ENTITY => "unprocessable_entity",
        StatusCode::SERVICE_UNAVAILABLE => "service_unavailable",
        s if s.is_client_error() => "client_error",
        _ => "internal_error",
    }
}

// =============================================================================
// Handler failures
// =============================================================================

/// Failure raised by a business handler.
///
/// Handlers written as `tower` services return it (or anything convertible to
/// [`BoxError`]) as their error. Axum handlers can `?` it directly: its
/// `IntoResponse` form carries the failure on the response so the error
/// normalizer still converts it exactly once.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    status: Option<StatusCode>,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl HandlerError {
    /// A failure with no declared status (normalized to 500).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// A failure declaring its own status code.
    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, message)
    }

    /// Wrap a lower-level error, keeping it as the source.
    pub fn from_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            status: None,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Declared status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: None,
            message: err.to_string(),
            source: Some(err.into()),
        }
    }
}

/// Response extension carrying a failure raised through `IntoResponse`.
#[derive(Debug, Clone)]
pub struct RaisedFailure(pub Arc<HandlerError>);

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let status = self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = status.into_response();
        response
            .extensions_mut()
            .insert(RaisedFailure(Arc::new(self)));
        response
    }
}

/// Convenience alias for handler results.
pub type HandlerResult<T> = Result<T, HandlerError>;

// =============================================================================
// Normalization
// =============================================================================

/// Convert a handler failure into the structured pipeline failure.
///
/// Declared client errors keep the handler's message; server errors get a
/// generic message. The error chain is attached only when `diagnostics` is on.
pub fn normalize_handler_error(err: &HandlerError, diagnostics: bool) -> PipelineError {
    let status = err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = if status.is_server_error() {
        INTERNAL_ERROR_MESSAGE.to_string()
    } else {
        err.message().to_string()
    };

    PipelineError::UnhandledHandlerFailure {
        status,
        message,
        details: diagnostics.then(|| error_chain(err)),
        cause: error_chain(err),
    }
}

/// Convert an arbitrary service error into the structured pipeline failure.
pub fn normalize_boxed_error(err: &BoxError, diagnostics: bool) -> PipelineError {
    if let Some(handler_err) = err.downcast_ref::<HandlerError>() {
        return normalize_handler_error(handler_err, diagnostics);
    }

    let chain = error_chain(&**err);
    PipelineError::UnhandledHandlerFailure {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: INTERNAL_ERROR_MESSAGE.to_string(),
        details: diagnostics.then(|| chain.clone()),
        cause: chain,
    }
}

/// Convert a caught panic payload into the structured pipeline failure.
pub fn normalize_panic(panic_message: &str, diagnostics: bool) -> PipelineError {
    let cause = format!("handler panicked: {panic_message}");
    PipelineError::UnhandledHandlerFailure {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: INTERNAL_ERROR_MESSAGE.to_string(),
        details: diagnostics.then(|| cause.clone()),
        cause,
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    std::iter::successors(Some(err), |e| e.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

// =============================================================================
// Configuration failures
// =============================================================================

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Configuration error: {0}")]
    Constraint(String),

    #[error("Invalid rate limit policy: {0}")]
    Policy(#[from] crate::policy::PolicyError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(response: Response) -> ErrorResponse {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(3)), 3);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_response_shape() {
        let err = PipelineError::RateLimitExceeded {
            retry_after: Duration::from_millis(2500),
            limit: 100,
            reset_at: 1_700_000_000,
            message: "slow down".to_string(),
        };
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "3");
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "100");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(response.headers()[X_RATELIMIT_RESET], "1700000000");
        assert!(response.extensions().get::<FailureNote>().is_some());

        let body = body_of(response).await;
        assert_eq!(body.error, "rate_limit_exceeded");
        assert_eq!(body.message, "slow down");
        assert_eq!(body.retry_after_secs, Some(3));
    }

    #[tokio::test]
    async fn test_payload_too_large_carries_ceiling() {
        let response = PipelineError::PayloadTooLarge {
            declared: 2048,
            limit: 1024,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = body_of(response).await;
        assert_eq!(body.error, "payload_too_large");
        assert_eq!(body.limit_bytes, Some(1024));
    }

    #[test]
    fn test_handler_error_declared_client_status_keeps_message() {
        let err = HandlerError::not_found("Product 7 not found");
        let normalized = normalize_handler_error(&err, false);

        assert_eq!(normalized.status(), StatusCode::NOT_FOUND);
        assert_eq!(normalized.code(), "not_found");
        match normalized {
            PipelineError::UnhandledHandlerFailure {
                message, details, ..
            } => {
                assert_eq!(message, "Product 7 not found");
                assert!(details.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_server_error_message_is_sanitized() {
        let err = HandlerError::from_source(
            "ledger write failed",
            std::io::Error::other("disk quota exceeded on /var/lib/db"),
        );
        let normalized = normalize_handler_error(&err, false);

        match normalized {
            PipelineError::UnhandledHandlerFailure {
                status,
                message,
                details,
                cause,
            } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert!(!message.contains("disk quota"));
                assert!(details.is_none());
                assert!(cause.contains("ledger write failed"));
                assert!(cause.contains("disk quota exceeded"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_diagnostics_mode_includes_chain() {
        let err = HandlerError::from_source("outer", std::io::Error::other("inner"));
        let normalized = normalize_handler_error(&err, true);

        match normalized {
            PipelineError::UnhandledHandlerFailure { details, .. } => {
                assert_eq!(details.as_deref(), Some("outer: inner"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_boxed_error_downcasts_handler_error() {
        let boxed: BoxError = Box::new(HandlerError::bad_request("missing sku"));
        let normalized = normalize_boxed_error(&boxed, false);
        assert_eq!(normalized.status(), StatusCode::BAD_REQUEST);

        let opaque: BoxError = "socket closed".into();
        let normalized = normalize_boxed_error(&opaque, false);
        assert_eq!(normalized.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_handler_error_into_response_carries_failure() {
        let response = HandlerError::with_status(StatusCode::CONFLICT, "duplicate").into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let raised = response.extensions().get::<RaisedFailure>().unwrap();
        assert_eq!(raised.0.message(), "duplicate");
    }

    #[test]
    fn test_from_anyhow_keeps_message() {
        let err: HandlerError = anyhow::anyhow!("upstream refused").into();
        assert_eq!(err.message(), "upstream refused");
        assert!(err.status().is_none());
    }
}
