//! Per-request outcome records and the sinks that receive them.
//!
//! Every request that enters a pipeline produces exactly one
//! [`OutcomeRecord`]. It is handed to a [`PerformanceRecorder`]; the pipeline
//! installs [`OutcomeStats`] (health surface) and [`MetricsRecorder`]
//! (Prometheus) by default and fans out to any extra recorder supplied by the
//! embedding application.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::http::header::CONTENT_ENCODING;
use axum::http::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::FailureNote;
use crate::metrics;
use crate::store::cache::X_CACHE;

/// Tag naming how the response cache treated the request.
pub const TAG_CACHE: &str = "cache";
/// Tag naming the response content coding.
pub const TAG_ENCODING: &str = "encoding";

/// What happened to one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeRecord {
    pub method: String,
    pub path: String,
    pub duration_ms: f64,
    pub status_code: u16,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_out: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl OutcomeRecord {
    /// Build a record from a finished response.
    ///
    /// Failure details come from the [`FailureNote`] the pipeline leaves on
    /// every failure response; cache and encoding tags from response headers.
    pub fn from_response(
        method: &Method,
        path: &str,
        elapsed: Duration,
        response: &Response<Body>,
    ) -> Self {
        let note = response.extensions().get::<FailureNote>();
        let status = response.status();

        let mut tags = BTreeMap::new();
        if let Some(cache) = response
            .headers()
            .get(X_CACHE)
            .and_then(|v| v.to_str().ok())
        {
            tags.insert(TAG_CACHE.to_string(), cache.to_ascii_lowercase());
        }
        let encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("identity");
        tags.insert(TAG_ENCODING.to_string(), encoding.to_string());

        Self {
            method: method.to_string(),
            path: path.to_string(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            status_code: status.as_u16(),
            success: note.is_none() && is_success(status),
            error_message: note.map(|n| n.message.clone()),
            bytes_out: response.body().size_hint().exact(),
            tags,
        }
    }

    /// Record for a failure that never became a response seen by the outer stages.
    pub fn failure(
        method: &Method,
        path: &str,
        elapsed: Duration,
        status: StatusCode,
        error_message: String,
    ) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            status_code: status.as_u16(),
            success: false,
            error_message: Some(error_message),
            bytes_out: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }
}

fn is_success(status: StatusCode) -> bool {
    status.as_u16() < 400
}

/// Sink for outcome records. Called once per request, possibly concurrently.
pub trait PerformanceRecorder: Send + Sync {
    fn record(&self, outcome: &OutcomeRecord);
}

/// Any `Fn(&OutcomeRecord)` closure is a recorder.
impl<F> PerformanceRecorder for F
where
    F: Fn(&OutcomeRecord) + Send + Sync,
{
    fn record(&self, outcome: &OutcomeRecord) {
        self(outcome)
    }
}

/// Forwards each record to several recorders in order.
#[derive(Clone, Default)]
pub struct Recorders(Vec<Arc<dyn PerformanceRecorder>>);

impl Recorders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, recorder: Arc<dyn PerformanceRecorder>) {
        self.0.push(recorder);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Recorders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorders")
            .field("count", &self.0.len())
            .finish()
    }
}

impl PerformanceRecorder for Recorders {
    fn record(&self, outcome: &OutcomeRecord) {
        for recorder in &self.0 {
            recorder.record(outcome);
        }
    }
}

/// Emits outcomes through the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl PerformanceRecorder for MetricsRecorder {
    fn record(&self, outcome: &OutcomeRecord) {
        metrics::record_outcome(outcome);
    }
}

/// Lock-free aggregate counters over all recorded outcomes.
#[derive(Debug, Default)]
pub struct OutcomeStats {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    rate_limited: AtomicU64,
    timed_out: AtomicU64,
    payload_too_large: AtomicU64,
    server_errors: AtomicU64,
    cache_hits: AtomicU64,
    total_duration_us: AtomicU64,
}

/// Point-in-time view of [`OutcomeStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub rate_limited: u64,
    pub timed_out: u64,
    pub payload_too_large: u64,
    pub server_errors: u64,
    pub cache_hits: u64,
    pub mean_duration_ms: f64,
}

impl OutcomeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> OutcomeSummary {
        let total = self.total.load(Ordering::Relaxed);
        let duration_us = self.total_duration_us.load(Ordering::Relaxed);
        let mean_duration_ms = if total == 0 {
            0.0
        } else {
            duration_us as f64 / total as f64 / 1000.0
        };

        OutcomeSummary {
            total,
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            payload_too_large: self.payload_too_large.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            mean_duration_ms,
        }
    }
}

impl PerformanceRecorder for OutcomeStats {
    fn record(&self, outcome: &OutcomeRecord) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if outcome.success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }

        let counter = match StatusCode::from_u16(outcome.status_code) {
            Ok(StatusCode::TOO_MANY_REQUESTS) => Some(&self.rate_limited),
            Ok(StatusCode::REQUEST_TIMEOUT) => Some(&self.timed_out),
            Ok(StatusCode::PAYLOAD_TOO_LARGE) => Some(&self.payload_too_large),
            Ok(s) if s.is_server_error() => Some(&self.server_errors),
            _ => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        if outcome.tag(TAG_CACHE) == Some("hit") {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }

        // Saturates at u64::MAX microseconds
        let micros = (outcome.duration_ms * 1000.0) as u64;
        self.total_duration_us.fetch_add(micros, Ordering::Relaxed);
    }
}
