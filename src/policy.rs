//! Rate-limit policies and per-route overrides.
//!
//! A [`RateLimitPolicy`] describes one fixed window: how long it lasts, how
//! many admissions it grants, the message sent on rejection, and how a request
//! maps to a counter key. [`RouteOverrides`] maps path prefixes to
//! route-specific values (policies or cache TTLs) by longest-prefix match.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use thiserror::Error;

use crate::keys;
use crate::middleware::ip::TrustedProxyConfig;

/// Derives a rate-limit key from a request.
pub type KeyFn = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// Error type for rate-limit policy construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("window duration must be greater than zero")]
    ZeroWindow,
    #[error("max admissions must be greater than zero; disable rate limiting instead")]
    ZeroAdmissions,
}

/// Fixed-window rate-limit policy.
#[derive(Clone)]
pub struct RateLimitPolicy {
    window: Duration,
    max_admissions: u32,
    message: Arc<str>,
    key_fn: Option<KeyFn>,
}

impl RateLimitPolicy {
    /// Default window: 15 minutes.
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);
    /// Default admissions per window.
    pub const DEFAULT_MAX_ADMISSIONS: u32 = 100;
    /// Default rejection message.
    pub const DEFAULT_MESSAGE: &'static str = "Too many requests, please try again later.";

    /// Create a policy admitting `max_admissions` requests per `window`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if either value is zero.
    pub fn new(window: Duration, max_admissions: u32) -> Result<Self, PolicyError> {
        if window.is_zero() {
            return Err(PolicyError::ZeroWindow);
        }
        if max_admissions == 0 {
            return Err(PolicyError::ZeroAdmissions);
        }
        Ok(Self {
            window,
            max_admissions,
            message: Arc::from(Self::DEFAULT_MESSAGE),
            key_fn: None,
        })
    }

    /// Replace the human-readable rejection message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Arc::from(message.into());
        self
    }

    /// Replace the key function. Without one, requests are keyed by client IP.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Request<Body>) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_admissions(&self) -> u32 {
        self.max_admissions
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Compute the counter key for `req` under this policy.
    pub fn key_for(&self, req: &Request<Body>, trusted_proxies: &TrustedProxyConfig) -> String {
        match &self.key_fn {
            Some(key_fn) => key_fn(req),
            None => keys::rate_limit_key(req, trusted_proxies),
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window: Self::DEFAULT_WINDOW,
            max_admissions: Self::DEFAULT_MAX_ADMISSIONS,
            message: Arc::from(Self::DEFAULT_MESSAGE),
            key_fn: None,
        }
    }
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("window", &self.window)
            .field("max_admissions", &self.max_admissions)
            .field("message", &self.message)
            .field("custom_key_fn", &self.key_fn.is_some())
            .finish()
    }
}

/// Whether responses served from the cache consume a rate-limit admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheHitPolicy {
    /// Cached content is free: the cache sits outside the rate limiter and a
    /// hit never reaches it.
    #[default]
    Free,
    /// Every request is counted: the rate limiter sits outside the cache.
    CountsAgainstQuota,
}

/// Path-prefix table resolved by longest match.
///
/// A prefix matches a path when they are equal or when the path continues
/// with a `/` right after the prefix, so `/api/products` matches
/// `/api/products/7` but not `/api/productsearch`.
#[derive(Debug, Clone)]
pub struct RouteOverrides<T> {
    // Sorted by prefix length, longest first.
    entries: Vec<(String, T)>,
}

impl<T> Default for RouteOverrides<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> RouteOverrides<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the value for `prefix`.
    pub fn insert(&mut self, prefix: impl Into<String>, value: T) {
        let prefix = normalize_prefix(prefix.into());
        if let Some(existing) = self.entries.iter_mut().find(|(p, _)| *p == prefix) {
            existing.1 = value;
            return;
        }
        self.entries.push((prefix, value));
        self.entries
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    }

    /// Find the most specific entry for `path`, returning its prefix and value.
    pub fn resolve(&self, path: &str) -> Option<(&str, &T)> {
        self.entries
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(prefix, value)| (prefix.as_str(), value))
    }

    /// Prefixes and values, most specific first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(prefix, value)| (prefix.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_prefix(prefix: String) -> String {
    let trimmed = prefix.trim();
    let trimmed = if trimmed.len() > 1 {
        trimmed.trim_end_matches('/')
    } else {
        trimmed
    };
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
