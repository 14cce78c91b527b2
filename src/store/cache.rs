//! TTL response cache.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::{AGE, HeaderName};
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

/// Header marking whether a response came from the cache.
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// A fully buffered response ready to be replayed.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

/// Immutable cache entry. Replaced wholesale, never mutated in place.
#[derive(Debug)]
pub struct CacheEntry {
    pub response: CachedResponse,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }

    /// Rebuild the response, annotated with `X-Cache: HIT` and `Age`.
    pub fn to_response(&self, now: Instant) -> Response<Body> {
        let mut response = Response::new(Body::from(self.response.payload.clone()));
        *response.status_mut() = self.response.status;
        *response.headers_mut() = self.response.headers.clone();

        let headers = response.headers_mut();
        headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
        headers.insert(AGE, HeaderValue::from(self.age(now).as_secs()));
        response
    }
}

/// Keyed response cache with per-entry TTL and a capacity bound.
///
/// The bound is soft. Making room and inserting are separate map operations,
/// so concurrent stores of new keys can briefly overshoot `max_entries` by up
/// to the number of racing writers; the next store at capacity evicts back
/// down. Eviction scans every entry, so a store at capacity is O(n).
#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Live entry for `key`. An expired entry is removed and reported as a miss.
    pub fn lookup(&self, key: &str, now: Instant) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.get(key).map(|e| Arc::clone(e.value()))?;
        if entry.is_live(now) {
            return Some(entry);
        }

        self.entries
            .remove_if(key, |_, current| !current.is_live(now));
        None
    }

    /// Store `response` under `key` for `ttl`.
    ///
    /// A zero TTL stores nothing. Returns whether the entry was written.
    pub fn store(&self, key: &str, response: CachedResponse, ttl: Duration, now: Instant) -> bool {
        if ttl.is_zero() || self.max_entries == 0 {
            return false;
        }

        if !self.entries.contains_key(key) {
            self.make_room(now);
        }

        let entry = CacheEntry {
            response,
            stored_at: now,
            expires_at: super::expiry(now, ttl),
        };
        self.entries.insert(key.to_string(), Arc::new(entry));
        debug!(key = key, ttl_secs = ttl.as_secs(), "Cached response");
        true
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    // Purge expired entries first; if still full, evict whichever entry
    // expires soonest.
    fn make_room(&self, now: Instant) {
        if self.entries.len() < self.max_entries {
            return;
        }
        self.purge_expired(now);

        while self.entries.len() >= self.max_entries {
            let victim = self
                .entries
                .iter()
                .min_by_key(|e| e.value().expires_at)
                .map(|e| e.key().clone());

            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                    debug!(key = %key, "Evicted cache entry at capacity");
                }
                None => break,
            }
        }
    }
}
