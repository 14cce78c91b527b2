//! In-memory stores owned by a pipeline.
//!
//! Both stores are sharded concurrent maps: operations on different keys
//! never contend, and operations on the same key are serialized by the shard
//! lock. All state is process-local and lost on restart.

use std::time::Duration;

use tokio::time::Instant;

pub mod cache;
pub mod rate_limit;

pub use cache::{CacheEntry, CachedResponse, ResponseCache};
pub use rate_limit::{Admission, FixedWindowLimiter, RateLimitEntry};

// Roughly 30 years, the same horizon tokio uses for a "never" deadline.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, clamped to a far-future instant instead of overflowing.
pub(crate) fn expiry(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
