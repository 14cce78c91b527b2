//! Fixed-window admission counters.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::policy::RateLimitPolicy;

/// Counter state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Admissions granted in the current window.
    pub count: u32,
    /// End of the current window. At or past this instant the entry is stale.
    pub window_reset_at: Instant,
}

impl RateLimitEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.window_reset_at > now
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        /// Admissions left in this window.
        remaining: u32,
        /// Time until the window resets.
        reset_in: Duration,
    },
    Rejected {
        /// Time until the window resets.
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Keyed fixed-window rate limiter.
///
/// The read-check-increment in [`admit`](Self::admit) runs under the shard
/// write lock for the key, so concurrent attempts on one key never admit more
/// than the policy allows.
#[derive(Debug, Default)]
pub struct FixedWindowLimiter {
    entries: DashMap<String, RateLimitEntry>,
}

impl FixedWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt one admission for `key` at `now`.
    ///
    /// A missing or stale entry starts a fresh window with a count of one.
    /// A rejection leaves the entry untouched.
    pub fn admit(&self, key: &str, policy: &RateLimitPolicy, now: Instant) -> Admission {
        let window = policy.window();
        let max = policy.max_admissions();

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                window_reset_at: super::expiry(now, window),
            });

        if !entry.is_live(now) {
            *entry = RateLimitEntry {
                count: 0,
                window_reset_at: super::expiry(now, window),
            };
        }

        let reset_in = entry.window_reset_at.saturating_duration_since(now);
        if entry.count < max {
            entry.count += 1;
            Admission::Admitted {
                remaining: max - entry.count,
                reset_in,
            }
        } else {
            Admission::Rejected {
                retry_after: reset_in,
            }
        }
    }

    /// Current live entry for `key`, if any.
    pub fn entry(&self, key: &str, now: Instant) -> Option<RateLimitEntry> {
        self.entries
            .get(key)
            .map(|e| *e.value())
            .filter(|e| e.is_live(now))
    }

    /// Number of keys with a counter, stale ones included.
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    /// Drop stale entries. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(window_ms: u64, max: u32) -> RateLimitPolicy {
        RateLimitPolicy::new(Duration::from_millis(window_ms), max).unwrap()
    }

    #[test]
    fn test_first_n_admitted_then_rejected() {
        let limiter = FixedWindowLimiter::new();
        let policy = policy(60_000, 3);
        let now = Instant::now();

        for expected_remaining in [2, 1, 0] {
            match limiter.admit("k", &policy, now) {
                Admission::Admitted { remaining, .. } => assert_eq!(remaining, expected_remaining),
                other => panic!("expected admission, got {other:?}"),
            }
        }

        match limiter.admit("k", &policy, now) {
            Admission::Rejected { retry_after } => assert!(retry_after > Duration::ZERO),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_scenario_one_second_window_of_two() {
        let limiter = FixedWindowLimiter::new();
        let policy = policy(1_000, 2);
        let key = "ip:1.2.3.4";
        let t0 = Instant::now();

        assert!(limiter.admit(key, &policy, t0).is_admitted());
        assert!(limiter.admit(key, &policy, t0).is_admitted());
        assert_eq!(
            limiter.admit(key, &policy, t0),
            Admission::Rejected {
                retry_after: Duration::from_secs(1)
            }
        );

        let later = t0 + Duration::from_millis(1_100);
        assert!(limiter.admit(key, &policy, later).is_admitted());
        assert_eq!(limiter.entry(key, later).unwrap().count, 1);
    }

    #[test]
    fn test_rejection_changes_no_state() {
        let limiter = FixedWindowLimiter::new();
        let policy = policy(1_000, 1);
        let now = Instant::now();

        limiter.admit("k", &policy, now);
        let before = limiter.entry("k", now).unwrap();
        limiter.admit("k", &policy, now + Duration::from_millis(10));
        assert_eq!(limiter.entry("k", now).unwrap(), before);
    }

    #[test]
    fn test_unbounded_window_does_not_overflow() {
        let limiter = FixedWindowLimiter::new();
        let policy = RateLimitPolicy::new(Duration::from_secs(u64::MAX), 1).unwrap();
        let now = Instant::now();

        assert!(limiter.admit("k", &policy, now).is_admitted());
        assert!(!limiter.admit("k", &policy, now).is_admitted());
        assert!(limiter.entry("k", now + Duration::from_secs(86_400)).is_some());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = FixedWindowLimiter::new();
        let policy = policy(1_000, 1);
        let now = Instant::now();

        assert!(limiter.admit("a", &policy, now).is_admitted());
        assert!(limiter.admit("b", &policy, now).is_admitted());
        assert!(!limiter.admit("a", &policy, now).is_admitted());
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_max() {
        let limiter = FixedWindowLimiter::new();
        let policy = policy(60_000, 25);
        let now = Instant::now();
        let admitted = AtomicU32::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        if limiter.admit("shared", &policy, now).is_admitted() {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::Relaxed), 25);
        assert_eq!(limiter.entry("shared", now).unwrap().count, 25);
    }

    #[test]
    fn test_sweep_removes_only_stale_entries() {
        let limiter = FixedWindowLimiter::new();
        let now = Instant::now();

        limiter.admit("short", &policy(100, 5), now);
        limiter.admit("long", &policy(60_000, 5), now);

        let removed = limiter.sweep(now + Duration::from_millis(200));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert!(limiter.entry("long", now).is_some());
    }
}
