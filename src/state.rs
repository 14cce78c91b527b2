//! Shared application state for Axum handlers.
//!
//! Holds the configured [`Pipeline`] (and through it the rate-limit and cache
//! stores) plus runtime configuration.
//!
//! # Structured Concurrency
//!
//! The housekeeping sweeper is managed using `tokio_util::task::TaskTracker`
//! and `CancellationToken`. Call `shutdown()` to stop it before exit.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::metrics;
use crate::pipeline::Pipeline;

/// Shared application state for Axum handlers.
///
/// # Lifecycle
///
/// The housekeeping task is spawned when the state is created:
///
/// ```rust,ignore
/// let state = AppState::new(pipeline, config);
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    /// Application configuration
    pub config: Arc<Config>,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create state and spawn the housekeeping sweeper, which runs every
    /// `config.housekeeping_interval`.
    pub fn new(pipeline: Pipeline, config: Config) -> Self {
        let state = Self {
            pipeline,
            config: Arc::new(config),
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_housekeeping_task();

        state
    }

    /// Spawn the background sweep of stale rate-limit windows and expired
    /// cache entries.
    fn spawn_housekeeping_task(&self) {
        let pipeline = self.pipeline.clone();
        let period = self.config.housekeeping_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Housekeeping task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => run_housekeeping(&pipeline),
                }
            }

            debug!("Housekeeping task shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// Signals cancellation, closes the tracker, then waits for every task.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Period between sweeps.
    pub fn housekeeping_interval(&self) -> Duration {
        self.config.housekeeping_interval
    }
}

/// One sweep pass; also refreshes the store-size gauges.
pub fn run_housekeeping(pipeline: &Pipeline) {
    let removed = pipeline.sweep(Instant::now());
    let cache_entries = pipeline.cache().len();
    let rate_limit_keys = pipeline.limiter().tracked_keys();
    metrics::set_store_sizes(cache_entries, rate_limit_keys);

    trace!(
        removed_rate_limit_keys = removed.rate_limit_keys,
        removed_cache_entries = removed.cache_entries,
        cache_entries,
        rate_limit_keys,
        "Housekeeping sweep complete"
    );
}
