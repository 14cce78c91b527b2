//! Middleware composer.
//!
//! [`Pipeline`] owns the shared stores (rate-limit counters, response cache,
//! outcome counters) and wraps a handler in the enabled stages, in the fixed
//! order given by [`PIPELINE_ORDER`]. Composition has no side effects: calling
//! [`Pipeline::wrap`] twice yields two services sharing the same stores.
//!
//! ```rust,ignore
//! let pipeline = Pipeline::new(MiddlewareConfig::default())?;
//! let service = pipeline.wrap(handler_router);
//! let app = Router::new().fallback_service(service);
//! ```

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use tokio::time::Instant;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Layer, Service};
use tracing::debug;

use crate::config::MiddlewareConfig;
use crate::error::ConfigError;
use crate::middleware::{
    CacheLayer, CompressionLayer, ErrorNormalizerLayer, PerformanceLayer, RateLimitLayer,
    RequestSizeLayer, SecurityHeadersLayer, TimeoutLayer,
};
use crate::policy::CacheHitPolicy;
use crate::recorder::{
    MetricsRecorder, OutcomeStats, OutcomeSummary, PerformanceRecorder, Recorders,
};
use crate::store::{FixedWindowLimiter, ResponseCache};

/// The composed pipeline as a single service.
pub type PipelineService = BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>;

/// One stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Performance,
    SecurityHeaders,
    Compression,
    Cache,
    RateLimit,
    RequestSize,
    Timeout,
    ErrorNormalizer,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::SecurityHeaders => "security_headers",
            Self::Compression => "compression",
            Self::Cache => "cache",
            Self::RateLimit => "rate_limit",
            Self::RequestSize => "request_size",
            Self::Timeout => "timeout",
            Self::ErrorNormalizer => "error_normalizer",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stage order, outermost first.
pub const PIPELINE_ORDER: [Stage; 8] = [
    Stage::Performance,
    Stage::SecurityHeaders,
    Stage::Compression,
    Stage::Cache,
    Stage::RateLimit,
    Stage::RequestSize,
    Stage::Timeout,
    Stage::ErrorNormalizer,
];

/// Stage order for a cache hit policy. `CountsAgainstQuota` moves the rate
/// limiter in front of the cache so hits consume admissions.
pub fn stage_order(policy: CacheHitPolicy) -> [Stage; 8] {
    match policy {
        CacheHitPolicy::Free => PIPELINE_ORDER,
        CacheHitPolicy::CountsAgainstQuota => [
            Stage::Performance,
            Stage::SecurityHeaders,
            Stage::Compression,
            Stage::RateLimit,
            Stage::Cache,
            Stage::RequestSize,
            Stage::Timeout,
            Stage::ErrorNormalizer,
        ],
    }
}

/// Entries removed by one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub rate_limit_keys: usize,
    pub cache_entries: usize,
}

/// Configured pipeline with its stores.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<MiddlewareConfig>,
    limiter: Arc<FixedWindowLimiter>,
    cache: Arc<ResponseCache>,
    stats: Arc<OutcomeStats>,
    recorders: Recorders,
}

impl Pipeline {
    /// Build a pipeline. Outcomes go to the built-in counters and the
    /// `metrics` facade.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration fails validation.
    pub fn new(config: MiddlewareConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let stats = Arc::new(OutcomeStats::new());
        let mut recorders = Recorders::new();
        recorders.push(stats.clone());
        recorders.push(Arc::new(MetricsRecorder));

        Ok(Self {
            cache: Arc::new(ResponseCache::new(config.cache_max_entries)),
            limiter: Arc::new(FixedWindowLimiter::new()),
            config: Arc::new(config),
            stats,
            recorders,
        })
    }

    /// Also send every outcome record to `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn PerformanceRecorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    pub fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    pub fn is_enabled(&self, stage: Stage) -> bool {
        let config = &self.config;
        match stage {
            Stage::Performance => config.enable_performance_monitoring,
            Stage::SecurityHeaders => config.enable_security_headers,
            Stage::Compression => config.enable_compression,
            Stage::Cache => config.enable_caching,
            Stage::RateLimit => config.enable_rate_limiting,
            Stage::RequestSize | Stage::Timeout | Stage::ErrorNormalizer => true,
        }
    }

    /// Enabled stages, outermost first.
    pub fn stages(&self) -> Vec<Stage> {
        stage_order(self.config.cache_hit_policy)
            .into_iter()
            .filter(|stage| self.is_enabled(*stage))
            .collect()
    }

    /// Wrap `handler` in the enabled stages.
    pub fn wrap<H>(&self, handler: H) -> PipelineService
    where
        H: Service<Request<Body>, Response = Response<Body>> + Clone + Send + Sync + 'static,
        H::Error: Into<BoxError>,
        H::Future: Send + 'static,
    {
        let recorder: Arc<dyn PerformanceRecorder> = Arc::new(self.recorders.clone());

        // Without the outer recorder the normalizer reports failures itself
        let mut normalizer = ErrorNormalizerLayer::new(self.config.diagnostics);
        if !self.config.enable_performance_monitoring {
            normalizer = normalizer.with_recorder(recorder.clone());
        }
        let mut service = PipelineService::new(normalizer.layer(handler));

        let stages = self.stages();
        for stage in stages.iter().rev() {
            service = match stage {
                Stage::ErrorNormalizer => continue,
                Stage::Timeout => PipelineService::new(
                    TimeoutLayer::new(self.config.handler_timeout).layer(service),
                ),
                Stage::RequestSize => PipelineService::new(
                    RequestSizeLayer::new(self.config.max_request_body_bytes).layer(service),
                ),
                Stage::RateLimit => PipelineService::new(
                    RateLimitLayer::new(self.limiter.clone(), self.config.clone()).layer(service),
                ),
                Stage::Cache => PipelineService::new(
                    CacheLayer::new(self.cache.clone(), self.config.clone()).layer(service),
                ),
                Stage::Compression => PipelineService::new(CompressionLayer::new().layer(service)),
                Stage::SecurityHeaders => {
                    PipelineService::new(SecurityHeadersLayer::new().layer(service))
                }
                Stage::Performance => {
                    PipelineService::new(PerformanceLayer::new(recorder.clone()).layer(service))
                }
            };
        }

        debug!(
            stages = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Pipeline composed"
        );
        service
    }

    /// Drop stale rate-limit windows and expired cache entries.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        SweepReport {
            rate_limit_keys: self.limiter.sweep(now),
            cache_entries: self.cache.purge_expired(now),
        }
    }

    pub fn limiter(&self) -> &Arc<FixedWindowLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Aggregate outcome counts so far.
    pub fn stats(&self) -> OutcomeSummary {
        self.stats.summary()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages())
            .field("cache_entries", &self.cache.len())
            .field("rate_limit_keys", &self.limiter.tracked_keys())
            .field("recorders", &self.recorders)
            .finish()
    }
}
