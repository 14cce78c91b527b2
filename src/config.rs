//! Configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with defaults that
//! are safe for development. In production, configure via environment
//! variables or a `.env` file.
//!
//! # Pipeline Stages
//!
//! - `ENABLE_PERFORMANCE_MONITORING`, `ENABLE_SECURITY_HEADERS`,
//!   `ENABLE_COMPRESSION`, `ENABLE_CACHING`, `ENABLE_RATE_LIMITING`: stage
//!   toggles (default: all `true`)
//! - `MAX_REQUEST_BODY_BYTES`: size guard ceiling (default: 10 MiB)
//! - `HANDLER_TIMEOUT_SECS`: timeout guard deadline (default: 30)
//! - `DIAGNOSTICS_ENABLED`: include error chains in failure bodies (default: false)
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_WINDOW_SECS` / `RATE_LIMIT_MAX`: global policy (default: 900 / 100)
//! - `RATE_LIMIT_MESSAGE`: rejection message
//! - `RATE_LIMIT_ROUTES`: per-route overrides, `prefix=window_secs:max,...`
//!   (e.g. `/api/login=60:5,/api/search=1:20`)
//!
//! # Caching
//!
//! - `CACHE_TTL_SECS`: global TTL (default: 0, nothing cached)
//! - `CACHE_ROUTES`: per-route TTLs, `prefix=ttl_secs,...` (e.g. `/api/products=30`)
//! - `CACHE_MAX_ENTRIES` / `CACHE_MAX_BODY_BYTES`: capacity (default: 10000 / 1 MiB)
//! - `CACHE_HITS_COUNT_AGAINST_QUOTA`: put the limiter in front of the cache (default: false)

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::middleware::ip::TrustedProxyConfig;
use crate::policy::{CacheHitPolicy, RateLimitPolicy, RouteOverrides};

/// Pipeline configuration. Immutable once a pipeline is built from it.
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    // =========================================================================
    // Stage toggles
    // =========================================================================
    pub enable_performance_monitoring: bool,
    pub enable_security_headers: bool,
    pub enable_compression: bool,
    pub enable_caching: bool,
    pub enable_rate_limiting: bool,

    // =========================================================================
    // Guards
    // =========================================================================
    /// Largest declared request body accepted (default: 10 MiB)
    pub max_request_body_bytes: u64,

    /// Deadline for the handler (default: 30 seconds)
    pub handler_timeout: Duration,

    /// Include error chains in failure bodies. Never enable in production.
    pub diagnostics: bool,

    // =========================================================================
    // Rate limiting
    // =========================================================================
    /// Policy for requests no route override matches
    pub rate_limit: RateLimitPolicy,

    /// Per-route policies, longest prefix wins
    pub route_rate_limits: RouteOverrides<RateLimitPolicy>,

    /// Proxies allowed to set `X-Forwarded-For` / `X-Real-IP`
    pub trusted_proxies: TrustedProxyConfig,

    // =========================================================================
    // Caching
    // =========================================================================
    /// TTL for requests no route override matches (zero = not cached)
    pub cache_ttl: Duration,

    /// Per-route TTLs, longest prefix wins
    pub route_cache_ttls: RouteOverrides<Duration>,

    pub cache_max_entries: usize,

    /// Responses with a larger body are not stored
    pub cache_max_body_bytes: usize,

    pub cache_hit_policy: CacheHitPolicy,
}

impl MiddlewareConfig {
    pub const DEFAULT_MAX_REQUEST_BODY_BYTES: u64 = 10 * 1024 * 1024;
    pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;
    pub const DEFAULT_CACHE_MAX_BODY_BYTES: usize = 1024 * 1024;
    /// Longest accepted rate-limit window or cache TTL: one year.
    pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    /// Apply `policy` to every path under `prefix`.
    pub fn with_route_rate_limit(
        mut self,
        prefix: impl Into<String>,
        policy: RateLimitPolicy,
    ) -> Self {
        self.route_rate_limits.insert(prefix, policy);
        self
    }

    /// Cache successful responses under `prefix` for `ttl`. A zero TTL
    /// disables caching for that prefix.
    pub fn with_route_cache_ttl(mut self, prefix: impl Into<String>, ttl: Duration) -> Self {
        self.route_cache_ttls.insert(prefix, ttl);
        self
    }

    /// Policy governing `path`, with the matching route prefix when an
    /// override applies.
    pub fn rate_limit_for(&self, path: &str) -> (Option<&str>, &RateLimitPolicy) {
        match self.route_rate_limits.resolve(path) {
            Some((prefix, policy)) => (Some(prefix), policy),
            None => (None, &self.rate_limit),
        }
    }

    /// TTL for responses to `path`. Zero means do not cache.
    pub fn cache_ttl_for(&self, path: &str) -> Duration {
        self.route_cache_ttls
            .resolve(path)
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.cache_ttl)
    }

    /// Check values for consistency.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Constraint` naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_request_body_bytes == 0 {
            return Err(ConfigError::Constraint(
                "MAX_REQUEST_BODY_BYTES must be greater than 0".to_string(),
            ));
        }

        if self.handler_timeout.is_zero() {
            return Err(ConfigError::Constraint(
                "HANDLER_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.cache_max_entries == 0 {
            return Err(ConfigError::Constraint(
                "CACHE_MAX_ENTRIES must be greater than 0".to_string(),
            ));
        }

        let too_long = |d: &Duration| *d > Self::MAX_WINDOW;

        if too_long(&self.rate_limit.window())
            || self.route_rate_limits.iter().any(|(_, p)| too_long(&p.window()))
        {
            return Err(ConfigError::Constraint(format!(
                "rate limit windows must not exceed {} seconds",
                Self::MAX_WINDOW.as_secs()
            )));
        }

        if too_long(&self.cache_ttl)
            || self.route_cache_ttls.iter().any(|(_, ttl)| too_long(ttl))
        {
            return Err(ConfigError::Constraint(format!(
                "cache TTLs must not exceed {} seconds",
                Self::MAX_WINDOW.as_secs()
            )));
        }

        Ok(())
    }
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            enable_performance_monitoring: true,
            enable_security_headers: true,
            enable_compression: true,
            enable_caching: true,
            enable_rate_limiting: true,
            max_request_body_bytes: Self::DEFAULT_MAX_REQUEST_BODY_BYTES,
            handler_timeout: Self::DEFAULT_HANDLER_TIMEOUT,
            diagnostics: false,
            rate_limit: RateLimitPolicy::default(),
            route_rate_limits: RouteOverrides::new(),
            trusted_proxies: TrustedProxyConfig::default(),
            cache_ttl: Duration::ZERO,
            route_cache_ttls: RouteOverrides::new(),
            cache_max_entries: Self::DEFAULT_CACHE_MAX_ENTRIES,
            cache_max_body_bytes: Self::DEFAULT_CACHE_MAX_BODY_BYTES,
            cache_hit_policy: CacheHitPolicy::Free,
        }
    }
}

/// Service configuration.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,

    /// Period of the stale-entry sweep (default: 60 seconds)
    pub housekeeping_interval: Duration,

    pub middleware: MiddlewareConfig,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any value fails to parse or validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let rate_limit = RateLimitPolicy::new(
            Duration::from_secs(Self::parse_env("RATE_LIMIT_WINDOW_SECS", 900)?),
            Self::parse_env("RATE_LIMIT_MAX", RateLimitPolicy::DEFAULT_MAX_ADMISSIONS)?,
        )?;
        let rate_limit = match env::var("RATE_LIMIT_MESSAGE") {
            Ok(message) if !message.trim().is_empty() => rate_limit.with_message(message),
            _ => rate_limit,
        };

        let mut route_rate_limits = RouteOverrides::new();
        let rate_limit_routes = env::var("RATE_LIMIT_ROUTES").unwrap_or_default();
        for (prefix, policy) in parse_rate_limit_routes(&rate_limit_routes)? {
            route_rate_limits.insert(prefix, policy.with_message(rate_limit.message()));
        }

        let mut route_cache_ttls = RouteOverrides::new();
        for (prefix, ttl) in parse_cache_routes(&env::var("CACHE_ROUTES").unwrap_or_default())? {
            route_cache_ttls.insert(prefix, ttl);
        }

        let cache_hit_policy = if Self::parse_env("CACHE_HITS_COUNT_AGAINST_QUOTA", false)? {
            CacheHitPolicy::CountsAgainstQuota
        } else {
            CacheHitPolicy::Free
        };

        let middleware = MiddlewareConfig {
            enable_performance_monitoring: Self::parse_env("ENABLE_PERFORMANCE_MONITORING", true)?,
            enable_security_headers: Self::parse_env("ENABLE_SECURITY_HEADERS", true)?,
            enable_compression: Self::parse_env("ENABLE_COMPRESSION", true)?,
            enable_caching: Self::parse_env("ENABLE_CACHING", true)?,
            enable_rate_limiting: Self::parse_env("ENABLE_RATE_LIMITING", true)?,
            max_request_body_bytes: Self::parse_env(
                "MAX_REQUEST_BODY_BYTES",
                MiddlewareConfig::DEFAULT_MAX_REQUEST_BODY_BYTES,
            )?,
            handler_timeout: Duration::from_secs(Self::parse_env("HANDLER_TIMEOUT_SECS", 30)?),
            diagnostics: Self::parse_env("DIAGNOSTICS_ENABLED", false)?,
            rate_limit,
            route_rate_limits,
            trusted_proxies: TrustedProxyConfig::new(&Self::parse_trusted_proxies()),
            cache_ttl: Duration::from_secs(Self::parse_env("CACHE_TTL_SECS", 0)?),
            route_cache_ttls,
            cache_max_entries: Self::parse_env(
                "CACHE_MAX_ENTRIES",
                MiddlewareConfig::DEFAULT_CACHE_MAX_ENTRIES,
            )?,
            cache_max_body_bytes: Self::parse_env(
                "CACHE_MAX_BODY_BYTES",
                MiddlewareConfig::DEFAULT_CACHE_MAX_BODY_BYTES,
            )?,
            cache_hit_policy,
        };

        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
            housekeeping_interval: Duration::from_secs(Self::parse_env(
                "HOUSEKEEPING_INTERVAL_SECS",
                60,
            )?),
            middleware,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.housekeeping_interval.is_zero() {
            return Err(ConfigError::Constraint(
                "HOUSEKEEPING_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        self.middleware.validate()
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                name: name.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Ok(default),
        }
    }

    /// Parse trusted proxy CIDR ranges from `TRUSTED_PROXIES`.
    ///
    /// When empty, forwarding headers are trusted from every peer, which
    /// allows IP spoofing. In production, list your reverse proxy ranges.
    fn parse_trusted_proxies() -> Vec<String> {
        env::var("TRUSTED_PROXIES")
            .ok()
            .map(|s| split_list(&s).map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Default configuration for testing and development.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            metrics_port: 9090,
            housekeeping_interval: Duration::from_secs(60),
            middleware: MiddlewareConfig::default(),
        }
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn invalid(name: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Parse `prefix=window_secs:max,...`.
pub fn parse_rate_limit_routes(value: &str) -> Result<Vec<(String, RateLimitPolicy)>, ConfigError> {
    const NAME: &str = "RATE_LIMIT_ROUTES";

    split_list(value)
        .map(|item| {
            let (prefix, spec) = item.split_once('=').ok_or_else(|| {
                invalid(NAME, format!("expected prefix=window_secs:max, got {item:?}"))
            })?;
            let (window, max) = spec
                .split_once(':')
                .ok_or_else(|| invalid(NAME, format!("expected window_secs:max, got {spec:?}")))?;
            let window: u64 = window
                .trim()
                .parse()
                .map_err(|e| invalid(NAME, format!("window for {prefix}: {e}")))?;
            let max: u32 = max
                .trim()
                .parse()
                .map_err(|e| invalid(NAME, format!("max for {prefix}: {e}")))?;

            let policy = RateLimitPolicy::new(Duration::from_secs(window), max)?;
            Ok((prefix.trim().to_string(), policy))
        })
        .collect()
}

/// Parse `prefix=ttl_secs,...`.
pub fn parse_cache_routes(value: &str) -> Result<Vec<(String, Duration)>, ConfigError> {
    const NAME: &str = "CACHE_ROUTES";

    split_list(value)
        .map(|item| {
            let (prefix, ttl) = item
                .split_once('=')
                .ok_or_else(|| invalid(NAME, format!("expected prefix=ttl_secs, got {item:?}")))?;
            let ttl: u64 = ttl
                .trim()
                .parse()
                .map_err(|e| invalid(NAME, format!("ttl for {prefix}: {e}")))?;
            Ok((prefix.trim().to_string(), Duration::from_secs(ttl)))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();
        let middleware = &config.middleware;

        assert_eq!(config.port, 3000);
        assert!(middleware.enable_caching);
        assert!(middleware.enable_rate_limiting);
        assert_eq!(middleware.max_request_body_bytes, 10 * 1024 * 1024);
        assert_eq!(middleware.handler_timeout, Duration::from_secs(30));
        assert_eq!(middleware.rate_limit.window(), Duration::from_secs(900));
        assert_eq!(middleware.rate_limit.max_admissions(), 100);
        assert_eq!(middleware.cache_ttl, Duration::ZERO);
        assert_eq!(middleware.cache_hit_policy, CacheHitPolicy::Free);
        assert!(!middleware.diagnostics);
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "192.168.1.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.server_addr(), "192.168.1.1:8080");
    }

    #[test]
    fn test_metrics_addr_disabled_on_zero_port() {
        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
        assert!(Config::default().metrics_addr().is_some());
    }

    #[test]
    fn test_route_resolution() {
        let login = RateLimitPolicy::new(Duration::from_secs(60), 5).unwrap();
        let config = MiddlewareConfig::default()
            .with_route_rate_limit("/api/login", login)
            .with_route_cache_ttl("/api/products", Duration::from_secs(30));

        let (scope, policy) = config.rate_limit_for("/api/login");
        assert_eq!(scope, Some("/api/login"));
        assert_eq!(policy.max_admissions(), 5);

        let (scope, policy) = config.rate_limit_for("/api/orders");
        assert!(scope.is_none());
        assert_eq!(policy.max_admissions(), 100);

        assert_eq!(config.cache_ttl_for("/api/products/3"), Duration::from_secs(30));
        assert_eq!(config.cache_ttl_for("/api/orders"), Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = MiddlewareConfig {
            max_request_body_bytes: 0,
            ..MiddlewareConfig::default()
        };
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("MAX_REQUEST_BODY_BYTES")
        );

        let config = MiddlewareConfig {
            handler_timeout: Duration::ZERO,
            ..MiddlewareConfig::default()
        };
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("HANDLER_TIMEOUT_SECS")
        );

        assert!(MiddlewareConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unbounded_windows() {
        let huge = Duration::from_secs(u64::MAX);

        let config = MiddlewareConfig {
            rate_limit: RateLimitPolicy::new(huge, 1).unwrap(),
            ..MiddlewareConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("rate limit windows"));

        let config = MiddlewareConfig::default()
            .with_route_rate_limit("/api/login", RateLimitPolicy::new(huge, 5).unwrap());
        assert!(config.validate().is_err());

        let config = MiddlewareConfig::default().with_route_cache_ttl("/api", Duration::MAX);
        assert!(config.validate().unwrap_err().to_string().contains("cache TTLs"));

        let config = MiddlewareConfig {
            cache_ttl: huge,
            ..MiddlewareConfig::default()
        };
        assert!(config.validate().is_err());

        let at_limit = MiddlewareConfig::default()
            .with_route_cache_ttl("/api", MiddlewareConfig::MAX_WINDOW);
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn test_parse_rate_limit_routes() {
        let routes = parse_rate_limit_routes("/api/login=60:5, /api/search=1:20").unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].0, "/api/login");
        assert_eq!(routes[0].1.window(), Duration::from_secs(60));
        assert_eq!(routes[1].1.max_admissions(), 20);

        assert!(parse_rate_limit_routes("").unwrap().is_empty());
        assert!(parse_rate_limit_routes("/api=60").is_err());
        assert!(parse_rate_limit_routes("/api=x:5").is_err());
        assert!(matches!(
            parse_rate_limit_routes("/api=60:0"),
            Err(ConfigError::Policy(_))
        ));
    }

    #[test]
    fn test_parse_cache_routes() {
        let routes = parse_cache_routes("/api/products=30,/api/static=3600").unwrap();
        assert_eq!(
            routes,
            vec![
                ("/api/products".to_string(), Duration::from_secs(30)),
                ("/api/static".to_string(), Duration::from_secs(3600)),
            ]
        );
        assert!(parse_cache_routes("/api/products").is_err());
    }
}
