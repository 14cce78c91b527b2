use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use request_pipeline::{AppState, Config, Pipeline, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging; LOG_FORMAT=json switches to structured output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(
        "Starting Request Pipeline Demo v{}",
        env!("CARGO_PKG_VERSION")
    );

    match run().await {
        Ok(()) => to_exit_code(exitcode::OK),
        Err(exit_code) => to_exit_code(exit_code),
    }
}

/// Process exit statuses are a single byte; anything outside it is reported as 1.
fn to_exit_code(code: exitcode::ExitCode) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    let middleware = &config.middleware;
    let handler_timeout_ms =
        u64::try_from(middleware.handler_timeout.as_millis()).unwrap_or(u64::MAX);
    info!(
        host = %config.host,
        port = %config.port,
        handler_timeout_ms,
        max_request_body_bytes = middleware.max_request_body_bytes,
        rate_limit_max = middleware.rate_limit.max_admissions(),
        rate_limit_window_secs = middleware.rate_limit.window().as_secs(),
        rate_limit_routes = middleware.route_rate_limits.len(),
        cache_ttl_secs = middleware.cache_ttl.as_secs(),
        cache_routes = middleware.route_cache_ttls.len(),
        cache_hit_policy = ?middleware.cache_hit_policy,
        trusted_proxies = middleware.trusted_proxies.is_enabled(),
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    } else {
        info!("Prometheus metrics disabled (METRICS_PORT=0)");
    }

    let pipeline = Pipeline::new(config.middleware.clone()).map_err(|e| {
        error!("Failed to build pipeline: {e}");
        exitcode::CONFIG
    })?;

    let state = AppState::new(pipeline, config.clone());
    let app = build_router(state.clone());

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health              - Health and pipeline statistics");
    info!("  GET  /api/products        - List products");
    info!("  GET  /api/products/{{id}}   - Get product");
    info!("  GET  /api/slow            - Delayed response (timeout demo)");
    info!("  GET  /api/fail            - Failing handler (normalizer demo)");

    // Peer addresses feed the rate-limit key
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
