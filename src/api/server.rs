use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    get_flow, get_stats, get_trace, health_check, list_flows, list_services, metric_catalog,
    search_logs, search_metrics, search_traces, service_map, service_map_search,
    service_metrics, AppState,
};
use crate::compaction::TtlWorker;
use crate::flows::LintConfig;
use crate::otel::{handle_otlp_logs, handle_otlp_metrics, handle_otlp_traces};
use crate::storage::{MemoryStore, StoreConfig, TelemetryStore};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ttl_secs: u64,
    pub ttl_check_interval_secs: u64,
    pub max_memory_bytes: usize,
    pub max_series_per_metric: usize,
    pub lint: LintConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5002,
            ttl_secs: 30 * 60,
            ttl_check_interval_secs: 60,
            max_memory_bytes: 512 * 1024 * 1024, // 512MB
            max_series_per_metric: 1000,
            lint: LintConfig::default(),
        }
    }
}

/// Read `key` from the environment, keeping `default` when unset or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

impl ServerConfig {
    /// Build configuration from `OLLYSCALE_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let lint = LintConfig::default()
            .with_fan_out(env_or("OLLYSCALE_LINT_FAN_OUT", defaults.lint.fan_out))
            .with_root_fan_out(env_or(
                "OLLYSCALE_LINT_ROOT_FAN_OUT",
                defaults.lint.root_fan_out,
            ))
            .with_leaf_root_min_ms(env_or(
                "OLLYSCALE_LINT_LEAF_ROOT_MS",
                defaults.lint.leaf_root_min_ms,
            ))
            .with_n_plus_one(env_or("OLLYSCALE_N_PLUS_ONE", defaults.lint.n_plus_one));

        Self {
            host: std::env::var("OLLYSCALE_HOST").unwrap_or(defaults.host),
            port: env_or("OLLYSCALE_PORT", defaults.port),
            ttl_secs: env_or("OLLYSCALE_TTL_SECS", defaults.ttl_secs),
            ttl_check_interval_secs: env_or(
                "OLLYSCALE_TTL_CHECK_INTERVAL_SECS",
                defaults.ttl_check_interval_secs,
            )
            .max(1),
            max_memory_bytes: env_or::<usize>(
                "OLLYSCALE_MAX_MEMORY_MB",
                defaults.max_memory_bytes / (1024 * 1024),
            )
            .saturating_mul(1024 * 1024),
            max_series_per_metric: env_or(
                "OLLYSCALE_MAX_SERIES_PER_METRIC",
                defaults.max_series_per_metric,
            ),
            lint,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::default()
            .with_ttl(Duration::from_secs(self.ttl_secs))
            .with_max_bytes(self.max_memory_bytes)
            .with_max_series_per_metric(self.max_series_per_metric)
    }
}

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // OTLP/HTTP ingest
        .route("/v1/traces", post(handle_otlp_traces))
        .route("/v1/logs", post(handle_otlp_logs))
        .route("/v1/metrics", post(handle_otlp_metrics))
        // Search
        .route("/api/traces/search", post(search_traces))
        .route("/api/traces/:trace_id", get(get_trace))
        .route("/api/logs/search", post(search_logs))
        .route("/api/metrics/search", post(search_metrics))
        .route("/api/metrics", get(metric_catalog))
        // Derived views
        .route("/api/service-map", get(service_map).post(service_map_search))
        .route("/api/services", get(list_services))
        .route("/api/services/:service/metrics", get(service_metrics))
        .route("/api/flows", get(list_flows))
        .route("/api/flows/:flow_hash", get(get_flow))
        // Stats
        .route("/api/stats", get(get_stats))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn TelemetryStore> = Arc::new(MemoryStore::new(config.store_config()));
    let state = Arc::new(AppState::with_lint_config(
        Arc::clone(&store),
        config.lint.clone(),
    ));

    // Start background workers
    let ttl_worker = Arc::new(TtlWorker::new(
        Arc::clone(&store),
        Duration::from_secs(config.ttl_check_interval_secs),
    ));
    let ttl_handle = Arc::clone(&ttl_worker).start();

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting ollyscale on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(ttl_worker))
        .await?;

    ttl_handle.abort();

    tracing::info!("ollyscale stopped");
    Ok(())
}

async fn shutdown_signal(ttl_worker: Arc<TtlWorker>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a signal handler the server runs until killed
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }

    tracing::info!("Shutdown signal received, stopping workers...");
    ttl_worker.stop();
}
