//! ollyscale server
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - OLLYSCALE_HOST: Bind address (default: 0.0.0.0)
//! - OLLYSCALE_PORT: Port number (default: 5002)
//! - OLLYSCALE_TTL_SECS: Retention for all telemetry (default: 1800)
//! - OLLYSCALE_TTL_CHECK_INTERVAL_SECS: Expiry sweep interval (default: 60)
//! - OLLYSCALE_MAX_MEMORY_MB: Memory budget in MB (default: 512)
//! - OLLYSCALE_MAX_SERIES_PER_METRIC: Cardinality limit per metric (default: 1000)
//! - OLLYSCALE_LINT_FAN_OUT, OLLYSCALE_LINT_ROOT_FAN_OUT, OLLYSCALE_LINT_LEAF_ROOT_MS,
//!   OLLYSCALE_N_PLUS_ONE: Trace-flow lint thresholds
//! - RUST_LOG: Log level (default: ollyscale=info,tower_http=info)

use ollyscale::api::{run_server, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ollyscale=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();

    tracing::info!("ollyscale {} configuration:", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Host: {}:{}", config.host, config.port);
    tracing::info!("  TTL: {} seconds", config.ttl_secs);
    tracing::info!(
        "  TTL check interval: {} seconds",
        config.ttl_check_interval_secs
    );
    tracing::info!(
        "  Max memory: {} MB",
        config.max_memory_bytes / (1024 * 1024)
    );
    tracing::info!(
        "  Max series per metric: {}",
        config.max_series_per_metric
    );
    tracing::info!(
        "  Lint: fan_out={} root_fan_out={} leaf_root_ms={} n_plus_one={}",
        config.lint.fan_out,
        config.lint.root_fan_out,
        config.lint.leaf_root_min_ms,
        config.lint.n_plus_one
    );

    run_server(config).await
}
