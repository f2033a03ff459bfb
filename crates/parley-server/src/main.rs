//! # Parley Server
//!
//! Realtime conversation server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Run with a specific config file
//! PARLEY_CONFIG=/path/to/parley.toml parley
//!
//! # Run with environment overrides
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 PARLEY_BUS__SUBSCRIBER_CAPACITY=512 parley
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::var("PARLEY_CONFIG") {
        Ok(path) => config::Config::from_file(path)?,
        Err(_) => config::Config::load()?,
    };

    info!("Starting Parley server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config, shutdown_signal()).await?;

    info!("Parley server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
