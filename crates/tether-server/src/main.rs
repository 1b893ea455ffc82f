//! # Tether Server
//!
//! Realtime two-person chat with presence, typing indicators and offline
//! email notifications.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file found in the default locations
//! TETHER_AUTH__JWT_SECRET=change-me tether
//!
//! # Run with custom config
//! tether --config /path/to/tether.toml
//!
//! # Run with environment variables
//! TETHER_PORT=8080 TETHER_HOST=0.0.0.0 tether
//! ```

mod api;
mod auth;
mod config;
mod error;
mod handlers;
mod metrics;
mod notifier;
mod state;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut args = std::env::args().skip(1);
    let config = match (args.next().as_deref(), args.next()) {
        (Some("--config"), Some(path)) => config::Config::from_file(path)?,
        (Some("--config"), None) => anyhow::bail!("--config requires a path"),
        _ => config::Config::load().context("Failed to load configuration")?,
    };

    tracing::info!("Starting Tether server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
