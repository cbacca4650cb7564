//! Headless trading daemon.
//!
//! Runs the full platform: scheduler, trading cycles, risk monitor, position
//! monitor, watchdog and alert delivery. Metrics are pushed as structured
//! JSON log lines - no HTTP server, no inbound connections.
//!
//! # Environment
//! - `ALPACA_API_KEY` / `ALPACA_SECRET_KEY` - broker credentials (empty in
//!   paper mode selects the in-memory broker)
//! - `ALPACA_BASE_URL` / `ALPACA_DATA_URL` - endpoint overrides
//! - `DATABASE_URL` - SQLite url (default `sqlite://catalyst.db`)
//! - `NEWS_FEED_URL` - RSS catalyst feed (optional)
//! - `ADVISOR_URL` - external advisor endpoint (optional)
//! - `ALERT_WEBHOOK_URL` - alert webhook (optional)
//! - `SETTINGS_PATH` - TOML settings file (default `settings.toml` in the
//!   working directory; the process must be started from the deploy root)

use anyhow::Result;
use catalyst_trader::application::system::Application;
use catalyst_trader::config::BrokerConfig;
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("catalyst-trader {} starting...", env!("CARGO_PKG_VERSION"));

    let config = BrokerConfig::from_env()?;
    let settings_path = std::env::var("SETTINGS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("settings.toml"));

    let app = Application::build(config, Some(settings_path)).await?;
    let handle = app.start().await?;
    info!("Trading system running. Press Ctrl+C to shut down.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting...");
    for task in handle.tasks {
        task.abort();
    }
    Ok(())
}
