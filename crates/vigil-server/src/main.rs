//! # Vigil Server
//!
//! Realtime messaging, presence, and call signaling server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (a JWT secret is required)
//! VIGIL_AUTH__JWT_SECRET=change-me vigil
//!
//! # Run with a config file in one of the default locations
//! cp vigil.example.toml vigil.toml && vigil
//!
//! # Override single settings from the environment
//! VIGIL_PORT=9000 VIGIL_CALLS__RING_TIMEOUT_MS=45000 vigil
//! ```

mod api;
mod auth;
mod config;
mod handlers;
mod metrics;
mod rtc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Vigil server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
