//! webpilot - HTTP server entry point.
//!
//! Starts the server that upgrades observer connections into browser-pilot
//! sessions.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webpilot::{api, config::Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webpilot=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={}, stream={:?}@{}fps",
        config.model, config.stream.mode, config.stream.target_fps
    );

    api::serve(config).await?;

    Ok(())
}
