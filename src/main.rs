//! Call orchestrator
//!
//! Routes inbound and outbound phone calls between the PSTN, a voice-AI
//! agent and human transfer targets, and keeps one authoritative record
//! per call from the provider's status callbacks.

mod models;
mod server;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("call_orchestrator=info".parse()?))
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    tracing::info!("Starting server on port {}", config.port);

    server::run_server(config).await
}
