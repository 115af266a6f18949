/// Gatehouse - credential and session lifecycle service
///
/// Verifies credentials, issues and rotates JWT access/refresh tokens, tracks
/// sessions, revokes tokens on logout and password change, and locks accounts
/// after repeated failures.

mod account;
mod api;
mod auth;
mod config;
mod context;
mod crypto;
mod db;
mod error;
mod jobs;
mod metrics;
mod rate_limit;
mod revocation;
mod server;
mod session;
mod token;
mod validation;

#[cfg(test)]
mod test_support;

use anyhow::Context;
use config::{LoggingConfig, ServerConfig};
use context::AppContext;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first so the log format can follow it
    let config = ServerConfig::from_env().context("failed to load configuration")?;

    init_tracing(&config.logging);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Gatehouse");

    // Create application context
    let ctx = AppContext::new(config)
        .await
        .context("failed to initialise application context")?;
    let ctx = Arc::new(ctx);

    // Start background jobs
    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    // Start server
    server::serve((*ctx).clone()).await.context("server error")?;

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.clone().into());

    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
