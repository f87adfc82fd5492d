//! fleetdeploy - Software Deployment Orchestrator
//!
//! Pushes packages to fleets of client machines through their local agents
//! and tracks per-client progress.

mod agent;
mod config;
mod db;
mod orchestrator;
mod registry;
mod scheduler;
mod web;

use agent::HttpAgentChannel;
use config::ServerConfig;
use db::Store;
use orchestrator::Orchestrator;
use registry::ClientRegistry;
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("fleetdeploy=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting fleetdeploy on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let registry = ClientRegistry::new(store.clone(), cfg.scheduler.client_offline_after);
    let channel = Arc::new(HttpAgentChannel::new(&cfg.agent, &cfg.public_url)?);
    tracing::info!("Agents reached on port {}, results reported to {}", cfg.agent.port, cfg.public_url);

    let orchestrator = Orchestrator::new(store.clone(), registry.clone(), channel, cfg.dispatch.clone());

    // Start scheduler
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        orchestrator.clone(),
        registry.clone(),
        cfg.scheduler.clone(),
    ));
    scheduler.start().await;

    // Start web server
    let server = Server::new(cfg, store, registry, orchestrator);
    server.start().await?;

    scheduler.stop().await;
    Ok(())
}
