//! plcwatch - PLC fleet polling and fault monitoring service.

mod admin;
mod config;
mod db;
mod events;
mod faults;
mod fleet;
mod protocol;
mod web;

use admin::Admin;
use config::ServerConfig;
use db::Store;
use events::EventBus;
use faults::FaultManager;
use fleet::FleetManager;
use protocol::DefaultTransportFactory;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("plcwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting plcwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let events = Arc::new(EventBus::new(cfg.plc.subscriber_buffer));

    // Fault state must be loaded before any monitor reads a word
    let faults = Arc::new(FaultManager::new(store.clone(), events.clone(), cfg.plc.clone()));
    faults.initialize().await?;

    let factory = Arc::new(DefaultTransportFactory::new(cfg.plc.clone()));
    let fleet = Arc::new(FleetManager::new(
        store.clone(),
        cfg.plc.clone(),
        factory,
        events.clone(),
        faults.clone(),
    ));
    fleet.start().await?;

    // Start web server
    let admin = Arc::new(Admin::new(store, fleet.clone(), faults.clone(), events.clone()));
    let server = Server::new(cfg, admin, events);
    server.start(shutdown_signal()).await?;

    tracing::info!("Shutting down controllers...");
    fleet.shutdown().await;
    faults.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
