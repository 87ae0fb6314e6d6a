//! crmgate-sync - CRM synchronization service
//!
//! Synchronizes local user records, tag sets, and content-access rules
//! with an external CRM: contact resolution, tag sync, profile field
//! push/pull, batch operations, and an inbound webhook receiver.

use anyhow::Result;
use crmgate_common::config::{self, TomlConfig};
use crmgate_common::events::EventBus;
use crmgate_sync::crm::HttpCrm;
use crmgate_sync::services::BatchRunner;
use crmgate_sync::AppState;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load TOML config first; it may carry the log filter
    let toml_config = TomlConfig::load()?;

    let filter = toml_config
        .logging
        .level
        .clone()
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    info!("Starting crmgate-sync");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Open or create database
    let db_path = config::resolve_database_path(&toml_config);
    info!("Database: {}", db_path.display());
    let db_pool = crmgate_sync::db::init_database_pool(&db_path).await?;
    info!("Database connection established");

    // Materialize the settings bag once; components get it injected
    let options = Arc::new(crmgate_sync::db::settings::load_runtime_options(&db_pool).await?);

    // Secrets and CRM credentials (database > env > TOML)
    let webhook_secret =
        crmgate_sync::config::resolve_webhook_secret(&db_pool, &toml_config).await?;
    let (crm_url, crm_key) = crmgate_sync::config::resolve_crm_credentials(&toml_config)?;

    let crm = Arc::new(HttpCrm::new(crm_url, crm_key)?);
    info!("CRM client initialized");

    // Event bus for SSE broadcasting and automation
    let event_bus = EventBus::new(100);

    // Create application state
    let state = AppState::new(
        db_pool.clone(),
        event_bus.clone(),
        crm,
        options,
        webhook_secret,
    );

    // Background batch worker drains the persistent queue
    let runner = BatchRunner::new(
        db_pool,
        state.tags.clone(),
        state.meta.clone(),
        event_bus,
        state.batch.clone(),
    );
    runner.spawn();
    info!("Batch worker spawned");

    // Build router and start server
    let bind_addr = config::resolve_bind_address(&toml_config);
    let app = crmgate_sync::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{}", bind_addr);
    info!("Health check: http://{}/health", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
