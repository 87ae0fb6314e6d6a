//! crmgate-sync library interface
//!
//! Exposes public APIs for integration testing

pub mod api;
pub mod config;
pub mod crm;
pub mod db;
pub mod error;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use crate::crm::CrmConnection;
use crate::db::settings::RuntimeOptions;
use crate::services::{
    BatchController, ContactLockRegistry, ContactResolver, MetaSync, TagSynchronizer,
};
use axum::Router;
use crmgate_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting and automation
    pub event_bus: EventBus,
    /// CRM backend
    pub crm: Arc<dyn CrmConnection>,
    /// Materialized settings bag, injected instead of read globally
    pub options: Arc<RuntimeOptions>,
    /// Shared secret required on inbound webhooks
    pub webhook_secret: Arc<String>,
    /// Per-contact webhook locks
    pub locks: Arc<ContactLockRegistry>,
    /// Batch worker wake/stop handle
    pub batch: BatchController,
    /// Tag synchronizer
    pub tags: Arc<TagSynchronizer>,
    /// Profile field push/pull
    pub meta: Arc<MetaSync>,
    /// Contact id resolution
    pub resolver: Arc<ContactResolver>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        crm: Arc<dyn CrmConnection>,
        options: Arc<RuntimeOptions>,
        webhook_secret: String,
    ) -> Self {
        let tags = Arc::new(TagSynchronizer::new(
            db.clone(),
            crm.clone(),
            event_bus.clone(),
            options.clone(),
        ));
        let meta = Arc::new(MetaSync::new(
            db.clone(),
            crm.clone(),
            event_bus.clone(),
            options.clone(),
        ));
        let resolver = Arc::new(ContactResolver::new(
            db.clone(),
            crm.clone(),
            event_bus.clone(),
        ));

        Self {
            db,
            event_bus,
            crm,
            options,
            webhook_secret: Arc::new(webhook_secret),
            locks: Arc::new(ContactLockRegistry::default()),
            batch: BatchController::new(),
            tags,
            meta,
            resolver,
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::health_routes())
        .merge(api::webhook_routes())
        .merge(api::batch_routes())
        .merge(api::access_routes())
        .merge(api::user_routes())
        .route("/events", get(api::event_stream))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
