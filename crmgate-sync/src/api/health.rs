//! Health check endpoint

use crate::AppState;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

/// GET /health handler
async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "module": "crmgate-sync",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Build health routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
