//! Batch operation endpoints
//!
//! POST /api/batch/init   - materialize and queue a bulk operation
//! GET  /api/batch/status - remaining item count (polled by clients)
//! POST /api/batch/cancel - clear the queue

use crate::services::batch::{self, BatchOperation};
use crate::{ApiError, ApiResult, AppState};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
struct BatchInitRequest {
    /// Operation name (e.g. "users_sync")
    operation: String,
    /// Opaque shared arguments copied into every queued item
    #[serde(default)]
    args: serde_json::Value,
    /// Restrict the run to these users instead of the full eligible list
    #[serde(default)]
    user_ids: Option<Vec<uuid::Uuid>>,
}

#[derive(Debug, Serialize)]
struct BatchInitResponse {
    /// Number of queued items; 0 means nothing was eligible
    item_count: usize,
}

#[derive(Debug, Serialize)]
struct BatchStatusResponse {
    remaining: i64,
}

#[derive(Debug, Serialize)]
struct BatchCancelResponse {
    cleared: i64,
}

/// POST /api/batch/init handler
async fn batch_init(
    State(state): State<AppState>,
    Json(payload): Json<BatchInitRequest>,
) -> ApiResult<Json<BatchInitResponse>> {
    let operation = BatchOperation::parse(&payload.operation)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown operation: {}", payload.operation)))?;

    let item_count = batch::init(
        &state.db,
        &state.event_bus,
        &state.batch,
        operation,
        payload.args,
        payload.user_ids,
    )
    .await?;

    Ok(Json(BatchInitResponse { item_count }))
}

/// GET /api/batch/status handler
async fn batch_status(State(state): State<AppState>) -> ApiResult<Json<BatchStatusResponse>> {
    let remaining = batch::status(&state.db).await?;
    Ok(Json(BatchStatusResponse { remaining }))
}

/// POST /api/batch/cancel handler
async fn batch_cancel(State(state): State<AppState>) -> ApiResult<Json<BatchCancelResponse>> {
    let cleared = batch::cancel(&state.db, &state.event_bus).await?;
    Ok(Json(BatchCancelResponse { cleared }))
}

/// Build batch routes
pub fn batch_routes() -> Router<AppState> {
    Router::new()
        .route("/api/batch/init", post(batch_init))
        .route("/api/batch/status", get(batch_status))
        .route("/api/batch/cancel", post(batch_cancel))
}
