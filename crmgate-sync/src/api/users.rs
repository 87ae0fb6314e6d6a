//! Per-user sync endpoints
//!
//! Admin-facing operations. Unlike the webhook path these surface the
//! failure in the response body, so an operator sees why a push or pull
//! did not complete.

use crate::db::users::{self, TagSet, UserRecord};
use crate::services::meta::SyncContext;
use crate::{ApiError, ApiResult, AppState};
use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    email: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateUserResponse {
    user_id: Uuid,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ModifyTagsRequest {
    tags: Vec<String>,
}

/// POST /api/users handler: register a local user
async fn create_user(
    State(state): State<AppState>,
    Json(payload): Json<CreateUserRequest>,
) -> ApiResult<Json<CreateUserResponse>> {
    if payload.email.trim().is_empty() {
        return Err(ApiError::BadRequest("email is required".to_string()));
    }

    if users::get_user_by_email(&state.db, &payload.email).await?.is_some() {
        return Err(ApiError::Conflict(format!(
            "user with email {} already exists",
            payload.email
        )));
    }

    let role = payload.role.unwrap_or_else(|| "subscriber".to_string());
    if !state.options.known_roles.iter().any(|r| r == &role) {
        return Err(ApiError::BadRequest(format!("unknown role: {}", role)));
    }

    let mut user = UserRecord::new(payload.email, role);
    user.display_name = payload.display_name;
    users::insert_user(&state.db, &user).await?;

    Ok(Json(CreateUserResponse {
        user_id: user.user_id,
    }))
}

/// POST /api/users/:id/sync handler: force tag refetch from the CRM
async fn sync_user_tags(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<SyncResponse>> {
    let tags = state.tags.get_tags(user_id, true, None).await?;

    Ok(Json(SyncResponse {
        success: true,
        message: format!("Synced {} tags", tags.len()),
    }))
}

/// POST /api/users/:id/push handler: push mapped fields to the CRM
async fn push_user_meta(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<SyncResponse>> {
    let pushed = state.meta.push(user_id, None).await?;

    Ok(Json(SyncResponse {
        success: pushed,
        message: if pushed {
            "Fields pushed".to_string()
        } else {
            "Push did not complete; see logs".to_string()
        },
    }))
}

/// POST /api/users/:id/pull handler: pull CRM fields into local storage
async fn pull_user_meta(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<SyncResponse>> {
    let pulled = state.meta.pull(user_id, SyncContext::System).await?;

    Ok(Json(SyncResponse {
        success: pulled,
        message: if pulled {
            "Fields pulled".to_string()
        } else {
            "Pull did not complete; see logs".to_string()
        },
    }))
}

/// POST /api/users/:id/tags/apply handler
async fn apply_user_tags(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<ModifyTagsRequest>,
) -> ApiResult<Json<SyncResponse>> {
    let tag_set: TagSet = payload.tags.into_iter().collect();
    let applied = state.tags.apply_tags(user_id, &tag_set).await?;

    Ok(Json(SyncResponse {
        success: applied,
        message: if applied {
            "Tags applied".to_string()
        } else {
            "Remote apply failed; local state unchanged".to_string()
        },
    }))
}

/// POST /api/users/:id/tags/remove handler
async fn remove_user_tags(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<ModifyTagsRequest>,
) -> ApiResult<Json<SyncResponse>> {
    let tag_set: TagSet = payload.tags.into_iter().collect();
    let removed = state.tags.remove_tags(user_id, &tag_set).await?;

    Ok(Json(SyncResponse {
        success: removed,
        message: if removed {
            "Tags removed".to_string()
        } else {
            "Remote remove failed; local state unchanged".to_string()
        },
    }))
}

/// Build user routes
pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/api/users", post(create_user))
        .route("/api/users/:user_id/sync", post(sync_user_tags))
        .route("/api/users/:user_id/push", post(push_user_meta))
        .route("/api/users/:user_id/pull", post(pull_user_meta))
        .route("/api/users/:user_id/tags/apply", post(apply_user_tags))
        .route("/api/users/:user_id/tags/remove", post(remove_user_tags))
}
