//! Content access check endpoint
//!
//! Read-side consumer of the stored tag sets: evaluates the layered
//! term/item rules for a content view and reports the decision plus the
//! redirect target for denials. On an allowed view, the rule's
//! apply/remove tag lists fire against the viewer.

use crate::db::{rules, users};
use crate::services::access::{
    evaluate, resolve_redirect, Access, AccessRule, DenyReason, RedirectTarget, Viewer,
};
use crate::{ApiResult, AppState};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct AccessCheckRequest {
    content_id: i64,
    /// Absent user id means an unauthenticated visitor
    user_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct AccessCheckResponse {
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<DenyReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect: Option<RedirectTarget>,
}

/// POST /api/access/check handler
async fn access_check(
    State(state): State<AppState>,
    Json(payload): Json<AccessCheckRequest>,
) -> ApiResult<Json<AccessCheckResponse>> {
    let user = match payload.user_id {
        Some(user_id) => users::get_user(&state.db, user_id).await?,
        None => None,
    };

    let viewer = Viewer {
        authenticated: user.is_some(),
        privileged: user
            .as_ref()
            .map(|u| u.role == "administrator")
            .unwrap_or(false),
    };
    let user_tags = user
        .as_ref()
        .and_then(|u| u.tags.clone())
        .unwrap_or_default();

    let term_rules = rules::get_term_rules_for_content(&state.db, payload.content_id).await?;
    let item_rule = rules::get_content_rule(&state.db, payload.content_id).await?;

    // Term rules evaluate first; the first denial wins and carries the
    // redirect configuration
    let mut decision = Access::Allowed;
    let mut denying_rule: Option<&AccessRule> = None;

    for rule in &term_rules {
        let access = evaluate(Some(rule), &user_tags, &viewer, &state.options);
        if !access.is_allowed() {
            decision = access;
            denying_rule = Some(rule);
            break;
        }
    }

    if decision.is_allowed() {
        decision = evaluate(item_rule.as_ref(), &user_tags, &viewer, &state.options);
        if !decision.is_allowed() {
            denying_rule = item_rule.as_ref();
        }
    }

    match decision {
        Access::Allowed => {
            // View automation: a successful view can grant or revoke tags
            if let (Some(user), Some(rule)) = (&user, &item_rule) {
                if !rule.apply_tags.is_empty() {
                    state.tags.apply_tags(user.user_id, &rule.apply_tags).await?;
                }
                if !rule.remove_tags.is_empty() {
                    state.tags.remove_tags(user.user_id, &rule.remove_tags).await?;
                }
            }

            Ok(Json(AccessCheckResponse {
                allowed: true,
                reason: None,
                redirect: None,
            }))
        }
        Access::Denied(reason) => {
            let redirect = denying_rule
                .map(|rule| resolve_redirect(payload.content_id, rule, &state.options));

            Ok(Json(AccessCheckResponse {
                allowed: false,
                reason: Some(reason),
                redirect,
            }))
        }
    }
}

/// Build access routes
pub fn access_routes() -> Router<AppState> {
    Router::new().route("/api/access/check", post(access_check))
}
