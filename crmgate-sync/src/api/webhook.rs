//! Inbound webhook endpoint
//!
//! The CRM calls this endpoint to signal remote-side changes. Except for
//! a bad access key (403), every outcome is an HTTP 200 with a
//! human-readable diagnostic body: sending CRMs treat non-2xx responses
//! as delivery failures and retry, which is exactly wrong for requests we
//! deliberately discarded.

use crate::db::users::{self, ContactLink, TagSet, UserRecord};
use crate::services::meta::SyncContext;
use crate::services::{LockAction, LockConflict};
use crate::AppState;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use crmgate_common::events::CrmEvent;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct WebhookQuery {
    action: Option<String>,
    access_key: Option<String>,
    /// Contact id may arrive in the query string for GET-style hooks
    contact_id: Option<String>,
}

/// Webhook payload body (all fields optional; merged over the query)
#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(alias = "contactId")]
    contact_id: Option<String>,
    email: Option<String>,
    tags: Option<Vec<String>>,
    role: Option<String>,
}

/// GET/POST /webhook handler
async fn receive_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Response {
    // Boundary check: the shared secret gates everything else
    let provided_key = query.access_key.as_deref().unwrap_or_default();
    if state.webhook_secret.is_empty() || provided_key != state.webhook_secret.as_str() {
        warn!("Webhook rejected: invalid access key");
        return (StatusCode::FORBIDDEN, "Invalid access key\n").into_response();
    }

    let action_name = query.action.as_deref().unwrap_or_default().to_string();

    let payload: WebhookPayload = if body.is_empty() {
        WebhookPayload::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => {
                return reject(&state, &action_name, format!("Aborted: unreadable payload ({})", e))
            }
        }
    };

    let action = match action_name.as_str() {
        "test" => return (StatusCode::OK, "Test successful\n").into_response(),
        "update" => LockAction::Update,
        "update_tags" => LockAction::UpdateTags,
        "add" => LockAction::Add,
        other => {
            return reject(
                &state,
                other,
                format!("Aborted: unsupported action '{}'", other),
            )
        }
    };

    let contact_id = match payload.contact_id.clone().or_else(|| query.contact_id.clone()) {
        Some(id) if !id.is_empty() => id,
        _ => {
            return reject(
                &state,
                &action_name,
                "Aborted: no contact id found in payload".to_string(),
            )
        }
    };

    // One in-flight webhook per contact; classify and discard the rest
    if let Err(conflict) = state.locks.try_acquire(&contact_id, action) {
        let classification = match conflict {
            LockConflict::Duplicate => "a duplicate of the action already in flight",
            LockConflict::Redundant => "covered by the broader action already in flight",
            LockConflict::Conflicting => "conflicting with the action already in flight",
        };
        warn!(
            contact_id = %contact_id,
            action = %action_name,
            classification,
            "Webhook discarded: contact is locked"
        );
        return reject(
            &state,
            &action_name,
            format!(
                "Doing it wrong: request for contact {} is {}\n",
                contact_id, classification
            ),
        );
    }

    state.event_bus.emit_lossy(CrmEvent::WebhookReceived {
        action: action_name.clone(),
        contact_id: contact_id.clone(),
        timestamp: Utc::now(),
    });

    let outcome = dispatch(&state, action, &contact_id, &payload).await;

    // Handler completion clears the lock; the TTL covers crashes
    state.locks.release(&contact_id);

    match outcome {
        Ok(message) => {
            info!(contact_id = %contact_id, action = %action_name, "Webhook processed");
            (StatusCode::OK, message).into_response()
        }
        Err(message) => reject(&state, &action_name, message),
    }
}

/// Emit a rejection event and answer 200 with the diagnostic
fn reject(state: &AppState, action: &str, message: String) -> Response {
    state.event_bus.emit_lossy(CrmEvent::WebhookRejected {
        action: action.to_string(),
        reason: message.clone(),
        timestamp: Utc::now(),
    });
    (StatusCode::OK, message).into_response()
}

/// Run the matched handler; Err carries the diagnostic body
async fn dispatch(
    state: &AppState,
    action: LockAction,
    contact_id: &str,
    payload: &WebhookPayload,
) -> Result<String, String> {
    match action {
        LockAction::Update => {
            let user = resolve_user(state, contact_id, payload).await?;
            if let Err(e) = state.meta.pull(user.user_id, SyncContext::System).await {
                return Err(format!("Error: meta pull failed ({})\n", e));
            }
            sync_tags(state, &user, contact_id, payload).await?;
            Ok(format!("Success: contact {} updated\n", contact_id))
        }
        LockAction::UpdateTags => {
            let user = resolve_user(state, contact_id, payload).await?;
            sync_tags(state, &user, contact_id, payload).await?;
            Ok(format!("Success: tags updated for contact {}\n", contact_id))
        }
        LockAction::Add => add_user(state, contact_id, payload).await,
    }
}

/// Locate the local user for a contact, falling back to email lookup
///
/// A user matched by email gets the contact link written back, so the
/// next webhook resolves directly.
async fn resolve_user(
    state: &AppState,
    contact_id: &str,
    payload: &WebhookPayload,
) -> Result<UserRecord, String> {
    match users::get_user_by_contact_id(&state.db, contact_id).await {
        Ok(Some(user)) => return Ok(user),
        Ok(None) => {}
        Err(e) => return Err(format!("Error: user lookup failed ({})\n", e)),
    }

    let email = payload
        .email
        .as_deref()
        .ok_or_else(|| format!("Aborted: no user found for contact {}\n", contact_id))?;

    match users::get_user_by_email(&state.db, email).await {
        Ok(Some(user)) => {
            let link = ContactLink::Linked(contact_id.to_string());
            if let Err(e) = users::set_contact_link(&state.db, user.user_id, &link).await {
                return Err(format!("Error: failed to link contact ({})\n", e));
            }
            Ok(user)
        }
        Ok(None) => Err(format!(
            "Aborted: no user found for contact {} or email {}\n",
            contact_id, email
        )),
        Err(e) => Err(format!("Error: user lookup failed ({})\n", e)),
    }
}

/// Sync tags from the payload when present, otherwise refetch remotely
async fn sync_tags(
    state: &AppState,
    user: &UserRecord,
    contact_id: &str,
    payload: &WebhookPayload,
) -> Result<(), String> {
    let result = match &payload.tags {
        Some(tags) => {
            let tag_set: TagSet = tags.iter().cloned().collect();
            state.tags.set_tags(user.user_id, tag_set).await
        }
        None => state
            .tags
            .get_tags(user.user_id, true, Some(contact_id))
            .await
            .map(|_| ()),
    };

    result.map_err(|e| format!("Error: tag sync failed ({})\n", e))
}

/// Create a local user from the webhook payload
async fn add_user(
    state: &AppState,
    contact_id: &str,
    payload: &WebhookPayload,
) -> Result<String, String> {
    let email = payload
        .email
        .as_deref()
        .ok_or_else(|| "Aborted: add requires an email in the payload\n".to_string())?;

    match users::get_user_by_email(&state.db, email).await {
        Ok(Some(existing)) => {
            // Already present: just make sure the link is recorded
            let link = ContactLink::Linked(contact_id.to_string());
            if let Err(e) = users::set_contact_link(&state.db, existing.user_id, &link).await {
                return Err(format!("Error: failed to link contact ({})\n", e));
            }
            return Ok(format!(
                "Success: user already exists, linked to contact {}\n",
                contact_id
            ));
        }
        Ok(None) => {}
        Err(e) => return Err(format!("Error: user lookup failed ({})\n", e)),
    }

    let role = match &payload.role {
        Some(role) if state.options.known_roles.iter().any(|r| r == role) => role.clone(),
        Some(role) => {
            warn!(role = %role, "Ignoring unknown role in add webhook");
            "subscriber".to_string()
        }
        None => "subscriber".to_string(),
    };

    let mut user = UserRecord::new(email, role);
    user.contact = ContactLink::Linked(contact_id.to_string());
    if let Err(e) = users::insert_user(&state.db, &user).await {
        return Err(format!("Error: failed to create user ({})\n", e));
    }

    state.event_bus.emit_lossy(CrmEvent::UserCreated {
        user_id: user.user_id,
        contact_id: contact_id.to_string(),
        timestamp: Utc::now(),
    });

    if payload.tags.is_some() {
        sync_tags(state, &user, contact_id, payload).await?;
    }

    Ok(format!(
        "Success: user created for contact {}\n",
        contact_id
    ))
}

/// Build webhook routes
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook", get(receive_webhook).post(receive_webhook))
}
