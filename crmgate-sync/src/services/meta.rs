//! Profile field push/pull
//!
//! Moves profile fields between local user rows and the CRM, governed by
//! the configured field mapping. Outbound and inbound payloads run
//! through an explicit transformation pipeline; any step can abort the
//! operation. Identity-sensitive incoming fields are guarded: password
//! and email writes are suppressed for administrator and fresh-login
//! contexts, and roles must match the known-role registry.

use crate::crm::CrmConnection;
use crate::db::settings::RuntimeOptions;
use crate::db::users::{self, UserRecord};
use crate::services::pipeline::{FieldMap, Pipeline};
use crate::services::resolver::ContactResolver;
use chrono::Utc;
use crmgate_common::events::{CrmEvent, EventBus};
use crmgate_common::{Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Who is driving this sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncContext {
    /// Background sync, webhook, or batch work
    System,
    /// An administrator acting on another user's profile
    AdminSession,
    /// The user just authenticated; their credentials are authoritative
    FreshLogin,
}

impl SyncContext {
    /// Contexts in which incoming credential fields must not be rewritten
    fn guards_credentials(&self) -> bool {
        matches!(self, SyncContext::AdminSession | SyncContext::FreshLogin)
    }
}

pub struct MetaSync {
    db: SqlitePool,
    crm: Arc<dyn CrmConnection>,
    event_bus: EventBus,
    options: Arc<RuntimeOptions>,
    resolver: ContactResolver,
    push_pipeline: Pipeline,
    pull_pipeline: Pipeline,
}

impl MetaSync {
    pub fn new(
        db: SqlitePool,
        crm: Arc<dyn CrmConnection>,
        event_bus: EventBus,
        options: Arc<RuntimeOptions>,
    ) -> Self {
        let resolver = ContactResolver::new(db.clone(), crm.clone(), event_bus.clone());
        Self {
            db,
            crm,
            event_bus,
            options,
            resolver,
            push_pipeline: Pipeline::default_push(),
            pull_pipeline: Pipeline::default_pull(),
        }
    }

    /// Replace the push pipeline (tests and custom deployments)
    pub fn with_push_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.push_pipeline = pipeline;
        self
    }

    /// Replace the pull pipeline
    pub fn with_pull_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pull_pipeline = pipeline;
        self
    }

    /// Push local profile fields to the CRM
    ///
    /// `fields` limits the push to the named local fields; omitted, every
    /// mapped field is pushed. Returns Ok(false) when the pipeline aborts,
    /// the user has no contact, or the remote update fails; none of those
    /// stop the surrounding request.
    pub async fn push(&self, user_id: Uuid, fields: Option<&[String]>) -> Result<bool> {
        let user = users::get_user(&self.db, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;

        let mut payload = FieldMap::new();
        for mapping in &self.options.field_map {
            if let Some(filter) = fields {
                if !filter.contains(&mapping.local) {
                    continue;
                }
            }
            if let Some(value) = local_field_value(&user, &mapping.local) {
                payload.insert(mapping.local.clone(), value);
            }
        }

        if payload.is_empty() {
            tracing::debug!(user_id = %user_id, "Nothing to push");
            return Ok(true);
        }

        let payload = match self.push_pipeline.run(payload) {
            Ok(data) => data,
            Err(aborted) => {
                tracing::info!(
                    user_id = %user_id,
                    step = %aborted.step,
                    reason = %aborted.reason,
                    "Push cancelled by pipeline"
                );
                return Ok(false);
            }
        };

        // Translate local field names to remote ones
        let mut remote_fields = FieldMap::new();
        for mapping in &self.options.field_map {
            if let Some(value) = payload.get(&mapping.local) {
                remote_fields.insert(mapping.remote.clone(), value.clone());
            }
        }

        let (contact_id, created) = match self.resolver.contact_id(user_id, false).await? {
            Some(id) => (id, false),
            None => {
                // No contact yet: create one when the backend supports it
                if !self.crm.capabilities().native_add {
                    tracing::warn!(user_id = %user_id, "Cannot push meta: no contact and CRM cannot add");
                    return Ok(false);
                }
                match self.crm.add_contact(&remote_fields).await {
                    Ok(new_id) => {
                        users::set_contact_link(
                            &self.db,
                            user_id,
                            &crate::db::users::ContactLink::Linked(new_id.clone()),
                        )
                        .await?;
                        tracing::info!(user_id = %user_id, contact_id = %new_id, "Created contact on push");
                        (new_id, true)
                    }
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "Remote contact creation failed");
                        return Ok(false);
                    }
                }
            }
        };

        // A freshly added contact already carries the pushed fields
        if !created {
            if let Err(e) = self.crm.update_contact(&contact_id, &remote_fields).await {
                tracing::warn!(
                    user_id = %user_id,
                    contact_id = %contact_id,
                    error = %e,
                    "Remote contact update failed"
                );
                return Ok(false);
            }
        }

        let mut synced = user.synced_meta.clone();
        for (local, value) in &payload {
            synced.insert(local.clone(), value.clone());
        }
        users::set_synced_meta(&self.db, user_id, &synced).await?;

        self.event_bus.emit_lossy(CrmEvent::MetaPushed {
            user_id,
            contact_id,
            fields: payload.keys().cloned().collect(),
            timestamp: Utc::now(),
        });

        Ok(true)
    }

    /// Pull CRM fields into local storage
    ///
    /// Requires a resolved contact. Only mappings flagged for pull are
    /// written back, each passing the identity guards for the acting
    /// context. Invalid incoming values are logged and skipped, never
    /// applied.
    pub async fn pull(&self, user_id: Uuid, ctx: SyncContext) -> Result<bool> {
        let mut user = users::get_user(&self.db, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;

        let contact_id = match self.resolver.contact_id(user_id, false).await? {
            Some(id) => id,
            None => {
                tracing::warn!(user_id = %user_id, "Cannot pull meta: no contact id");
                return Ok(false);
            }
        };

        let remote = match self.crm.load_contact(&contact_id).await {
            Ok(fields) => fields,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    contact_id = %contact_id,
                    error = %e,
                    "Remote contact load failed"
                );
                return Ok(false);
            }
        };

        // Translate remote names back to local ones, pull-enabled only
        let mut incoming = FieldMap::new();
        for mapping in &self.options.field_map {
            if !mapping.pull {
                continue;
            }
            if let Some(value) = remote.get(&mapping.remote) {
                incoming.insert(mapping.local.clone(), value.clone());
            }
        }

        let incoming = match self.pull_pipeline.run(incoming) {
            Ok(data) => data,
            Err(aborted) => {
                tracing::info!(
                    user_id = %user_id,
                    step = %aborted.step,
                    reason = %aborted.reason,
                    "Pull cancelled by pipeline"
                );
                return Ok(false);
            }
        };

        let mut written = Vec::new();
        for (field, value) in &incoming {
            if !self.should_apply(&user, field, value, ctx) {
                continue;
            }
            users::set_profile_field(&self.db, &mut user, field, value).await?;
            written.push(field.clone());
        }

        let mut synced = user.synced_meta.clone();
        for field in &written {
            if let Some(value) = incoming.get(field) {
                synced.insert(field.clone(), value.clone());
            }
        }
        users::set_synced_meta(&self.db, user_id, &synced).await?;

        self.event_bus.emit_lossy(CrmEvent::MetaPulled {
            user_id,
            contact_id,
            fields: written,
            timestamp: Utc::now(),
        });

        Ok(true)
    }

    /// Field-level guard for incoming values
    fn should_apply(&self, user: &UserRecord, field: &str, value: &str, ctx: SyncContext) -> bool {
        match field {
            "password" => {
                if ctx.guards_credentials() {
                    tracing::debug!(user_id = %user.user_id, "Skipping password pull in guarded context");
                    return false;
                }
                // Unchanged hash is not rewritten
                user.password_hash.as_deref() != Some(value)
            }
            "email" => {
                if ctx.guards_credentials() {
                    tracing::debug!(user_id = %user.user_id, "Skipping email pull in guarded context");
                    return false;
                }
                user.email != value
            }
            "role" => {
                if !self.options.known_roles.iter().any(|r| r == value) {
                    tracing::warn!(
                        user_id = %user.user_id,
                        role = %value,
                        "Ignoring unknown role from CRM"
                    );
                    return false;
                }
                true
            }
            _ => true,
        }
    }
}

/// Read one local field off a user record
fn local_field_value(user: &UserRecord, field: &str) -> Option<String> {
    match field {
        "email" => Some(user.email.clone()),
        "display_name" => user.display_name.clone(),
        "role" => Some(user.role.clone()),
        "password" => user.password_hash.clone(),
        other => user.meta.get(other).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::MockCrm;
    use crate::db::test_pool;
    use crate::db::users::ContactLink;
    use crate::services::pipeline::StepOutcome;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    struct Fixture {
        pool: SqlitePool,
        crm: Arc<MockCrm>,
        options: Arc<RuntimeOptions>,
        bus: EventBus,
    }

    async fn setup() -> Fixture {
        let pool = test_pool().await;
        let crm = Arc::new(MockCrm::new());
        Fixture {
            pool,
            crm,
            options: Arc::new(RuntimeOptions::default()),
            bus: EventBus::new(64),
        }
    }

    impl Fixture {
        fn meta_sync(&self) -> MetaSync {
            MetaSync::new(
                self.pool.clone(),
                self.crm.clone() as Arc<dyn CrmConnection>,
                self.bus.clone(),
                self.options.clone(),
            )
        }

        async fn linked_user(&self, email: &str) -> (UserRecord, String) {
            let contact_id = self.crm.seed_contact(email, HashMap::new(), vec![]);
            let mut user = UserRecord::new(email, "subscriber");
            user.display_name = Some("Casey".to_string());
            user.contact = ContactLink::Linked(contact_id.clone());
            users::insert_user(&self.pool, &user).await.unwrap();
            (user, contact_id)
        }
    }

    #[tokio::test]
    async fn test_push_all_mapped_fields() {
        let f = setup().await;
        let (user, contact_id) = f.linked_user("a@example.com").await;

        let ok = f.meta_sync().push(user.user_id, None).await.unwrap();
        assert!(ok);

        let remote = f.crm.remote_fields(&contact_id);
        assert_eq!(remote.get("name").map(String::as_str), Some("Casey"));
        assert_eq!(remote.get("email").map(String::as_str), Some("a@example.com"));
        assert_eq!(remote.get("role").map(String::as_str), Some("subscriber"));
    }

    #[tokio::test]
    async fn test_push_subset_of_fields() {
        let f = setup().await;
        let (user, contact_id) = f.linked_user("a@example.com").await;

        let ok = f
            .meta_sync()
            .push(user.user_id, Some(&["display_name".to_string()]))
            .await
            .unwrap();
        assert!(ok);

        let remote = f.crm.remote_fields(&contact_id);
        assert_eq!(remote.get("name").map(String::as_str), Some("Casey"));
        assert!(!remote.contains_key("role"));
    }

    #[tokio::test]
    async fn test_push_pipeline_abort_cancels() {
        let f = setup().await;
        let (user, _) = f.linked_user("a@example.com").await;

        let meta = f.meta_sync().with_push_pipeline(
            Pipeline::new().step("veto", |_| StepOutcome::Abort("vetoed".to_string())),
        );

        let ok = meta.push(user.user_id, None).await.unwrap();
        assert!(!ok);
        assert_eq!(f.crm.calls.update_contact.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_push_without_contact_creates_one() {
        let f = setup().await;

        let user = UserRecord::new("nobody@example.com", "subscriber");
        users::insert_user(&f.pool, &user).await.unwrap();

        let ok = f.meta_sync().push(user.user_id, None).await.unwrap();
        assert!(ok);
        assert_eq!(f.crm.calls.add_contact.load(Ordering::SeqCst), 1);
        // Fresh contacts carry the pushed fields; no follow-up update
        assert_eq!(f.crm.calls.update_contact.load(Ordering::SeqCst), 0);

        let loaded = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert!(loaded.contact.id().is_some(), "new contact is linked");
    }

    #[tokio::test]
    async fn test_push_without_contact_fails_soft_when_crm_cannot_add() {
        let f = setup().await;
        f.crm.can_add.store(false, Ordering::SeqCst);

        let user = UserRecord::new("nobody@example.com", "subscriber");
        users::insert_user(&f.pool, &user).await.unwrap();

        let ok = f.meta_sync().push(user.user_id, None).await.unwrap();
        assert!(!ok);
        assert_eq!(f.crm.calls.add_contact.load(Ordering::SeqCst), 0);
        assert_eq!(f.crm.calls.update_contact.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pull_writes_mapped_fields() {
        let f = setup().await;
        let (user, contact_id) = f.linked_user("a@example.com").await;

        f.crm
            .update_contact(
                &contact_id,
                &HashMap::from([("name".to_string(), "New Name".to_string())]),
            )
            .await
            .unwrap();

        let ok = f
            .meta_sync()
            .pull(user.user_id, SyncContext::System)
            .await
            .unwrap();
        assert!(ok);

        let loaded = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(loaded.display_name.as_deref(), Some("New Name"));
    }

    #[tokio::test]
    async fn test_pull_skips_unknown_role() {
        let f = setup().await;
        let (user, contact_id) = f.linked_user("a@example.com").await;

        f.crm
            .update_contact(
                &contact_id,
                &HashMap::from([("role".to_string(), "superhacker".to_string())]),
            )
            .await
            .unwrap();

        let ok = f
            .meta_sync()
            .pull(user.user_id, SyncContext::System)
            .await
            .unwrap();
        assert!(ok);

        let loaded = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(loaded.role, "subscriber", "unknown role must not be applied");
    }

    #[tokio::test]
    async fn test_pull_applies_known_role() {
        let f = setup().await;
        let (user, contact_id) = f.linked_user("a@example.com").await;

        f.crm
            .update_contact(
                &contact_id,
                &HashMap::from([("role".to_string(), "editor".to_string())]),
            )
            .await
            .unwrap();

        f.meta_sync()
            .pull(user.user_id, SyncContext::System)
            .await
            .unwrap();

        let loaded = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(loaded.role, "editor");
    }

    #[tokio::test]
    async fn test_pull_guards_email_in_admin_context() {
        let f = setup().await;
        let (user, contact_id) = f.linked_user("a@example.com").await;

        f.crm
            .update_contact(
                &contact_id,
                &HashMap::from([("email".to_string(), "hijacked@example.com".to_string())]),
            )
            .await
            .unwrap();

        f.meta_sync()
            .pull(user.user_id, SyncContext::AdminSession)
            .await
            .unwrap();

        let loaded = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(loaded.email, "a@example.com", "email guarded in admin context");
    }

    #[tokio::test]
    async fn test_pull_without_contact_aborts() {
        let f = setup().await;

        let user = UserRecord::new("nobody@example.com", "subscriber");
        users::insert_user(&f.pool, &user).await.unwrap();

        let ok = f
            .meta_sync()
            .pull(user.user_id, SyncContext::System)
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(f.crm.calls.load_contact.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pull_records_synced_values() {
        let f = setup().await;
        let (user, contact_id) = f.linked_user("a@example.com").await;

        f.crm
            .update_contact(
                &contact_id,
                &HashMap::from([("name".to_string(), "Synced".to_string())]),
            )
            .await
            .unwrap();

        f.meta_sync()
            .pull(user.user_id, SyncContext::System)
            .await
            .unwrap();

        let loaded = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(
            loaded.synced_meta.get("display_name").map(String::as_str),
            Some("Synced")
        );
    }
}
