//! Tag synchronization
//!
//! Reconciles the local tag cache against the CRM. The CRM is the source
//! of truth: full syncs overwrite the stored set wholesale, while single
//! apply/remove operations load the current set, call the remote first,
//! and only then write back the union/difference. Local state never
//! reflects an unconfirmed remote write.

use crate::crm::CrmConnection;
use crate::db::settings::RuntimeOptions;
use crate::db::users::{self, TagSet};
use crate::services::resolver::ContactResolver;
use chrono::Utc;
use crmgate_common::events::{CrmEvent, EventBus};
use crmgate_common::{Error, Result};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct TagSynchronizer {
    db: SqlitePool,
    crm: Arc<dyn CrmConnection>,
    event_bus: EventBus,
    options: Arc<RuntimeOptions>,
    resolver: ContactResolver,
    /// Counts in-flight apply/remove calls to flag chained updates
    in_flight: Arc<AtomicUsize>,
}

impl TagSynchronizer {
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
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn resolver(&self) -> &ContactResolver {
        &self.resolver
    }

    /// Get the user's tag set
    ///
    /// Returns the cached set unless `force` is set or the tags were never
    /// fetched (a NULL cache is not a confirmed-empty cache). On a remote
    /// fetch the result is persisted through [`set_tags`], firing the
    /// usual change events.
    ///
    /// `known_contact` skips the contact lookup when the caller already
    /// holds a fresh id (e.g. from a webhook payload).
    ///
    /// [`set_tags`]: TagSynchronizer::set_tags
    pub async fn get_tags(
        &self,
        user_id: Uuid,
        force: bool,
        known_contact: Option<&str>,
    ) -> Result<TagSet> {
        let user = users::get_user(&self.db, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;

        if !force {
            if let Some(tags) = user.tags.clone() {
                return Ok(tags);
            }
        }

        let contact_id = match known_contact {
            Some(id) => Some(id.to_string()),
            None => self.resolver.contact_id(user_id, false).await?,
        };

        let contact_id = match contact_id {
            Some(id) => id,
            None => {
                tracing::debug!(user_id = %user_id, "No contact id; returning cached tags");
                return Ok(user.tags.unwrap_or_default());
            }
        };

        let fetched = match self.crm.get_tags(&contact_id).await {
            Ok(tags) => tags.into_iter().collect::<TagSet>(),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    contact_id = %contact_id,
                    error = %e,
                    "Tag fetch failed; returning cached tags"
                );
                return Ok(user.tags.unwrap_or_default());
            }
        };

        self.set_tags(user_id, fetched.clone()).await?;
        Ok(fetched)
    }

    /// Overwrite the stored tag set and fire change events
    ///
    /// Event order is fixed: TagsApplied (new − old), TagsRemoved
    /// (old − new), TagsChanged (full new set). An unchanged set fires
    /// only TagsUnchanged and leaves storage untouched, except that a
    /// never-fetched cache is promoted to confirmed-empty.
    pub async fn set_tags(&self, user_id: Uuid, new_tags: TagSet) -> Result<()> {
        let user = users::get_user(&self.db, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;

        let stored = user.tags.clone();
        let old_tags = stored.clone().unwrap_or_default();

        if old_tags == new_tags {
            if stored.is_none() {
                // Promote NULL to confirmed-empty so the next read is cached
                users::set_tags(&self.db, user_id, &new_tags).await?;
            }
            self.event_bus.emit_lossy(CrmEvent::TagsUnchanged {
                user_id,
                timestamp: Utc::now(),
            });
            return Ok(());
        }

        users::set_tags(&self.db, user_id, &new_tags).await?;

        let added: Vec<String> = new_tags.difference(&old_tags).cloned().collect();
        let removed: Vec<String> = old_tags.difference(&new_tags).cloned().collect();

        tracing::info!(
            user_id = %user_id,
            added = added.len(),
            removed = removed.len(),
            "Tag set updated"
        );

        self.event_bus.emit_lossy(CrmEvent::TagsApplied {
            user_id,
            tags: added,
            timestamp: Utc::now(),
        });
        self.event_bus.emit_lossy(CrmEvent::TagsRemoved {
            user_id,
            tags: removed,
            timestamp: Utc::now(),
        });
        self.event_bus.emit_lossy(CrmEvent::TagsChanged {
            user_id,
            tags: new_tags.iter().cloned().collect(),
            timestamp: Utc::now(),
        });

        Ok(())
    }

    /// Apply tags to a user, remote first
    ///
    /// Returns Ok(true) on success (including the no-op case where the
    /// user already holds every requested tag and reapply prevention is
    /// on), Ok(false) when the remote call failed. Local state is only
    /// mutated after remote confirmation.
    pub async fn apply_tags(&self, user_id: Uuid, tags: &TagSet) -> Result<bool> {
        if tags.is_empty() {
            return Ok(true);
        }

        self.warn_if_chained(user_id);
        let _guard = InFlightGuard::enter(&self.in_flight);

        let user = users::get_user(&self.db, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;

        let current = user.tags.unwrap_or_default();
        let missing: TagSet = tags.difference(&current).cloned().collect();

        if missing.is_empty() && self.options.prevent_reapply {
            tracing::debug!(user_id = %user_id, "All tags already present; skipping remote call");
            return Ok(true);
        }

        let contact_id = match self.resolver.contact_id(user_id, false).await? {
            Some(id) => id,
            None => {
                tracing::warn!(user_id = %user_id, "Cannot apply tags: no contact id");
                return Ok(false);
            }
        };

        if !self.crm.capabilities().creates_tags {
            tracing::debug!(
                user_id = %user_id,
                "CRM does not create unknown tags; remote apply may reject new labels"
            );
        }

        let to_send: Vec<String> = tags.iter().cloned().collect();
        if let Err(e) = self.crm.apply_tags(&to_send, &contact_id).await {
            tracing::warn!(
                user_id = %user_id,
                contact_id = %contact_id,
                error = %e,
                "Remote apply_tags failed; local state unchanged"
            );
            return Ok(false);
        }

        let new_tags: TagSet = current.union(tags).cloned().collect();
        self.set_tags(user_id, new_tags).await?;
        Ok(true)
    }

    /// Remove tags from a user, remote first
    ///
    /// Mirror of [`apply_tags`]: skips the remote call when the user
    /// already lacks every requested tag.
    ///
    /// [`apply_tags`]: TagSynchronizer::apply_tags
    pub async fn remove_tags(&self, user_id: Uuid, tags: &TagSet) -> Result<bool> {
        if tags.is_empty() {
            return Ok(true);
        }

        self.warn_if_chained(user_id);
        let _guard = InFlightGuard::enter(&self.in_flight);

        let user = users::get_user(&self.db, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;

        let current = user.tags.unwrap_or_default();
        let held: TagSet = tags.intersection(&current).cloned().collect();

        if held.is_empty() && self.options.prevent_reapply {
            tracing::debug!(user_id = %user_id, "No requested tags present; skipping remote call");
            return Ok(true);
        }

        let contact_id = match self.resolver.contact_id(user_id, false).await? {
            Some(id) => id,
            None => {
                tracing::warn!(user_id = %user_id, "Cannot remove tags: no contact id");
                return Ok(false);
            }
        };

        let to_send: Vec<String> = tags.iter().cloned().collect();
        if let Err(e) = self.crm.remove_tags(&to_send, &contact_id).await {
            tracing::warn!(
                user_id = %user_id,
                contact_id = %contact_id,
                error = %e,
                "Remote remove_tags failed; local state unchanged"
            );
            return Ok(false);
        }

        let new_tags: TagSet = current.difference(tags).cloned().collect();
        self.set_tags(user_id, new_tags).await?;
        Ok(true)
    }

    /// Flag apply/remove calls issued while another one is still in
    /// flight on this synchronizer. Chained updates from tags-changed
    /// consumers risk cascading; they are allowed but logged.
    fn warn_if_chained(&self, user_id: Uuid) {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            tracing::warn!(
                user_id = %user_id,
                "Chained tag update detected; a tag mutation was requested while another is in flight"
            );
        }
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::MockCrm;
    use crate::db::test_pool;
    use crate::db::users::UserRecord;
    use std::collections::HashMap;

    struct Fixture {
        pool: SqlitePool,
        crm: Arc<MockCrm>,
        sync: TagSynchronizer,
        bus: EventBus,
    }

    async fn setup(options: RuntimeOptions) -> Fixture {
        let pool = test_pool().await;
        let crm = Arc::new(MockCrm::new());
        let bus = EventBus::new(64);
        let sync = TagSynchronizer::new(
            pool.clone(),
            crm.clone() as Arc<dyn CrmConnection>,
            bus.clone(),
            Arc::new(options),
        );
        Fixture { pool, crm, sync, bus }
    }

    fn tags(names: &[&str]) -> TagSet {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<CrmEvent>) -> Vec<CrmEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_set_tags_diff_events() {
        let f = setup(RuntimeOptions::default()).await;
        let mut rx = f.bus.subscribe();

        let user = UserRecord::new("a@example.com", "subscriber");
        users::insert_user(&f.pool, &user).await.unwrap();
        users::set_tags(&f.pool, user.user_id, &tags(&["A", "B"])).await.unwrap();

        // CRM now reports {B, C}
        f.sync.set_tags(user.user_id, tags(&["B", "C"])).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);

        match &events[0] {
            CrmEvent::TagsApplied { tags, .. } => assert_eq!(tags, &vec!["C".to_string()]),
            other => panic!("expected TagsApplied first, got {:?}", other),
        }
        match &events[1] {
            CrmEvent::TagsRemoved { tags, .. } => assert_eq!(tags, &vec!["A".to_string()]),
            other => panic!("expected TagsRemoved second, got {:?}", other),
        }
        match &events[2] {
            CrmEvent::TagsChanged { tags: full, .. } => {
                assert_eq!(full, &vec!["B".to_string(), "C".to_string()])
            }
            other => panic!("expected TagsChanged last, got {:?}", other),
        }

        let stored = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(stored.tags, Some(tags(&["B", "C"])));
    }

    #[tokio::test]
    async fn test_set_tags_unchanged_fires_single_event() {
        let f = setup(RuntimeOptions::default()).await;

        let user = UserRecord::new("a@example.com", "subscriber");
        users::insert_user(&f.pool, &user).await.unwrap();
        users::set_tags(&f.pool, user.user_id, &tags(&["A"])).await.unwrap();

        let mut rx = f.bus.subscribe();
        f.sync.set_tags(user.user_id, tags(&["A"])).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "TagsUnchanged");
    }

    #[tokio::test]
    async fn test_never_fetched_promoted_to_confirmed_empty() {
        let f = setup(RuntimeOptions::default()).await;

        let user = UserRecord::new("a@example.com", "subscriber");
        users::insert_user(&f.pool, &user).await.unwrap();

        f.sync.set_tags(user.user_id, TagSet::new()).await.unwrap();

        let stored = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(stored.tags, Some(TagSet::new()), "NULL promoted to []");
    }

    #[tokio::test]
    async fn test_apply_tags_idempotent_with_prevent_reapply() {
        let f = setup(RuntimeOptions::default()).await;

        let mut user = UserRecord::new("a@example.com", "subscriber");
        user.contact = crate::db::users::ContactLink::Linked("c-1".to_string());
        users::insert_user(&f.pool, &user).await.unwrap();
        users::set_tags(&f.pool, user.user_id, &tags(&["A"])).await.unwrap();

        let ok = f.sync.apply_tags(user.user_id, &tags(&["A"])).await.unwrap();
        assert!(ok);
        // No remote call was made
        assert_eq!(f.crm.calls.apply_tags.load(Ordering::SeqCst), 0);

        let stored = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(stored.tags, Some(tags(&["A"])), "stored set unchanged");
    }

    #[tokio::test]
    async fn test_apply_tags_calls_remote_when_prevention_off() {
        let mut options = RuntimeOptions::default();
        options.prevent_reapply = false;
        let f = setup(options).await;

        let contact_id = f.crm.seed_contact("a@example.com", HashMap::new(), vec!["A".to_string()]);
        let mut user = UserRecord::new("a@example.com", "subscriber");
        user.contact = crate::db::users::ContactLink::Linked(contact_id);
        users::insert_user(&f.pool, &user).await.unwrap();
        users::set_tags(&f.pool, user.user_id, &tags(&["A"])).await.unwrap();

        let ok = f.sync.apply_tags(user.user_id, &tags(&["A"])).await.unwrap();
        assert!(ok);
        assert_eq!(f.crm.calls.apply_tags.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_apply_tags_remote_failure_leaves_local_untouched() {
        let f = setup(RuntimeOptions::default()).await;

        let contact_id = f.crm.seed_contact("a@example.com", HashMap::new(), vec![]);
        let mut user = UserRecord::new("a@example.com", "subscriber");
        user.contact = crate::db::users::ContactLink::Linked(contact_id);
        users::insert_user(&f.pool, &user).await.unwrap();
        users::set_tags(&f.pool, user.user_id, &tags(&["A"])).await.unwrap();

        f.crm.fail_all.store(true, Ordering::SeqCst);

        let ok = f.sync.apply_tags(user.user_id, &tags(&["B"])).await.unwrap();
        assert!(!ok);

        let stored = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(stored.tags, Some(tags(&["A"])), "failed remote call must not mutate local state");
    }

    #[tokio::test]
    async fn test_apply_tags_union_after_success() {
        let f = setup(RuntimeOptions::default()).await;

        let contact_id = f.crm.seed_contact("a@example.com", HashMap::new(), vec!["A".to_string()]);
        let mut user = UserRecord::new("a@example.com", "subscriber");
        user.contact = crate::db::users::ContactLink::Linked(contact_id.clone());
        users::insert_user(&f.pool, &user).await.unwrap();
        users::set_tags(&f.pool, user.user_id, &tags(&["A"])).await.unwrap();

        let ok = f.sync.apply_tags(user.user_id, &tags(&["B"])).await.unwrap();
        assert!(ok);

        let stored = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(stored.tags, Some(tags(&["A", "B"])));
        assert!(f.crm.remote_tags(&contact_id).contains(&"B".to_string()));
    }

    #[tokio::test]
    async fn test_remove_tags_difference_after_success() {
        let f = setup(RuntimeOptions::default()).await;

        let contact_id = f.crm.seed_contact(
            "a@example.com",
            HashMap::new(),
            vec!["A".to_string(), "B".to_string()],
        );
        let mut user = UserRecord::new("a@example.com", "subscriber");
        user.contact = crate::db::users::ContactLink::Linked(contact_id.clone());
        users::insert_user(&f.pool, &user).await.unwrap();
        users::set_tags(&f.pool, user.user_id, &tags(&["A", "B"])).await.unwrap();

        let ok = f.sync.remove_tags(user.user_id, &tags(&["A"])).await.unwrap();
        assert!(ok);

        let stored = users::get_user(&f.pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(stored.tags, Some(tags(&["B"])));
        assert_eq!(f.crm.remote_tags(&contact_id), vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_tags_skips_when_absent() {
        let f = setup(RuntimeOptions::default()).await;

        let mut user = UserRecord::new("a@example.com", "subscriber");
        user.contact = crate::db::users::ContactLink::Linked("c-1".to_string());
        users::insert_user(&f.pool, &user).await.unwrap();
        users::set_tags(&f.pool, user.user_id, &tags(&["A"])).await.unwrap();

        let ok = f.sync.remove_tags(user.user_id, &tags(&["Z"])).await.unwrap();
        assert!(ok);
        assert_eq!(f.crm.calls.remove_tags.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_tags_cached_vs_forced() {
        let f = setup(RuntimeOptions::default()).await;

        let contact_id = f.crm.seed_contact("a@example.com", HashMap::new(), vec!["X".to_string()]);
        let mut user = UserRecord::new("a@example.com", "subscriber");
        user.contact = crate::db::users::ContactLink::Linked(contact_id.clone());
        users::insert_user(&f.pool, &user).await.unwrap();
        users::set_tags(&f.pool, user.user_id, &tags(&["stale"])).await.unwrap();

        // Cached read does not hit the CRM
        let cached = f.sync.get_tags(user.user_id, false, None).await.unwrap();
        assert_eq!(cached, tags(&["stale"]));
        assert_eq!(f.crm.calls.get_tags.load(Ordering::SeqCst), 0);

        // Forced read fetches and persists
        let fresh = f.sync.get_tags(user.user_id, true, None).await.unwrap();
        assert_eq!(fresh, tags(&["X"]));
        assert_eq!(f.crm.calls.get_tags.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_tags_never_fetched_triggers_fetch() {
        let f = setup(RuntimeOptions::default()).await;

        let contact_id = f.crm.seed_contact("a@example.com", HashMap::new(), vec!["X".to_string()]);
        let mut user = UserRecord::new("a@example.com", "subscriber");
        user.contact = crate::db::users::ContactLink::Linked(contact_id);
        users::insert_user(&f.pool, &user).await.unwrap();

        // tags column is NULL: even an unforced read goes remote
        let fetched = f.sync.get_tags(user.user_id, false, None).await.unwrap();
        assert_eq!(fetched, tags(&["X"]));
        assert_eq!(f.crm.calls.get_tags.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_tags_known_contact_skips_lookup() {
        let f = setup(RuntimeOptions::default()).await;

        let contact_id = f.crm.seed_contact("a@example.com", HashMap::new(), vec!["X".to_string()]);
        let user = UserRecord::new("a@example.com", "subscriber");
        users::insert_user(&f.pool, &user).await.unwrap();

        let fetched = f
            .sync
            .get_tags(user.user_id, true, Some(&contact_id))
            .await
            .unwrap();
        assert_eq!(fetched, tags(&["X"]));
        // The payload-supplied id bypassed the email lookup
        assert_eq!(f.crm.calls.get_contact_id.load(Ordering::SeqCst), 0);
    }
}
