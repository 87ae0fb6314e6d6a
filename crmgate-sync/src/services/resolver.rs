//! Contact resolution
//!
//! Maps a local user to a remote CRM contact by email lookup and caches
//! the result on the user row. A lookup that finds nothing is cached too
//! ([`ContactLink::NotFound`]) so a page load never re-queries the CRM for
//! a user known to be absent.

use crate::crm::CrmConnection;
use crate::db::users::{self, ContactLink};
use chrono::Utc;
use crmgate_common::events::{CrmEvent, EventBus};
use crmgate_common::{Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct ContactResolver {
    db: SqlitePool,
    crm: Arc<dyn CrmConnection>,
    event_bus: EventBus,
}

impl ContactResolver {
    pub fn new(db: SqlitePool, crm: Arc<dyn CrmConnection>, event_bus: EventBus) -> Self {
        Self { db, crm, event_bus }
    }

    /// Resolve the contact id for a user
    ///
    /// Returns the cached id unless `force` is set. On a cache miss (or
    /// force) the CRM is queried by email and the outcome is cached,
    /// including a confirmed miss. Adapter errors are logged and resolve
    /// to `None` without caching, so the surrounding request continues.
    pub async fn contact_id(&self, user_id: Uuid, force: bool) -> Result<Option<String>> {
        let user = users::get_user(&self.db, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;

        if !force {
            match &user.contact {
                ContactLink::Linked(id) => return Ok(Some(id.clone())),
                ContactLink::NotFound => return Ok(None),
                ContactLink::Unknown => {}
            }
        }

        let link = match self.crm.get_contact_id(&user.email).await {
            Ok(Some(id)) => ContactLink::Linked(id),
            Ok(None) => ContactLink::NotFound,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    email = %user.email,
                    error = %e,
                    "Contact lookup failed; treating as not found"
                );
                return Ok(None);
            }
        };

        users::set_contact_link(&self.db, user_id, &link).await?;

        self.event_bus.emit_lossy(CrmEvent::ContactResolved {
            user_id,
            contact_id: link.id().map(str::to_string),
            timestamp: Utc::now(),
        });

        Ok(link.id().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::MockCrm;
    use crate::db::test_pool;
    use crate::db::users::UserRecord;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    async fn setup() -> (SqlitePool, Arc<MockCrm>, ContactResolver) {
        let pool = test_pool().await;
        let crm = Arc::new(MockCrm::new());
        let resolver = ContactResolver::new(
            pool.clone(),
            crm.clone() as Arc<dyn CrmConnection>,
            EventBus::new(16),
        );
        (pool, crm, resolver)
    }

    #[tokio::test]
    async fn test_lookup_and_cache() {
        let (pool, crm, resolver) = setup().await;

        let contact_id = crm.seed_contact("a@example.com", HashMap::new(), vec![]);
        let user = UserRecord::new("a@example.com", "subscriber");
        users::insert_user(&pool, &user).await.unwrap();

        let resolved = resolver.contact_id(user.user_id, false).await.unwrap();
        assert_eq!(resolved, Some(contact_id));
        assert_eq!(crm.calls.get_contact_id.load(Ordering::SeqCst), 1);

        // Second call served from cache
        resolver.contact_id(user.user_id, false).await.unwrap();
        assert_eq!(crm.calls.get_contact_id.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_result_cached() {
        let (pool, crm, resolver) = setup().await;

        let user = UserRecord::new("missing@example.com", "subscriber");
        users::insert_user(&pool, &user).await.unwrap();

        assert_eq!(resolver.contact_id(user.user_id, false).await.unwrap(), None);
        assert_eq!(resolver.contact_id(user.user_id, false).await.unwrap(), None);
        // The confirmed miss is cached; only one remote lookup ran
        assert_eq!(crm.calls.get_contact_id.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_requeries() {
        let (pool, crm, resolver) = setup().await;

        let user = UserRecord::new("late@example.com", "subscriber");
        users::insert_user(&pool, &user).await.unwrap();

        assert_eq!(resolver.contact_id(user.user_id, false).await.unwrap(), None);

        // Contact appears remotely afterwards
        let contact_id = crm.seed_contact("late@example.com", HashMap::new(), vec![]);

        assert_eq!(resolver.contact_id(user.user_id, false).await.unwrap(), None);
        assert_eq!(
            resolver.contact_id(user.user_id, true).await.unwrap(),
            Some(contact_id)
        );
    }

    #[tokio::test]
    async fn test_adapter_error_is_soft_and_uncached() {
        let (pool, crm, resolver) = setup().await;

        let user = UserRecord::new("a@example.com", "subscriber");
        users::insert_user(&pool, &user).await.unwrap();

        crm.fail_all.store(true, Ordering::SeqCst);
        assert_eq!(resolver.contact_id(user.user_id, false).await.unwrap(), None);

        // Error was not cached as a negative result
        crm.fail_all.store(false, Ordering::SeqCst);
        let contact_id = crm.seed_contact("a@example.com", HashMap::new(), vec![]);
        assert_eq!(
            resolver.contact_id(user.user_id, false).await.unwrap(),
            Some(contact_id)
        );
    }
}
