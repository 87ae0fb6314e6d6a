//! User record storage
//!
//! The per-user row carries the CRM linkage state: contact id, last-known
//! tag set, and the map of last-synced field values. Two sentinel encodings
//! matter here:
//!
//! - `contact_id`: NULL = never looked up, '' = lookup ran and the CRM had
//!   no matching contact (cached negative).
//! - `tags`: NULL = never fetched, '[]' = confirmed empty remotely.

use chrono::Utc;
use crmgate_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Tag sets are unordered collections of opaque CRM labels
pub type TagSet = BTreeSet<String>;

/// Cached contact linkage state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactLink {
    /// No lookup has run yet
    Unknown,
    /// A lookup ran and found no remote contact
    NotFound,
    /// Linked to a remote contact
    Linked(String),
}

impl ContactLink {
    fn from_column(value: Option<String>) -> Self {
        match value {
            None => ContactLink::Unknown,
            Some(s) if s.is_empty() => ContactLink::NotFound,
            Some(s) => ContactLink::Linked(s),
        }
    }

    fn to_column(&self) -> Option<String> {
        match self {
            ContactLink::Unknown => None,
            ContactLink::NotFound => Some(String::new()),
            ContactLink::Linked(id) => Some(id.clone()),
        }
    }

    /// The contact id, if linked
    pub fn id(&self) -> Option<&str> {
        match self {
            ContactLink::Linked(id) => Some(id),
            _ => None,
        }
    }
}

/// A local user row
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub role: String,
    pub password_hash: Option<String>,
    pub contact: ContactLink,
    /// None = tags never fetched from the CRM
    pub tags: Option<TagSet>,
    /// Arbitrary profile fields beyond the fixed columns
    pub meta: HashMap<String, String>,
    /// Last values synced to/from the CRM, keyed by local field name
    pub synced_meta: HashMap<String, String>,
}

impl UserRecord {
    /// New unlinked user
    pub fn new(email: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            email: email.into(),
            display_name: None,
            role: role.into(),
            password_hash: None,
            contact: ContactLink::Unknown,
            tags: None,
            meta: HashMap::new(),
            synced_meta: HashMap::new(),
        }
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self> {
        let user_id: String = row.try_get("user_id").map_err(Error::Database)?;
        let tags_json: Option<String> = row.try_get("tags").map_err(Error::Database)?;
        let meta_json: String = row.try_get("meta").map_err(Error::Database)?;
        let synced_json: String = row.try_get("synced_meta").map_err(Error::Database)?;

        let tags = match tags_json {
            None => None,
            Some(json) => Some(
                serde_json::from_str::<TagSet>(&json)
                    .map_err(|e| Error::Internal(format!("Corrupt tags column: {}", e)))?,
            ),
        };

        Ok(Self {
            user_id: Uuid::parse_str(&user_id)
                .map_err(|e| Error::Internal(format!("Corrupt user_id column: {}", e)))?,
            email: row.try_get("email").map_err(Error::Database)?,
            display_name: row.try_get("display_name").map_err(Error::Database)?,
            role: row.try_get("role").map_err(Error::Database)?,
            password_hash: row.try_get("password_hash").map_err(Error::Database)?,
            contact: ContactLink::from_column(row.try_get("contact_id").map_err(Error::Database)?),
            tags,
            meta: serde_json::from_str(&meta_json)
                .map_err(|e| Error::Internal(format!("Corrupt meta column: {}", e)))?,
            synced_meta: serde_json::from_str(&synced_json)
                .map_err(|e| Error::Internal(format!("Corrupt synced_meta column: {}", e)))?,
        })
    }
}

/// Insert a new user row
pub async fn insert_user(db: &SqlitePool, user: &UserRecord) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let tags_json = match &user.tags {
        None => None,
        Some(tags) => Some(serde_json::to_string(tags).map_err(|e| Error::Internal(e.to_string()))?),
    };

    sqlx::query(
        r#"
        INSERT INTO users
            (user_id, email, display_name, role, password_hash, contact_id,
             tags, meta, synced_meta, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user.user_id.to_string())
    .bind(&user.email)
    .bind(&user.display_name)
    .bind(&user.role)
    .bind(&user.password_hash)
    .bind(user.contact.to_column())
    .bind(tags_json)
    .bind(serde_json::to_string(&user.meta).map_err(|e| Error::Internal(e.to_string()))?)
    .bind(serde_json::to_string(&user.synced_meta).map_err(|e| Error::Internal(e.to_string()))?)
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}

/// Fetch a user by id
pub async fn get_user(db: &SqlitePool, user_id: Uuid) -> Result<Option<UserRecord>> {
    let row = sqlx::query("SELECT * FROM users WHERE user_id = ?")
        .bind(user_id.to_string())
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    row.as_ref().map(UserRecord::from_row).transpose()
}

/// Fetch a user by email
pub async fn get_user_by_email(db: &SqlitePool, email: &str) -> Result<Option<UserRecord>> {
    let row = sqlx::query("SELECT * FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    row.as_ref().map(UserRecord::from_row).transpose()
}

/// Fetch a user by remote contact id
pub async fn get_user_by_contact_id(
    db: &SqlitePool,
    contact_id: &str,
) -> Result<Option<UserRecord>> {
    let row = sqlx::query("SELECT * FROM users WHERE contact_id = ?")
        .bind(contact_id)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    row.as_ref().map(UserRecord::from_row).transpose()
}

/// Persist the contact linkage state for a user
pub async fn set_contact_link(db: &SqlitePool, user_id: Uuid, link: &ContactLink) -> Result<()> {
    sqlx::query("UPDATE users SET contact_id = ?, updated_at = ? WHERE user_id = ?")
        .bind(link.to_column())
        .bind(Utc::now().to_rfc3339())
        .bind(user_id.to_string())
        .execute(db)
        .await
        .map_err(Error::Database)?;

    Ok(())
}

/// Overwrite the stored tag set wholesale
pub async fn set_tags(db: &SqlitePool, user_id: Uuid, tags: &TagSet) -> Result<()> {
    let json = serde_json::to_string(tags).map_err(|e| Error::Internal(e.to_string()))?;

    sqlx::query("UPDATE users SET tags = ?, updated_at = ? WHERE user_id = ?")
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id.to_string())
        .execute(db)
        .await
        .map_err(Error::Database)?;

    Ok(())
}

/// Write one local profile field
///
/// Known column names map to their columns; anything else lands in the
/// `meta` JSON map.
pub async fn set_profile_field(
    db: &SqlitePool,
    user: &mut UserRecord,
    field: &str,
    value: &str,
) -> Result<()> {
    match field {
        "email" => {
            sqlx::query("UPDATE users SET email = ?, updated_at = ? WHERE user_id = ?")
                .bind(value)
                .bind(Utc::now().to_rfc3339())
                .bind(user.user_id.to_string())
                .execute(db)
                .await
                .map_err(Error::Database)?;
            user.email = value.to_string();
        }
        "display_name" => {
            sqlx::query("UPDATE users SET display_name = ?, updated_at = ? WHERE user_id = ?")
                .bind(value)
                .bind(Utc::now().to_rfc3339())
                .bind(user.user_id.to_string())
                .execute(db)
                .await
                .map_err(Error::Database)?;
            user.display_name = Some(value.to_string());
        }
        "role" => {
            sqlx::query("UPDATE users SET role = ?, updated_at = ? WHERE user_id = ?")
                .bind(value)
                .bind(Utc::now().to_rfc3339())
                .bind(user.user_id.to_string())
                .execute(db)
                .await
                .map_err(Error::Database)?;
            user.role = value.to_string();
        }
        "password" => {
            sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE user_id = ?")
                .bind(value)
                .bind(Utc::now().to_rfc3339())
                .bind(user.user_id.to_string())
                .execute(db)
                .await
                .map_err(Error::Database)?;
            user.password_hash = Some(value.to_string());
        }
        _ => {
            user.meta.insert(field.to_string(), value.to_string());
            let json =
                serde_json::to_string(&user.meta).map_err(|e| Error::Internal(e.to_string()))?;
            sqlx::query("UPDATE users SET meta = ?, updated_at = ? WHERE user_id = ?")
                .bind(json)
                .bind(Utc::now().to_rfc3339())
                .bind(user.user_id.to_string())
                .execute(db)
                .await
                .map_err(Error::Database)?;
        }
    }

    Ok(())
}

/// Replace the last-synced value map
pub async fn set_synced_meta(
    db: &SqlitePool,
    user_id: Uuid,
    synced: &HashMap<String, String>,
) -> Result<()> {
    let json = serde_json::to_string(synced).map_err(|e| Error::Internal(e.to_string()))?;

    sqlx::query("UPDATE users SET synced_meta = ?, updated_at = ? WHERE user_id = ?")
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id.to_string())
        .execute(db)
        .await
        .map_err(Error::Database)?;

    Ok(())
}

/// All user ids with a confirmed contact link
pub async fn list_linked_user_ids(db: &SqlitePool) -> Result<Vec<Uuid>> {
    list_ids(db, "SELECT user_id FROM users WHERE contact_id IS NOT NULL AND contact_id != '' ORDER BY created_at").await
}

/// All user ids with an email address (everyone is eligible for a sync pass)
pub async fn list_all_user_ids(db: &SqlitePool) -> Result<Vec<Uuid>> {
    list_ids(db, "SELECT user_id FROM users ORDER BY created_at").await
}

async fn list_ids(db: &SqlitePool, query: &str) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(query)
        .fetch_all(db)
        .await
        .map_err(Error::Database)?;

    rows.iter()
        .map(|row| {
            let id: String = row.try_get("user_id").map_err(Error::Database)?;
            Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("Corrupt user_id: {}", e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_insert_and_get_user() {
        let pool = test_pool().await;

        let user = UserRecord::new("a@example.com", "subscriber");
        insert_user(&pool, &user).await.unwrap();

        let loaded = get_user(&pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(loaded.email, "a@example.com");
        assert_eq!(loaded.role, "subscriber");
        assert_eq!(loaded.contact, ContactLink::Unknown);
        assert!(loaded.tags.is_none(), "fresh user has never fetched tags");
    }

    #[tokio::test]
    async fn test_contact_link_sentinels() {
        let pool = test_pool().await;

        let user = UserRecord::new("a@example.com", "subscriber");
        insert_user(&pool, &user).await.unwrap();

        // Negative lookup is cached distinctly from "never looked up"
        set_contact_link(&pool, user.user_id, &ContactLink::NotFound)
            .await
            .unwrap();
        let loaded = get_user(&pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(loaded.contact, ContactLink::NotFound);

        set_contact_link(&pool, user.user_id, &ContactLink::Linked("c-9".to_string()))
            .await
            .unwrap();
        let loaded = get_user(&pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(loaded.contact.id(), Some("c-9"));
    }

    #[tokio::test]
    async fn test_tags_never_fetched_vs_empty() {
        let pool = test_pool().await;

        let user = UserRecord::new("a@example.com", "subscriber");
        insert_user(&pool, &user).await.unwrap();

        let loaded = get_user(&pool, user.user_id).await.unwrap().unwrap();
        assert!(loaded.tags.is_none());

        // Confirmed-empty is a distinct terminal state
        set_tags(&pool, user.user_id, &TagSet::new()).await.unwrap();
        let loaded = get_user(&pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(loaded.tags, Some(TagSet::new()));
    }

    #[tokio::test]
    async fn test_lookup_by_contact_id_and_email() {
        let pool = test_pool().await;

        let mut user = UserRecord::new("b@example.com", "editor");
        user.contact = ContactLink::Linked("c-42".to_string());
        insert_user(&pool, &user).await.unwrap();

        let by_contact = get_user_by_contact_id(&pool, "c-42").await.unwrap();
        assert!(by_contact.is_some());

        let by_email = get_user_by_email(&pool, "b@example.com").await.unwrap();
        assert_eq!(by_email.unwrap().user_id, user.user_id);
    }

    #[tokio::test]
    async fn test_profile_field_writes() {
        let pool = test_pool().await;

        let mut user = UserRecord::new("c@example.com", "subscriber");
        insert_user(&pool, &user).await.unwrap();

        set_profile_field(&pool, &mut user, "display_name", "Casey")
            .await
            .unwrap();
        set_profile_field(&pool, &mut user, "company", "Acme")
            .await
            .unwrap();

        let loaded = get_user(&pool, user.user_id).await.unwrap().unwrap();
        assert_eq!(loaded.display_name.as_deref(), Some("Casey"));
        assert_eq!(loaded.meta.get("company").map(String::as_str), Some("Acme"));
    }
}
