//! Settings database operations
//!
//! Key-value settings bag. At startup the bag is materialized into an
//! explicit [`RuntimeOptions`] struct that gets injected into components,
//! so nothing reads settings through hidden global state.

use crmgate_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};

/// One entry of the local-field to CRM-field mapping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldMapping {
    /// Local field name ("email", "display_name", "role", "password", or a
    /// meta key)
    pub local: String,
    /// Remote CRM field name
    pub remote: String,
    /// Whether this field is written back locally on a pull
    #[serde(default)]
    pub pull: bool,
}

/// Materialized settings bag, loaded once and passed explicitly
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Skip the remote call when a user already holds every requested tag
    pub prevent_reapply: bool,
    /// Privileged viewers bypass content restrictions entirely
    pub exclude_admins: bool,
    /// Site-wide redirect for denied content (URL)
    pub default_redirect: Option<String>,
    /// Inline message shown when no redirect applies
    pub restricted_message: String,
    /// Roles an inbound pull/webhook is allowed to assign
    pub known_roles: Vec<String>,
    /// Local-field to CRM-field mapping
    pub field_map: Vec<FieldMapping>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            prevent_reapply: true,
            exclude_admins: true,
            default_redirect: None,
            restricted_message: "This content is restricted.".to_string(),
            known_roles: vec![
                "administrator".to_string(),
                "editor".to_string(),
                "subscriber".to_string(),
            ],
            field_map: vec![
                FieldMapping {
                    local: "email".to_string(),
                    remote: "email".to_string(),
                    pull: true,
                },
                FieldMapping {
                    local: "display_name".to_string(),
                    remote: "name".to_string(),
                    pull: true,
                },
                FieldMapping {
                    local: "role".to_string(),
                    remote: "role".to_string(),
                    pull: true,
                },
            ],
        }
    }
}

/// Load runtime options from the settings table, defaulting missing keys
pub async fn load_runtime_options(db: &Pool<Sqlite>) -> Result<RuntimeOptions> {
    let defaults = RuntimeOptions::default();

    let prevent_reapply = get_setting::<bool>(db, "prevent_reapply")
        .await?
        .unwrap_or(defaults.prevent_reapply);
    let exclude_admins = get_setting::<bool>(db, "exclude_admins")
        .await?
        .unwrap_or(defaults.exclude_admins);
    let default_redirect = get_setting::<String>(db, "default_redirect").await?;
    let restricted_message = get_setting::<String>(db, "restricted_message")
        .await?
        .unwrap_or(defaults.restricted_message);

    let known_roles = match get_setting::<String>(db, "known_roles").await? {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| Error::Config(format!("Parse known_roles failed: {}", e)))?,
        None => defaults.known_roles,
    };

    let field_map = match get_setting::<String>(db, "field_map").await? {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| Error::Config(format!("Parse field_map failed: {}", e)))?,
        None => defaults.field_map,
    };

    Ok(RuntimeOptions {
        prevent_reapply,
        exclude_admins,
        default_redirect,
        restricted_message,
        known_roles,
        field_map,
    })
}

/// Get webhook shared secret from database
///
/// **Returns:** Some(secret) if set, None otherwise
pub async fn get_webhook_secret(db: &Pool<Sqlite>) -> Result<Option<String>> {
    get_setting::<String>(db, "webhook_secret").await
}

/// Set webhook shared secret in database
pub async fn set_webhook_secret(db: &Pool<Sqlite>, secret: String) -> Result<()> {
    set_setting(db, "webhook_secret", secret).await
}

/// Generic setting getter (internal)
async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    match row {
        Some((value,)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting failed: {}", e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter (internal)
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_runtime_options_defaults() {
        let pool = test_pool().await;

        let options = load_runtime_options(&pool).await.unwrap();
        assert!(options.prevent_reapply);
        assert!(options.exclude_admins);
        assert!(options.default_redirect.is_none());
        assert!(options.known_roles.contains(&"subscriber".to_string()));
        assert_eq!(options.field_map.len(), 3);
    }

    #[tokio::test]
    async fn test_runtime_options_overrides() {
        let pool = test_pool().await;

        set_setting(&pool, "prevent_reapply", false).await.unwrap();
        set_setting(&pool, "default_redirect", "https://example.com/join")
            .await
            .unwrap();
        set_setting(&pool, "known_roles", r#"["member","admin"]"#)
            .await
            .unwrap();

        let options = load_runtime_options(&pool).await.unwrap();
        assert!(!options.prevent_reapply);
        assert_eq!(
            options.default_redirect.as_deref(),
            Some("https://example.com/join")
        );
        assert_eq!(options.known_roles, vec!["member", "admin"]);
    }

    #[tokio::test]
    async fn test_webhook_secret_roundtrip() {
        let pool = test_pool().await;

        assert_eq!(get_webhook_secret(&pool).await.unwrap(), None);

        set_webhook_secret(&pool, "s3cret".to_string()).await.unwrap();
        assert_eq!(
            get_webhook_secret(&pool).await.unwrap(),
            Some("s3cret".to_string())
        );

        // UPSERT keeps a single row
        set_webhook_secret(&pool, "rotated".to_string()).await.unwrap();
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM settings WHERE key = 'webhook_secret'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_field_map_parse() {
        let pool = test_pool().await;

        set_setting(
            &pool,
            "field_map",
            r#"[{"local":"email","remote":"EmailAddress","pull":true}]"#,
        )
        .await
        .unwrap();

        let options = load_runtime_options(&pool).await.unwrap();
        assert_eq!(options.field_map.len(), 1);
        assert_eq!(options.field_map[0].remote, "EmailAddress");
        assert!(options.field_map[0].pull);
    }
}
