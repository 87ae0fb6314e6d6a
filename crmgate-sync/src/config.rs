//! Configuration resolution for crmgate-sync
//!
//! Provides multi-tier secret resolution with Database → ENV → TOML
//! priority. The database is authoritative so a secret rotated through
//! the API survives restarts regardless of the deployment's files.

use crmgate_common::config::TomlConfig;
use crmgate_common::{Error, Result};
use sqlx::{Pool, Sqlite};
use tracing::{info, warn};

/// Resolve the webhook shared secret from 3-tier configuration
///
/// **Priority:** Database → ENV → TOML
pub async fn resolve_webhook_secret(
    db: &Pool<Sqlite>,
    toml_config: &TomlConfig,
) -> Result<String> {
    let mut sources = Vec::new();

    // Tier 1: Database (authoritative)
    let db_secret = crate::db::settings::get_webhook_secret(db).await?;
    if db_secret.as_deref().is_some_and(is_valid_secret) {
        sources.push("database");
    }

    // Tier 2: Environment variable
    let env_secret = std::env::var("CRMGATE_WEBHOOK_SECRET").ok();
    if env_secret.as_deref().is_some_and(is_valid_secret) {
        sources.push("environment");
    }

    // Tier 3: TOML config
    let toml_secret = toml_config.webhook_secret.as_ref();
    if toml_secret.map(String::as_str).is_some_and(is_valid_secret) {
        sources.push("TOML");
    }

    // Warn if multiple sources (potential misconfiguration)
    if sources.len() > 1 {
        warn!(
            "Webhook secret found in multiple sources: {}. Using database (highest priority).",
            sources.join(", ")
        );
    }

    if let Some(secret) = db_secret {
        if is_valid_secret(&secret) {
            info!("Webhook secret loaded from database");
            return Ok(secret);
        }
    }

    if let Some(secret) = env_secret {
        if is_valid_secret(&secret) {
            info!("Webhook secret loaded from environment variable");
            return Ok(secret);
        }
    }

    if let Some(secret) = toml_secret {
        if is_valid_secret(secret) {
            info!("Webhook secret loaded from TOML config");
            return Ok(secret.clone());
        }
    }

    Err(Error::Config(
        "Webhook secret not configured. Please configure using one of:\n\
         1. Environment: CRMGATE_WEBHOOK_SECRET=your-secret\n\
         2. TOML config: ~/.config/crmgate/crmgate.toml (webhook_secret = \"your-secret\")\n\
         3. Settings table: key 'webhook_secret'"
            .to_string(),
    ))
}

/// Resolve CRM connection credentials
///
/// **Priority:** ENV → TOML
pub fn resolve_crm_credentials(toml_config: &TomlConfig) -> Result<(String, String)> {
    let base_url = std::env::var("CRMGATE_CRM_URL")
        .ok()
        .or_else(|| toml_config.crm.base_url.clone())
        .ok_or_else(|| {
            Error::Config(
                "CRM base URL not configured (CRMGATE_CRM_URL or [crm] base_url)".to_string(),
            )
        })?;

    let api_key = std::env::var("CRMGATE_CRM_KEY")
        .ok()
        .or_else(|| toml_config.crm.api_key.clone())
        .ok_or_else(|| {
            Error::Config(
                "CRM API key not configured (CRMGATE_CRM_KEY or [crm] api_key)".to_string(),
            )
        })?;

    Ok((base_url, api_key))
}

/// Validate a secret (non-empty, non-whitespace)
pub fn is_valid_secret(secret: &str) -> bool {
    !secret.trim().is_empty()
}
