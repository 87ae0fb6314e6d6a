//! Configuration loading and data folder resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Logging configuration section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter directive (e.g. "info", "crmgate_sync=debug")
    pub level: Option<String>,
}

/// CRM connection section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrmConfig {
    /// Base URL of the CRM REST API
    pub base_url: Option<String>,
    /// API key sent as a bearer token
    pub api_key: Option<String>,
}

/// TOML configuration file contents
///
/// All fields are optional; environment variables and compiled defaults
/// fill the gaps (see the resolver functions below).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Address the HTTP server binds to (default 127.0.0.1:5810)
    pub bind_address: Option<String>,
    /// SQLite database file path
    pub database_path: Option<String>,
    /// Shared secret required on inbound webhooks
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub crm: CrmConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TomlConfig {
    /// Load the config file from the platform config directory, if present.
    ///
    /// Missing file is not an error; an unparseable file is.
    pub fn load() -> Result<Self> {
        let path = match config_file_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(Self::default()),
        };

        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Read config failed ({}): {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse config failed ({}): {}", path.display(), e)))
    }
}

/// Config file location following priority order:
/// 1. `CRMGATE_CONFIG` environment variable
/// 2. `~/.config/crmgate/crmgate.toml`
/// 3. `/etc/crmgate/crmgate.toml` (linux only)
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CRMGATE_CONFIG") {
        return Some(PathBuf::from(path));
    }

    if let Some(user_config) = dirs::config_dir().map(|d| d.join("crmgate").join("crmgate.toml")) {
        if user_config.exists() {
            return Some(user_config);
        }
        if cfg!(target_os = "linux") {
            let system_config = PathBuf::from("/etc/crmgate/crmgate.toml");
            if system_config.exists() {
                return Some(system_config);
            }
        }
        return Some(user_config);
    }

    None
}

/// Resolve the database path following priority order:
/// 1. Environment variable `CRMGATE_DATABASE`
/// 2. TOML config `database_path`
/// 3. OS-dependent compiled default
pub fn resolve_database_path(toml_config: &TomlConfig) -> PathBuf {
    if let Ok(path) = std::env::var("CRMGATE_DATABASE") {
        return PathBuf::from(path);
    }

    if let Some(path) = &toml_config.database_path {
        return PathBuf::from(path);
    }

    default_data_dir().join("crmgate.db")
}

/// Resolve the HTTP bind address following priority order:
/// 1. Environment variable `CRMGATE_BIND`
/// 2. TOML config `bind_address`
/// 3. Compiled default
pub fn resolve_bind_address(toml_config: &TomlConfig) -> String {
    if let Ok(addr) = std::env::var("CRMGATE_BIND") {
        return addr;
    }

    toml_config
        .bind_address
        .clone()
        .unwrap_or_else(|| "127.0.0.1:5810".to_string())
}

/// OS-dependent default data folder
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("crmgate"))
        .unwrap_or_else(|| PathBuf::from("./crmgate_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_config_defaults() {
        let config = TomlConfig::default();
        assert!(config.bind_address.is_none());
        assert!(config.database_path.is_none());
        assert!(config.webhook_secret.is_none());
        assert!(config.crm.base_url.is_none());
    }

    #[test]
    fn test_toml_config_parse() {
        let content = r#"
            bind_address = "0.0.0.0:8080"
            webhook_secret = "s3cret"

            [crm]
            base_url = "https://crm.example.com/api"
            api_key = "key-123"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(content).expect("parse should succeed");
        assert_eq!(config.bind_address.as_deref(), Some("0.0.0.0:8080"));
        assert_eq!(config.webhook_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.crm.base_url.as_deref(), Some("https://crm.example.com/api"));
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_resolve_bind_address_default() {
        // Only meaningful when the env override is absent
        if std::env::var("CRMGATE_BIND").is_err() {
            let config = TomlConfig::default();
            assert_eq!(resolve_bind_address(&config), "127.0.0.1:5810");
        }
    }

    #[test]
    fn test_resolve_bind_address_from_toml() {
        if std::env::var("CRMGATE_BIND").is_err() {
            let config = TomlConfig {
                bind_address: Some("10.0.0.1:9000".to_string()),
                ..Default::default()
            };
            assert_eq!(resolve_bind_address(&config), "10.0.0.1:9000");
        }
    }
}
