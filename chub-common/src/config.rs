//! Configuration loading and root folder resolution

use crate::db::models::UserRole;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Environment variable consulted for the root folder
pub const ROOT_FOLDER_ENV: &str = "CHUB_ROOT";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "creatorhub.db";

/// Upper bound for `delivery.retry_backoff_ms`
pub const MAX_RETRY_BACKOFF_MS: u64 = 60_000;

/// Complete service configuration, deserialized from TOML
///
/// Every section is optional; missing sections and keys fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root folder override (priority 3 in [`resolve_root_folder`])
    pub root_folder: Option<PathBuf>,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub delivery: DeliveryConfig,
    pub email: EmailConfig,
    pub sms: SmsConfig,
    /// Users provisioned at startup
    pub users: Vec<SeedUser>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5740,
        }
    }
}

/// Which storage backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

impl std::str::FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => Err(Error::Config(format!("Unknown storage backend: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Defaults to `<root>/creatorhub.db`
    pub database_path: Option<PathBuf>,
}

/// Fan-out and side-channel tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Events buffered per open connection before events are dropped for it
    pub connection_queue_capacity: usize,
    /// Capacity of the observer EventBus
    pub event_bus_capacity: usize,
    /// SSE keep-alive interval
    pub heartbeat_secs: u64,
    /// Maximum message body length in characters
    pub max_message_length: usize,
    /// Attempts per email/SMS send (1 = no retry)
    pub side_channel_max_attempts: u32,
    /// Base backoff between attempts; attempt N waits N * backoff
    pub retry_backoff_ms: u64,
    /// Run email/SMS sends on a spawned task instead of inline
    pub async_side_channels: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            connection_queue_capacity: 64,
            event_bus_capacity: 1000,
            heartbeat_secs: 15,
            max_message_length: 10_000,
            side_channel_max_attempts: 2,
            retry_backoff_ms: 500,
            async_side_channels: true,
        }
    }
}

/// SendGrid email settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub api_key: String,
    pub from_address: String,
    pub base_url: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            from_address: String::new(),
            base_url: "https://api.sendgrid.com".to_string(),
        }
    }
}

impl EmailConfig {
    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty() && !self.from_address.is_empty()
    }
}

/// Twilio SMS settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub base_url: String,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            base_url: "https://api.twilio.com".to_string(),
        }
    }
}

impl SmsConfig {
    pub fn is_enabled(&self) -> bool {
        !self.account_sid.is_empty() && !self.auth_token.is_empty() && !self.from_number.is_empty()
    }
}

/// A user provisioned from the config file
#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub id: Uuid,
    pub username: String,
    pub role: UserRole,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from a TOML file (missing file is an error)
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Load configuration, falling back to defaults if the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ServiceConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must be non-zero".to_string()));
        }
        let d = &self.delivery;
        if d.connection_queue_capacity == 0 {
            return Err(Error::Config(
                "delivery.connection_queue_capacity must be at least 1".to_string(),
            ));
        }
        if d.event_bus_capacity == 0 {
            return Err(Error::Config(
                "delivery.event_bus_capacity must be at least 1".to_string(),
            ));
        }
        if d.side_channel_max_attempts == 0 {
            return Err(Error::Config(
                "delivery.side_channel_max_attempts must be at least 1".to_string(),
            ));
        }
        if d.retry_backoff_ms > MAX_RETRY_BACKOFF_MS {
            return Err(Error::Config(format!(
                "delivery.retry_backoff_ms must be at most {}",
                MAX_RETRY_BACKOFF_MS
            )));
        }
        if d.max_message_length == 0 {
            return Err(Error::Config(
                "delivery.max_message_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Database path, defaulting to a file inside the root folder
    pub fn database_path(&self, root_folder: &Path) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| root_folder.join(DATABASE_FILE_NAME))
    }
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. `root_folder` key of the TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&str>,
    env_var_name: &str,
    config: Option<&ServiceConfig>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(root) = config.and_then(|c| c.root_folder.clone()) {
        return root;
    }

    default_root_folder()
}

/// Per-user config file location (`~/.config/creatorhub/config.toml` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("creatorhub").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/creatorhub/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("creatorhub"))
        .unwrap_or_else(|| PathBuf::from("./creatorhub_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.port, 5740);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.delivery.connection_queue_capacity, 64);
        assert!(!config.email.is_enabled());
        assert!(!config.sms.is_enabled());
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            root_folder = "/srv/chub"

            [server]
            port = 6000

            [storage]
            backend = "memory"

            [delivery]
            connection_queue_capacity = 8
            async_side_channels = false

            [email]
            api_key = "SG.key"
            from_address = "noreply@example.com"

            [sms]
            account_sid = "AC123"
            auth_token = "tok"
            from_number = "+15550000000"

            [[users]]
            id = "6f1c1b8e-1d3c-4c1f-9a51-2b1f7b8c0a01"
            username = "admin"
            role = "admin"
            email = "admin@example.com"
        "#;

        let config = ServiceConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.root_folder, Some(PathBuf::from("/srv/chub")));
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.delivery.connection_queue_capacity, 8);
        assert!(!config.delivery.async_side_channels);
        assert_eq!(config.delivery.side_channel_max_attempts, 2);
        assert!(config.email.is_enabled());
        assert!(config.sms.is_enabled());
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.users[0].role, UserRole::Admin);
        assert_eq!(config.users[0].phone, None);
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let result = ServiceConfig::from_toml_str("[delivery]\nconnection_queue_capacity = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));

        let result = ServiceConfig::from_toml_str("[delivery]\nside_channel_max_attempts = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_bounds_retry_backoff() {
        let result = ServiceConfig::from_toml_str(&format!(
            "[delivery]\nretry_backoff_ms = {}\n",
            MAX_RETRY_BACKOFF_MS + 1
        ));
        assert!(matches!(result, Err(Error::Config(_))));

        let config = ServiceConfig::from_toml_str(&format!(
            "[delivery]\nretry_backoff_ms = {}\n",
            MAX_RETRY_BACKOFF_MS
        ))
        .unwrap();
        assert_eq!(config.delivery.retry_backoff_ms, MAX_RETRY_BACKOFF_MS);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = ServiceConfig::from_toml_str("[server\nport = 1");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_database_path_defaults_into_root() {
        let config = ServiceConfig::default();
        let root = PathBuf::from("/tmp/chub-root");
        assert_eq!(config.database_path(&root), root.join(DATABASE_FILE_NAME));
    }

    #[test]
    fn test_cli_arg_wins_root_resolution() {
        let config = ServiceConfig {
            root_folder: Some(PathBuf::from("/from/config")),
            ..Default::default()
        };
        let root = resolve_root_folder(Some("/from/cli"), "CHUB_TEST_UNSET_VAR", Some(&config));
        assert_eq!(root, PathBuf::from("/from/cli"));

        let root = resolve_root_folder(None, "CHUB_TEST_UNSET_VAR", Some(&config));
        assert_eq!(root, PathBuf::from("/from/config"));
    }

    #[test]
    fn test_storage_backend_from_str() {
        assert_eq!("Memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert_eq!("sqlite".parse::<StorageBackend>().unwrap(), StorageBackend::Sqlite);
        assert!("postgres".parse::<StorageBackend>().is_err());
    }
}
