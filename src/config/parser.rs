use super::ConfigError;
use super::validator::{require_http_url, require_matrix_user_id, require_non_empty};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub power_levels: PowerLevelsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub matrix: MatrixConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub domain: String,
    pub homeserver_url: String,
    #[serde(default = "default_bot_localpart")]
    pub bot_localpart: String,
    #[serde(default = "default_user_prefix")]
    pub user_prefix: String,
    #[serde(default = "default_max_event_attempts")]
    pub max_event_attempts: u32,
}

impl BridgeConfig {
    pub fn bot_user_id(&self) -> String {
        format!("@{}:{}", self.bot_localpart, self.domain)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistrationConfig {
    pub bridge_id: String,
    #[serde(alias = "as_token")]
    pub appservice_token: String,
    #[serde(alias = "hs_token")]
    pub homeserver_token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        let url = self.connection_string();
        if url.starts_with("sqlite://") {
            DbType::Sqlite
        } else {
            DbType::Postgres
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        if let DbType::Sqlite = self.db_type() {
            let url = self.connection_string();
            Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
        } else {
            None
        }
    }

    pub fn max_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.max_connections,
            DbType::Sqlite => Some(1),
        }
    }

    pub fn min_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.min_connections,
            DbType::Sqlite => Some(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

/// Authority levels the bridge enforces in every bridged room.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PowerLevelsConfig {
    #[serde(default = "default_bridge_user_level")]
    pub bridge_user_level: i64,
    #[serde(default = "default_room_admin_level")]
    pub room_admin_level: i64,
    /// Matrix users granted the room admin level in every bridged room.
    #[serde(default)]
    pub extra_admins: Vec<String>,
}

impl Default for PowerLevelsConfig {
    fn default() -> Self {
        Self {
            bridge_user_level: default_bridge_user_level(),
            room_admin_level: default_room_admin_level(),
            extra_admins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MediaConfig {
    /// Base URL media downloads are built against. Falls back to the homeserver.
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: usize,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl MediaConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            origin: None,
            max_download_bytes: default_max_download_bytes(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatrixConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl MatrixConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
        Self::load_from_file(&config_path)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn media_origin(&self) -> &str {
        self.media
            .origin
            .as_deref()
            .unwrap_or(&self.bridge.homeserver_url)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty(&self.bridge.domain, "bridge.domain")?;
        require_non_empty(&self.bridge.bot_localpart, "bridge.bot_localpart")?;
        require_non_empty(&self.bridge.user_prefix, "bridge.user_prefix")?;
        require_http_url(&self.bridge.homeserver_url, "bridge.homeserver_url")?;
        require_http_url(self.media_origin(), "media.origin")?;
        require_non_empty(&self.registration.appservice_token, "registration.appservice_token")?;
        require_non_empty(&self.registration.homeserver_token, "registration.homeserver_token")?;

        if self.database.connection_string().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "database connection string cannot be empty".to_string(),
            ));
        }

        for admin in &self.power_levels.extra_admins {
            require_matrix_user_id(admin, "power_levels.extra_admins")?;
        }

        if self.cache.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "cache.capacity must be greater than zero".to_string(),
            ));
        }

        if self.bridge.max_event_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.max_event_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("APPSERVICE_AS_TOKEN") {
            self.registration.appservice_token = value;
        }
        if let Ok(value) = std::env::var("APPSERVICE_HS_TOKEN") {
            self.registration.homeserver_token = value;
        }
    }
}

fn default_bot_localpart() -> String {
    "_bridge".to_string()
}

fn default_user_prefix() -> String {
    "_bridge_".to_string()
}

fn default_max_event_attempts() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_bridge_user_level() -> i64 {
    100
}

fn default_room_admin_level() -> i64 {
    90
}

fn default_cache_capacity() -> usize {
    2048
}

fn default_cache_ttl_secs() -> u64 {
    15 * 60
}

fn default_max_download_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    15
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
bridge:
  domain: example.org
  homeserver_url: https://matrix.example.org
registration:
  bridge_id: remote
  as_token: as-secret
  hs_token: hs-secret
database:
  filename: /tmp/bridge.db
power_levels:
  extra_admins:
    - "@ops:example.org"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_yaml(MINIMAL).expect("config parses");

        assert_eq!(config.power_levels.bridge_user_level, 100);
        assert_eq!(config.power_levels.room_admin_level, 90);
        assert_eq!(config.power_levels.extra_admins, vec!["@ops:example.org"]);
        assert_eq!(config.cache.capacity, 2048);
        assert_eq!(config.cache.ttl(), Duration::from_secs(900));
        assert_eq!(config.media_origin(), "https://matrix.example.org");
        assert_eq!(config.database.db_type(), DbType::Sqlite);
        assert_eq!(config.database.sqlite_path().as_deref(), Some("/tmp/bridge.db"));
        assert_eq!(config.bridge.bot_user_id(), "@_bridge:example.org");
    }

    #[test]
    fn malformed_extra_admin_is_rejected() {
        let yaml = MINIMAL.replace("@ops:example.org", "ops");
        let err = Config::from_yaml(&yaml).expect_err("invalid admin id");
        assert!(matches!(err, ConfigError::InvalidConfig(_)));
    }

    #[test]
    fn zero_cache_capacity_is_rejected() {
        let yaml = format!("{MINIMAL}cache:\n  capacity: 0\n");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn postgres_url_selects_postgres() {
        let config = DatabaseConfig {
            url: Some("postgres://bridge@localhost/bridge".to_string()),
            filename: None,
            max_connections: Some(4),
            min_connections: None,
        };
        assert_eq!(config.db_type(), DbType::Postgres);
        assert_eq!(config.max_connections(), Some(4));
        assert!(config.sqlite_path().is_none());
    }
}
