use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub sync: SyncConfig,
    pub inbox: InboxConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
    pub connection_timeout_secs: u64,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub format: String, // "json" or "text"
}

/// Realtime and read-state behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Buffered events per change-feed channel before receivers lag
    pub feed_capacity: usize,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    /// Give up on a subscription after this many consecutive failed connects;
    /// 0 keeps retrying at the capped backoff until the subscription is dropped
    pub max_reconnect_attempts: u32,
    /// Attempts for retryable read paths (inbox, unread counts)
    pub read_retry_attempts: u32,
    pub mark_read_on_open: bool,
    /// Prefer the store's single-statement mark-read; falls back to a plain update
    pub use_batch_mark_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Name shown when a counterpart profile does not resolve
    pub placeholder_name: String,
    pub snapshot_path: Option<String>,
    pub serve_stale_snapshot: bool,
    pub include_archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub max_text_length: usize,
    pub max_media_bytes: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/conversations.db".to_string(),
            max_connections: 8,
            connection_timeout_secs: 30,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            format: "text".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            feed_capacity: 256,
            reconnect_initial_backoff_ms: 250,
            reconnect_max_backoff_ms: 30_000,
            max_reconnect_attempts: 0,
            read_retry_attempts: 3,
            mark_read_on_open: true,
            use_batch_mark_read: true,
        }
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            placeholder_name: "Unknown user".to_string(),
            snapshot_path: None,
            serve_stale_snapshot: true,
            include_archived: false,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_text_length: 10_000,
            max_media_bytes: 25 * 1024 * 1024,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            sync: SyncConfig::default(),
            inbox: InboxConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, optionally adding an explicit file on top of the defaults
    pub fn load_from(explicit_file: Option<&str>) -> Result<Self> {
        let defaults = Config::try_from(&Self::default()).context("Failed to build default configuration")?;

        let mut builder = Config::builder()
            // Start with default values
            .add_source(defaults)
            // Add config files if they exist
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(File::with_name("convo-sync").required(false));

        if let Some(path) = explicit_file {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let config = builder
            // Add environment variables with prefix, e.g. CONVO_SYNC_SYNC__FEED_CAPACITY
            .add_source(Environment::with_prefix("CONVO_SYNC").prefix_separator("_").separator("__"))
            .build()
            .context("Failed to load configuration")?;

        let app_config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate database config
        if self.database.path.trim().is_empty() {
            return Err(anyhow::anyhow!("database.path must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!("max_connections must be greater than 0"));
        }
        if self.database.connection_timeout_secs == 0 {
            return Err(anyhow::anyhow!("connection_timeout_secs must be greater than 0"));
        }

        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            ));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format,
                valid_formats
            ));
        }

        // Validate sync config
        if self.sync.feed_capacity == 0 {
            return Err(anyhow::anyhow!("feed_capacity must be greater than 0"));
        }
        if self.sync.reconnect_initial_backoff_ms == 0 {
            return Err(anyhow::anyhow!("reconnect_initial_backoff_ms must be greater than 0"));
        }
        if self.sync.reconnect_max_backoff_ms < self.sync.reconnect_initial_backoff_ms {
            return Err(anyhow::anyhow!(
                "reconnect_max_backoff_ms must be at least reconnect_initial_backoff_ms"
            ));
        }
        if self.sync.read_retry_attempts == 0 {
            return Err(anyhow::anyhow!("read_retry_attempts must be greater than 0"));
        }

        // Validate inbox config
        if self.inbox.placeholder_name.trim().is_empty() {
            return Err(anyhow::anyhow!("placeholder_name must not be empty"));
        }

        // Validate message limits
        if self.validation.max_text_length == 0 {
            return Err(anyhow::anyhow!("max_text_length must be greater than 0"));
        }
        if self.validation.max_media_bytes == 0 {
            return Err(anyhow::anyhow!("max_media_bytes must be greater than 0"));
        }

        Ok(())
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to render configuration")
    }

    /// Get database path from environment or config
    pub fn get_database_path(&self) -> String {
        std::env::var("CONVO_SYNC_DB_PATH").unwrap_or_else(|_| self.database.path.clone())
    }

    /// Get log level from environment or config
    pub fn get_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.logging.level.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.database.path, "data/conversations.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.sync.feed_capacity, 256);
    }

    #[test]
    fn test_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = AppConfig::default();
        config.database.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_rendering_contains_sections() {
        let yaml = AppConfig::default().to_yaml().unwrap();
        assert!(yaml.contains("feed_capacity"));
        assert!(yaml.contains("placeholder_name"));
    }
}
