// crates/context-sql-backend/src/config.rs
// ============================================================================
// Module: Backend Configuration
// Description: Configuration model, TOML loading and validation.
// Purpose: Provide strict, fail-closed settings for one backend instance.
// Dependencies: serde, thiserror, toml
// ============================================================================

//! ## Overview
//! A [`BackendConfig`] describes one configured backend: the server address,
//! credentials, pool bounds, the dialect and driver identifiers, and the
//! error-persistence settings. Configuration is loaded from TOML and rejected
//! when any field is out of range.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::error::BackendError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum accepted configuration file size in bytes.
const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Upper bound on connections per destination pool.
pub const MAX_POOL_SIZE_LIMIT: u32 = 1_024;
/// Default number of error rows retained per destination.
pub const DEFAULT_MAX_LATEST_ERRORS: usize = 100;
/// Default timestamp column used by retention sweeps.
pub const DEFAULT_TIMESTAMP_COLUMN: &str = "recvTime";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("config io error: {0}")]
    Io(String),
    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Configuration is invalid.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for BackendError {
    fn from(error: ConfigError) -> Self {
        let class = match &error {
            ConfigError::Io(_) => "ConfigIo",
            ConfigError::Parse(_) => "ConfigParse",
            ConfigError::Invalid(_) => "ConfigInvalid",
        };
        Self::configuration("config", "Configuration error", class, error.to_string())
    }
}

// ============================================================================
// SECTION: SQLite Settings
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Settings used by the bundled `SQLite` driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SqliteSettings {
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
    /// Busy timeout in milliseconds; elapsing it surfaces as a statement timeout.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

// ============================================================================
// SECTION: Backend Config
// ============================================================================

/// Configuration for one SQL backend instance.
///
/// # Invariants
/// - `instance` selects the dialect; `driver` selects the wire client.
/// - `max_pool_size` bounds every per-destination pool.
/// - `default_database` is only used by dialects that address destinations
///   as schemas.
#[derive(Clone, Deserialize)]
pub struct BackendConfig {
    /// Server host (a directory for the `SQLite` driver).
    pub host: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user.
    #[serde(default)]
    pub username: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// Maximum connections per destination pool.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
    /// Maximum wait for a free pooled connection, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Dialect identifier (`mysql`, `postgresql`, `sqlite`, ...).
    pub instance: String,
    /// Driver identifier (`sqlite`, `postgres`, ...).
    pub driver: String,
    /// Database addressed by schema-style dialects.
    #[serde(default = "default_database")]
    pub default_database: String,
    /// Extra connection-string options (`key=value&key=value`).
    #[serde(default)]
    pub options: Option<String>,
    /// Whether failures are recorded in `<destination>_error_log` tables.
    #[serde(default = "default_persist_errors")]
    pub persist_errors: bool,
    /// Number of most recent error rows kept per destination.
    #[serde(default = "default_max_latest_errors")]
    pub max_latest_errors: usize,
    /// Column holding reception timestamps, used by retention sweeps.
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    /// Bundled `SQLite` driver settings.
    #[serde(default)]
    pub sqlite: SqliteSettings,
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"XXXXXXXXXX")
            .field("max_pool_size", &self.max_pool_size)
            .field("acquire_timeout_ms", &self.acquire_timeout_ms)
            .field("instance", &self.instance)
            .field("driver", &self.driver)
            .field("default_database", &self.default_database)
            .field("options", &self.options)
            .field("persist_errors", &self.persist_errors)
            .field("max_latest_errors", &self.max_latest_errors)
            .field("timestamp_column", &self.timestamp_column)
            .field("sqlite", &self.sqlite)
            .finish()
    }
}

/// Returns the default server port.
const fn default_port() -> u16 {
    3306
}

/// Returns the default per-destination pool size.
const fn default_max_pool_size() -> u32 {
    3
}

/// Returns the default pool acquisition timeout.
const fn default_acquire_timeout_ms() -> u64 {
    10_000
}

/// Returns the default database for schema-style dialects.
fn default_database() -> String {
    "postgres".to_string()
}

/// Error persistence is enabled unless switched off.
const fn default_persist_errors() -> bool {
    true
}

/// Returns the default error-log retention.
const fn default_max_latest_errors() -> usize {
    DEFAULT_MAX_LATEST_ERRORS
}

/// Returns the default retention timestamp column.
fn default_timestamp_column() -> String {
    DEFAULT_TIMESTAMP_COLUMN.to_string()
}

/// Returns the default `SQLite` busy timeout.
const fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl BackendConfig {
    /// Builds a configuration with defaults for every optional field.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        instance: impl Into<String>,
        driver: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            max_pool_size: default_max_pool_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            instance: instance.into(),
            driver: driver.into(),
            default_database: default_database(),
            options: None,
            persist_errors: default_persist_errors(),
            max_latest_errors: default_max_latest_errors(),
            timestamp_column: default_timestamp_column(),
            sqlite: SqliteSettings::default(),
        }
    }

    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when reading, parsing or validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml_str(content)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must be set".to_string()));
        }
        if self.instance.trim().is_empty() {
            return Err(ConfigError::Invalid("instance must be set".to_string()));
        }
        if self.driver.trim().is_empty() {
            return Err(ConfigError::Invalid("driver must be set".to_string()));
        }
        if self.max_pool_size == 0 || self.max_pool_size > MAX_POOL_SIZE_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_pool_size out of range: {} (max {MAX_POOL_SIZE_LIMIT})",
                self.max_pool_size
            )));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "acquire_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_latest_errors == 0 {
            return Err(ConfigError::Invalid(
                "max_latest_errors must be greater than zero".to_string(),
            ));
        }
        if self.timestamp_column.trim().is_empty() {
            return Err(ConfigError::Invalid("timestamp_column must be set".to_string()));
        }
        Ok(())
    }

    /// Returns the options string when it carries any content.
    #[must_use]
    pub fn effective_options(&self) -> Option<&str> {
        self.options.as_deref().map(str::trim).filter(|options| !options.is_empty())
    }
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::expect_used,
        clippy::unwrap_used,
        reason = "Test assertions use expect/unwrap for clarity."
    )]

    use super::BackendConfig;
    use super::ConfigError;
    use super::SqliteJournalMode;

    #[test]
    fn toml_defaults_fill_optional_fields() {
        let config = BackendConfig::from_toml_str(
            "host = \"localhost\"\ninstance = \"mysql\"\ndriver = \"sqlite\"\n",
        )
        .expect("config");
        assert_eq!(config.port, 3306);
        assert_eq!(config.max_pool_size, 3);
        assert!(config.persist_errors);
        assert_eq!(config.max_latest_errors, 100);
        assert_eq!(config.timestamp_column, "recvTime");
        assert_eq!(config.default_database, "postgres");
        assert_eq!(config.sqlite.journal_mode, SqliteJournalMode::Wal);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut config = BackendConfig::new("localhost", "mysql", "sqlite");
        config.max_pool_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(message))
            if message.contains("max_pool_size")));
    }

    #[test]
    fn zero_error_retention_is_rejected() {
        let mut config = BackendConfig::new("localhost", "mysql", "sqlite");
        config.max_latest_errors = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_driver_fails_to_parse() {
        let result = BackendConfig::from_toml_str("host = \"h\"\ninstance = \"mysql\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn debug_output_masks_password() {
        let mut config = BackendConfig::new("localhost", "mysql", "sqlite");
        config.password = "hunter2".to_string();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn blank_options_are_ignored() {
        let mut config = BackendConfig::new("localhost", "mysql", "sqlite");
        config.options = Some("   ".to_string());
        assert_eq!(config.effective_options(), None);
        config.options = Some("useSSL=false".to_string());
        assert_eq!(config.effective_options(), Some("useSSL=false"));
    }
}
