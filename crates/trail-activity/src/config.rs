//! Configuration loading from file and environment variables.
//!
//! ```toml
//! [database]
//! path = "trail.db"
//!
//! [logging]
//! level = "trail_activity=debug,info"
//!
//! [logger]
//! log_table = "activity_logs"
//!
//! [loggers.Comments]
//! scope = ["Comments", "Articles", "Authors"]
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use trail_db::DbRuntimeSettings;

use crate::error::InvalidTableName;
use crate::store::{TableName, DEFAULT_LOG_TABLE};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Diagnostic logging settings for this process.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Defaults shared by every activity logger.
    #[serde(default)]
    pub logger: LoggerConfig,

    /// Per entity type overrides, keyed by registered type name.
    #[serde(default)]
    pub loggers: BTreeMap<String, LoggerEntry>,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Diagnostic logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "trail_activity=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Defaults for every activity logger.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggerConfig {
    /// Table receiving scoped log rows.
    #[serde(default = "default_log_table")]
    pub log_table: String,
}

/// Settings for one logging-enabled entity type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggerEntry {
    /// Overrides `logger.log_table`.
    #[serde(default)]
    pub log_table: Option<String>,

    /// Declared scope type names. Empty means the type's own scope.
    #[serde(default)]
    pub scope: Vec<String>,
}

/// Resolved, validated settings for one logger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerSettings {
    /// Log store target.
    pub log_table: TableName,
    /// Declared scope type names.
    pub scope: Vec<String>,
}

fn default_db_path() -> String {
    "trail.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_table() -> String {
    DEFAULT_LOG_TABLE.to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_table: default_log_table(),
        }
    }
}

impl DatabaseConfig {
    /// Pool tunables derived from this configuration.
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
        }
    }
}

impl LoggingConfig {
    /// Installs a global `tracing` subscriber for this configuration.
    ///
    /// Falls back to `info` when the filter does not parse. Returns `false`
    /// if a global subscriber was already installed.
    pub fn init_tracing(&self) -> bool {
        let filter = EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"));
        let installed = if self.json {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .try_init()
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).try_init()
        };
        installed.is_ok()
    }
}

impl Config {
    /// Settings for the logger of `type_name`, falling back to the shared
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::TableName` if the resolved table name is not a
    /// plain identifier.
    pub fn logger_settings(&self, type_name: &str) -> Result<LoggerSettings, ConfigError> {
        let entry = self.loggers.get(type_name);
        let log_table = entry
            .and_then(|e| e.log_table.as_deref())
            .unwrap_or(self.logger.log_table.as_str());
        Ok(LoggerSettings {
            log_table: TableName::new(log_table)?,
            scope: entry.map(|e| e.scope.clone()).unwrap_or_default(),
        })
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A configured log table is not a plain identifier.
    #[error(transparent)]
    TableName(#[from] InvalidTableName),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `TRAIL_DB_PATH` overrides `database.path`
/// - `TRAIL_LOG_LEVEL` overrides `logging.level`
/// - `TRAIL_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `TRAIL_LOG_TABLE` overrides `logger.log_table`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the default log table name is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(db_path) = std::env::var("TRAIL_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("TRAIL_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("TRAIL_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(table) = std::env::var("TRAIL_LOG_TABLE") {
        config.logger.log_table = table;
    }

    TableName::new(config.logger.log_table.as_str())?;

    Ok(config)
}
