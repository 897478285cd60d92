//! Configuration management for the quota engine
//!
//! Settings are resolved from:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Specification store backend
    pub store: StoreConfig,
    /// Admission settings
    pub engine: EngineSettings,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Which specification store implementation to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

/// Specification store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database URL (e.g., "sqlite:///var/lib/quotaplane/quotas.db")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Scope used by reservation requests that name none
    pub default_scope: String,
    /// Upper bound on limits declared by one specification
    pub max_limits_per_spec: usize,
}

/// Log file rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Enable file logging
    pub file_logging_enabled: bool,
    /// Emit console output as JSON
    pub json_format: bool,
    pub rotation: LogRotation,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            url: "sqlite:///var/lib/quotaplane/quotas.db".to_string(),
            max_connections: 8,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_scope: "global".to_string(),
            max_limits_per_spec: 64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("/var/log/quotaplane"),
            file_logging_enabled: false,
            json_format: false,
            rotation: LogRotation::Daily,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl EngineConfig {
    /// Load configuration from environment variables and optional config file
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::find_config_file() {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("QUOTAPLANE_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/quotaplane/config.toml")),
            Some(PathBuf::from("./quotaplane.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Store
        if let Some(backend) = lookup("QUOTAPLANE_STORE_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "sqlite" => self.store.backend = StoreBackend::Sqlite,
                "memory" => self.store.backend = StoreBackend::Memory,
                other => tracing::warn!(backend = other, "Ignoring unknown store backend override"),
            }
        }
        if let Some(url) = lookup("QUOTAPLANE_DATABASE_URL") {
            self.store.url = url;
        }
        if let Some(max) = lookup("QUOTAPLANE_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                self.store.max_connections = max;
            }
        }

        // Engine
        if let Some(scope) = lookup("QUOTAPLANE_DEFAULT_SCOPE") {
            self.engine.default_scope = scope;
        }
        if let Some(max) = lookup("QUOTAPLANE_MAX_LIMITS_PER_SPEC") {
            if let Ok(max) = max.parse() {
                self.engine.max_limits_per_spec = max;
            }
        }

        // Logging
        if let Some(level) = lookup("QUOTAPLANE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(path) = lookup("QUOTAPLANE_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(path);
        }
        if let Some(enabled) = lookup("QUOTAPLANE_FILE_LOGGING") {
            self.logging.file_logging_enabled = enabled.parse().unwrap_or(false);
        }
        if let Some(json) = lookup("QUOTAPLANE_LOG_JSON") {
            self.logging.json_format = json.parse().unwrap_or(false);
        }
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.backend == StoreBackend::Sqlite && self.store.url.is_empty() {
            return Err(ConfigError::Validation("Database URL cannot be empty".to_string()));
        }

        if self.store.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }

        if self.engine.default_scope.is_empty() {
            return Err(ConfigError::Validation("default_scope cannot be empty".to_string()));
        }

        if self.engine.max_limits_per_spec == 0 {
            return Err(ConfigError::Validation(
                "max_limits_per_spec must be at least 1".to_string(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0:?}: {1}")]
    FileRead(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Config validation failed: {0}")]
    Validation(String),
}
