//! Service configuration
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. YAML file (`config/rulesrv.yaml` or `--config FILE`)
//! 3. Environment variables prefixed `RULESRV_`, `__` separates nesting
//!    (e.g. `RULESRV_SERVICE__PORT=6010`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use greenhouse_rules::{EngineConfig, RetentionPolicy, Schedule};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/rulesrv.yaml";
pub const DEFAULT_PORT: u16 = 6004;
pub const ENV_PREFIX: &str = "RULESRV_";
/// Upper bound for `retention.max_age_days` (100 years)
pub const MAX_RETENTION_DAYS: u64 = 36_500;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid config {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub engine: EngineSettings,
    pub retention: RetentionConfig,
    /// Time-based rules
    pub schedules: Vec<Schedule>,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file, created if missing
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/rulesrv.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Timeout of a single enqueue on the command queue
    pub dispatch_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: 500,
        }
    }
}

impl EngineSettings {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            dispatch_timeout: Duration::from_millis(self.dispatch_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_entries_per_rule: u32,
    pub max_age_days: u64,
    /// How often the retention sweep runs
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_entries_per_rule: 1000,
            max_age_days: 90,
            interval_secs: 3600,
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_entries_per_rule: self.max_entries_per_rule,
            max_age: Duration::from_secs(self.max_age_days.saturating_mul(24 * 3600)),
        }
    }
}

/// Log filter directive, e.g. "info" or "info,greenhouse_rules=debug"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel("info".to_string())
    }
}

impl Config {
    /// Figment with every source merged, not yet extracted
    pub fn figment(path: Option<&Path>) -> Figment {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate configuration
    ///
    /// An explicitly given file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
        }

        let config: Config = Self::figment(path).extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.port == 0 {
            return Err(ConfigError::invalid("service.port", "Port cannot be 0"));
        }
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::invalid("database.path", "Path cannot be empty"));
        }
        if self.engine.dispatch_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "engine.dispatch_timeout_ms",
                "Timeout must be positive",
            ));
        }
        if self.retention.interval_secs == 0 {
            return Err(ConfigError::invalid(
                "retention.interval_secs",
                "Interval must be positive",
            ));
        }
        if self.retention.max_age_days == 0 || self.retention.max_age_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::invalid(
                "retention.max_age_days",
                format!("Must be within 1..={}", MAX_RETENTION_DAYS),
            ));
        }
        if let Some(s) = self.schedules.iter().find(|s| s.interval_secs == 0) {
            return Err(ConfigError::invalid(
                format!("schedules[rule_id={}].interval_secs", s.rule_id),
                "Interval must be positive",
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.service.host, self.service.port)
    }
}
