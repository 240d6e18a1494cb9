//! Engine configuration file support.
//!
//! Configuration is layered: built-in defaults, then the global file
//! (`~/.tessera/config.toml`), then the local file (`./.tesserarc`), then
//! environment overrides. Every field in a file is optional; later layers
//! only override the fields they set.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::batch::BatchSettings;
use crate::playbooks::types::FALLBACK_LOCALE;
use crate::workflow::executor::DEFAULT_STEP_TIMEOUT;
use crate::workflow::jobs::DEFAULT_RESULT_TTL;
use crate::workflow::retry::RetryPolicy;

/// Overrides the playbooks directory.
pub const PLAYBOOKS_DIR_ENV: &str = "TESSERA_PLAYBOOKS_DIR";
/// Overrides the artifacts directory.
pub const ARTIFACTS_DIR_ENV: &str = "TESSERA_ARTIFACTS_DIR";

/// Engine configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Log level used by the CLI when `RUST_LOG` is unset
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub locale: LocaleConfig,

    #[serde(default)]
    pub steps: StepsConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default)]
    pub playbooks_dir: Option<PathBuf>,
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocaleConfig {
    /// Locale tried after the requested and default locales
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepsConfig {
    /// Wall-clock budget of one synchronous tool call
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub item_timeout_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobsConfig {
    /// How long terminal job statuses stay queryable
    #[serde(default)]
    pub result_ttl_secs: Option<u64>,
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read or write configuration file.
    #[error("Failed to access configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

macro_rules! take_some {
    ($target:expr, $source:expr) => {
        if let Some(value) = &$source {
            $target = Some(value.clone());
        }
    };
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::ReadError(format!("Failed to create directory: {}", e)))?;
        }

        std::fs::write(path, content)
            .map_err(|e| ConfigError::ReadError(format!("Failed to write file: {}", e)))?;

        Ok(())
    }

    fn home_dir() -> PathBuf {
        std::env::var("HOME").map_or_else(|_| PathBuf::from("."), PathBuf::from).join(".tessera")
    }

    /// Get default global configuration file path.
    pub fn default_global_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get default local configuration file path.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".tesserarc")
    }

    /// Discover and load configuration files.
    ///
    /// Loads configuration from:
    /// 1. Global config (~/.tessera/config.toml)
    /// 2. Local config (./.tesserarc)
    /// 3. `TESSERA_PLAYBOOKS_DIR` / `TESSERA_ARTIFACTS_DIR`
    ///
    /// Later sources override earlier ones. Unreadable files are skipped with
    /// a warning.
    pub fn discover_and_load() -> Self {
        let mut config = Self::default();

        for path in [Self::default_global_path(), Self::default_local_path()] {
            match Self::load_from_file(&path) {
                Ok(layer) => config.merge(&layer),
                Err(ConfigError::NotFound(_)) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Ignoring configuration file"),
            }
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &Self) {
        take_some!(self.paths.playbooks_dir, other.paths.playbooks_dir);
        take_some!(self.paths.artifacts_dir, other.paths.artifacts_dir);
        take_some!(self.locale.fallback, other.locale.fallback);
        take_some!(self.steps.timeout_secs, other.steps.timeout_secs);
        take_some!(self.retry.max_attempts, other.retry.max_attempts);
        take_some!(self.retry.initial_delay_ms, other.retry.initial_delay_ms);
        take_some!(self.retry.max_delay_ms, other.retry.max_delay_ms);
        take_some!(self.retry.multiplier, other.retry.multiplier);
        take_some!(self.batch.concurrency, other.batch.concurrency);
        take_some!(self.batch.item_timeout_secs, other.batch.item_timeout_secs);
        take_some!(self.batch.timeout_secs, other.batch.timeout_secs);
        take_some!(self.jobs.result_ttl_secs, other.jobs.result_ttl_secs);
        take_some!(self.log_level, other.log_level);
    }

    /// Apply directory overrides from the environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(PLAYBOOKS_DIR_ENV).filter(|v| !v.is_empty()) {
            self.paths.playbooks_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup(ARTIFACTS_DIR_ENV).filter(|v| !v.is_empty()) {
            self.paths.artifacts_dir = Some(PathBuf::from(dir));
        }
    }

    /// Reject values that would stall or disable execution.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::InvalidValue("retry.max_attempts must be at least 1".to_string()));
        }
        if self.batch.concurrency == Some(0) {
            return Err(ConfigError::InvalidValue("batch.concurrency must be at least 1".to_string()));
        }
        if self.retry.multiplier.is_some_and(|m| !m.is_finite() || m < 1.0) {
            return Err(ConfigError::InvalidValue("retry.multiplier must be >= 1.0".to_string()));
        }
        for (name, secs) in [
            ("steps.timeout_secs", self.steps.timeout_secs),
            ("batch.item_timeout_secs", self.batch.item_timeout_secs),
            ("batch.timeout_secs", self.batch.timeout_secs),
            ("jobs.result_ttl_secs", self.jobs.result_ttl_secs),
        ] {
            if secs == Some(0) {
                return Err(ConfigError::InvalidValue(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn playbooks_dir(&self) -> PathBuf {
        self.paths.playbooks_dir.clone().unwrap_or_else(|| Self::home_dir().join("playbooks"))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.paths.artifacts_dir.clone().unwrap_or_else(|| Self::home_dir().join("artifacts"))
    }

    pub fn fallback_locale(&self) -> &str {
        self.locale.fallback.as_deref().unwrap_or(FALLBACK_LOCALE)
    }

    pub fn step_timeout(&self) -> Duration {
        self.steps.timeout_secs.map_or(DEFAULT_STEP_TIMEOUT, Duration::from_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy::new(
            self.retry.max_attempts.unwrap_or(defaults.max_attempts),
            self.retry.initial_delay_ms.map_or(defaults.initial_delay, Duration::from_millis),
            self.retry.max_delay_ms.map_or(defaults.max_delay, Duration::from_millis),
            self.retry.multiplier.unwrap_or(defaults.multiplier),
        )
    }

    pub fn result_ttl(&self) -> Duration {
        self.jobs.result_ttl_secs.map_or(DEFAULT_RESULT_TTL, Duration::from_secs)
    }

    pub fn batch_settings(&self) -> BatchSettings {
        let defaults = BatchSettings::default();
        BatchSettings {
            concurrency: self.batch.concurrency.unwrap_or(defaults.concurrency).max(1),
            item_timeout: self.batch.item_timeout_secs.map_or(defaults.item_timeout, Duration::from_secs),
            batch_timeout: self.batch.timeout_secs.map_or(defaults.batch_timeout, Duration::from_secs),
        }
    }
}
