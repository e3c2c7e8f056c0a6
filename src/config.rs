//! Runtime and queue configuration.
//!
//! Two layers live here:
//!
//! - [`QueueConfig`]: process settings (database path, worker count, polling
//!   and heartbeat cadence) built from defaults and `QUEUECTL_*` environment
//!   variables.
//! - [`ConfigKey`] / [`GlobalSettings`]: the retry and timeout settings stored
//!   in the database `config` table and shared by every process.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::worker_pool::WorkerPoolConfig;
use crate::storage::{Store, StoreError};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable or setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// A configuration key is not recognised.
    #[error("Unknown configuration key '{0}' (expected one of: max_retries, base_backoff, job_timeout_sec)")]
    UnknownKey(String),

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Process-level settings for the CLI and worker pool.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// SQLite database file shared by all queuectl processes.
    pub db_path: PathBuf,
    /// Default number of execution loops for `worker start`.
    pub workers: usize,
    /// Idle wait between claim attempts.
    pub poll_interval: Duration,
    /// How often a pool refreshes its heartbeat rows.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a claim is considered abandoned.
    pub stale_after: Duration,
    /// Upper bound on waiting for loops to exit after a stop.
    pub shutdown_timeout: Duration,
    /// Wait before a loop retries after a store error.
    pub store_retry_backoff: Duration,
    /// Directory holding one output log per job.
    pub log_dir: PathBuf,
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for QueueConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            db_path: home.join(".queuectl.db"),
            workers: 1,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(600),
            store_retry_backoff: Duration::from_secs(1),
            log_dir: home.join(".queuectl").join("logs"),
        }
    }
}

impl QueueConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QUEUECTL_DB`: Database file (default: ~/.queuectl.db)
    /// - `QUEUECTL_WORKERS`: Worker count (default: 1)
    /// - `QUEUECTL_POLL_INTERVAL_MS`: Idle poll interval (default: 1000)
    /// - `QUEUECTL_HEARTBEAT_INTERVAL_MS`: Heartbeat interval (default: 5000)
    /// - `QUEUECTL_STALE_AFTER_SECS`: Stale claim threshold (default: 30)
    /// - `QUEUECTL_SHUTDOWN_TIMEOUT_SECS`: Shutdown wait (default: 600)
    /// - `QUEUECTL_LOG_DIR`: Job log directory (default: ~/.queuectl/logs)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("QUEUECTL_DB") {
            config.db_path = PathBuf::from(val);
        }

        if let Some(val) = lookup("QUEUECTL_WORKERS") {
            config.workers = parse_env_value(&val, "QUEUECTL_WORKERS")?;
        }

        if let Some(val) = lookup("QUEUECTL_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "QUEUECTL_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("QUEUECTL_HEARTBEAT_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "QUEUECTL_HEARTBEAT_INTERVAL_MS")?;
            config.heartbeat_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("QUEUECTL_STALE_AFTER_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUECTL_STALE_AFTER_SECS")?;
            config.stale_after = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("QUEUECTL_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUECTL_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("QUEUECTL_LOG_DIR") {
            config.log_dir = PathBuf::from(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval must be greater than 0".to_string(),
            ));
        }

        if self.stale_after <= self.heartbeat_interval {
            return Err(ConfigError::ValidationFailed(
                "stale_after must exceed heartbeat_interval".to_string(),
            ));
        }

        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "db_path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the database path.
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    /// Builder method to set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Builder method to set the job log directory.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Worker pool settings for `num_workers` loops.
    pub fn pool_config(&self, num_workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::new(num_workers)
            .with_poll_interval(self.poll_interval)
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_stale_after(self.stale_after)
            .with_shutdown_timeout(self.shutdown_timeout)
            .with_store_retry_backoff(self.store_retry_backoff)
    }
}

/// Parses an environment variable value.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

/// Keys of the store-backed configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    MaxRetries,
    BaseBackoff,
    JobTimeoutSec,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 3] = [
        ConfigKey::MaxRetries,
        ConfigKey::BaseBackoff,
        ConfigKey::JobTimeoutSec,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BaseBackoff => "base_backoff",
            ConfigKey::JobTimeoutSec => "job_timeout_sec",
        }
    }

    /// Value in force when the key was never set.
    pub fn default_value(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "3",
            ConfigKey::BaseBackoff => "2",
            ConfigKey::JobTimeoutSec => "30",
        }
    }

    /// Checks `value` and returns its normalised form for storage.
    pub fn validate(&self, value: &str) -> Result<String, ConfigError> {
        let key = self.as_str();
        match self {
            ConfigKey::MaxRetries => {
                let n: u32 = parse_env_value(value, key)?;
                if n < 1 {
                    return Err(invalid(key, "must be at least 1"));
                }
                Ok(n.to_string())
            }
            ConfigKey::BaseBackoff => {
                let base: f64 = parse_env_value(value, key)?;
                if !base.is_finite() || base < 1.0 {
                    return Err(invalid(key, "must be a number >= 1.0"));
                }
                Ok(base.to_string())
            }
            ConfigKey::JobTimeoutSec => {
                let secs: u64 = parse_env_value(value, key)?;
                if secs < 1 {
                    return Err(invalid(key, "must be at least 1"));
                }
                Ok(secs.to_string())
            }
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "max_retries" | "max-retries" => Ok(ConfigKey::MaxRetries),
            "base_backoff" | "backoff_base" => Ok(ConfigKey::BaseBackoff),
            "job_timeout_sec" | "job_timeout" => Ok(ConfigKey::JobTimeoutSec),
            other => Err(ConfigError::UnknownKey(other.to_string())),
        }
    }
}

/// Retry and timeout settings shared through the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalSettings {
    pub max_retries: u32,
    pub base_backoff: f64,
    pub job_timeout_sec: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: 2.0,
            job_timeout_sec: 30,
        }
    }
}

impl GlobalSettings {
    /// Reads the current settings, using defaults for unset keys.
    ///
    /// A stored value that no longer parses is ignored with a warning.
    pub async fn load(store: &Store) -> Result<Self, StoreError> {
        let mut settings = Self::default();

        for key in ConfigKey::ALL {
            let Some(raw) = store.get_config(key.as_str()).await? else {
                continue;
            };

            let applied = match key {
                ConfigKey::MaxRetries => raw.parse().map(|v| settings.max_retries = v).is_ok(),
                ConfigKey::BaseBackoff => raw.parse().map(|v| settings.base_backoff = v).is_ok(),
                ConfigKey::JobTimeoutSec => {
                    raw.parse().map(|v| settings.job_timeout_sec = v).is_ok()
                }
            };

            if !applied {
                tracing::warn!(key = key.as_str(), value = %raw, "Ignoring unparseable config value");
            }
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.db_path.ends_with(".queuectl.db"));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("QUEUECTL_DB", "/tmp/q.db"),
            ("QUEUECTL_WORKERS", "4"),
            ("QUEUECTL_POLL_INTERVAL_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_from_lookup_invalid_value() {
        let err = QueueConfig::from_lookup(lookup(&[("QUEUECTL_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "QUEUECTL_WORKERS"));

        let err = QueueConfig::from_lookup(lookup(&[("QUEUECTL_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_stale_after_must_exceed_heartbeat() {
        let err = QueueConfig::from_lookup(lookup(&[
            ("QUEUECTL_HEARTBEAT_INTERVAL_MS", "10000"),
            ("QUEUECTL_STALE_AFTER_SECS", "5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_config_key_parse_and_validate() {
        assert_eq!("max_retries".parse::<ConfigKey>().unwrap(), ConfigKey::MaxRetries);
        assert_eq!("backoff_base".parse::<ConfigKey>().unwrap(), ConfigKey::BaseBackoff);
        assert!(matches!(
            "nope".parse::<ConfigKey>(),
            Err(ConfigError::UnknownKey(_))
        ));

        assert_eq!(ConfigKey::MaxRetries.validate(" 5 ").unwrap(), "5");
        assert!(ConfigKey::MaxRetries.validate("0").is_err());
        assert!(ConfigKey::MaxRetries.validate("-1").is_err());
        assert_eq!(ConfigKey::BaseBackoff.validate("1.5").unwrap(), "1.5");
        assert!(ConfigKey::BaseBackoff.validate("0.5").is_err());
        assert!(ConfigKey::JobTimeoutSec.validate("0").is_err());
    }

    #[test]
    fn test_defaults_match_global_settings() {
        let defaults = GlobalSettings::default();
        assert_eq!(
            ConfigKey::MaxRetries.default_value().parse::<u32>().unwrap(),
            defaults.max_retries
        );
        assert_eq!(
            ConfigKey::BaseBackoff.default_value().parse::<f64>().unwrap(),
            defaults.base_backoff
        );
        assert_eq!(
            ConfigKey::JobTimeoutSec.default_value().parse::<u64>().unwrap(),
            defaults.job_timeout_sec
        );
    }

    #[tokio::test]
    async fn test_global_settings_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("config.db")).await.unwrap();

        assert_eq!(GlobalSettings::load(&store).await.unwrap(), GlobalSettings::default());

        store.set_config("max_retries", "5").await.unwrap();
        store.set_config("job_timeout_sec", "garbage").await.unwrap();

        let settings = GlobalSettings::load(&store).await.unwrap();
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.base_backoff, 2.0);
        assert_eq!(settings.job_timeout_sec, 30);
    }
}
