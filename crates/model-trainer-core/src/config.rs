//! Service configuration.
//!
//! Settings come from an optional TOML file, then a small set of environment
//! overrides, and are validated before use. Every field has a default, so an
//! empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Filesystem roots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default = "default_artifacts_root")]
    pub artifacts_root: PathBuf,
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/data")
}

fn default_artifacts_root() -> PathBuf {
    PathBuf::from("/data/artifacts")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { data_root: default_data_root(), artifacts_root: default_artifacts_root() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: default_redis_url() }
    }
}

/// Retry policy for shared state store calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateStoreConfig {
    /// Total attempts per call, including the first (default: 3).
    #[serde(default = "default_store_attempts")]
    pub attempts: u32,

    /// Delay before the second attempt; doubles after each failure (default: 10 ms).
    #[serde(default = "default_store_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_store_attempts() -> u32 {
    3
}

fn default_store_initial_backoff_ms() -> u64 {
    10
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            attempts: default_store_attempts(),
            initial_backoff_ms: default_store_initial_backoff_ms(),
        }
    }
}

impl StateStoreConfig {
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// Job submission policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Hard per-job execution limit enforced by the broker (default: 24h).
    #[serde(default = "default_day_secs")]
    pub job_timeout_sec: u64,

    #[serde(default = "default_day_secs")]
    pub result_ttl_sec: u64,

    #[serde(default = "default_failure_ttl_sec")]
    pub failure_ttl_sec: u64,

    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    /// One delay per retry attempt; the last one repeats.
    #[serde(default = "default_retry_intervals_sec")]
    pub retry_intervals_sec: Vec<u64>,
}

fn default_queue_name() -> String {
    "training".to_string()
}

fn default_day_secs() -> u64 {
    86_400
}

fn default_failure_ttl_sec() -> u64 {
    7 * 86_400
}

fn default_retry_max() -> u32 {
    1
}

fn default_retry_intervals_sec() -> Vec<u64> {
    vec![300]
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: default_queue_name(),
            job_timeout_sec: default_day_secs(),
            result_ttl_sec: default_day_secs(),
            failure_ttl_sec: default_failure_ttl_sec(),
            retry_max: default_retry_max(),
            retry_intervals_sec: default_retry_intervals_sec(),
        }
    }
}

/// Remote artifact store ("data bank") client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataBankConfig {
    #[serde(default = "default_data_bank_url")]
    pub url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_data_bank_timeout_sec")]
    pub timeout_sec: u64,

    /// Extra attempts for idempotent requests after 5xx or transport errors.
    #[serde(default = "default_data_bank_retries")]
    pub retries: u32,

    /// Linear backoff unit: attempt `n` waits `n * backoff_ms`.
    #[serde(default = "default_data_bank_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_data_bank_url() -> String {
    "http://data-bank-api:8000".to_string()
}

fn default_data_bank_timeout_sec() -> u64 {
    600
}

fn default_data_bank_retries() -> u32 {
    3
}

fn default_data_bank_backoff_ms() -> u64 {
    500
}

impl Default for DataBankConfig {
    fn default() -> Self {
        Self {
            url: default_data_bank_url(),
            api_key: String::new(),
            timeout_sec: default_data_bank_timeout_sec(),
            retries: default_data_bank_retries(),
            backoff_ms: default_data_bank_backoff_ms(),
        }
    }
}

impl DataBankConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }

    #[must_use]
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Order in which cached corpus files are evicted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Least recently accessed first.
    #[default]
    Lru,
    /// Least recently modified first.
    Oldest,
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lru => f.write_str("lru"),
            Self::Oldest => f.write_str("oldest"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorpusCacheCleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Upper bound on total cache size (default: 10 GiB).
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,

    /// Free space the cache filesystem must keep (default: 2 GiB).
    #[serde(default = "default_cache_min_free_bytes")]
    pub min_free_bytes: u64,

    #[serde(default)]
    pub eviction_policy: EvictionPolicy,
}

fn default_true() -> bool {
    true
}

fn default_cache_max_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_cache_min_free_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

impl Default for CorpusCacheCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: default_cache_max_bytes(),
            min_free_bytes: default_cache_min_free_bytes(),
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenizerCleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum age (by modification time) before an unreferenced tokenizer is removed.
    #[serde(default = "default_min_unused_days")]
    pub min_unused_days: u32,
}

fn default_min_unused_days() -> u32 {
    30
}

impl Default for TokenizerCleanupConfig {
    fn default() -> Self {
        Self { enabled: true, min_unused_days: default_min_unused_days() }
    }
}

impl TokenizerCleanupConfig {
    #[must_use]
    pub fn min_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.min_unused_days) * 86_400)
    }
}

/// Post-upload local artifact cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactCleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Require a recorded artifact file id before deleting.
    #[serde(default = "default_true")]
    pub verify_upload: bool,

    #[serde(default)]
    pub grace_period_seconds: u64,

    #[serde(default)]
    pub dry_run: bool,
}

impl Default for ArtifactCleanupConfig {
    fn default() -> Self {
        Self { enabled: true, verify_upload: true, grace_period_seconds: 0, dry_run: false }
    }
}

impl ArtifactCleanupConfig {
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub state_store: StateStoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub data_bank: DataBankConfig,
    #[serde(default)]
    pub corpus_cache_cleanup: CorpusCacheCleanupConfig,
    #[serde(default)]
    pub tokenizer_cleanup: TokenizerCleanupConfig,
    #[serde(default)]
    pub cleanup: ArtifactCleanupConfig,
}

impl Settings {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        Self::from_toml_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from an optional file, apply process environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut settings = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Apply environment overrides using `lookup` to read variables.
    ///
    /// Recognized: `REDIS_URL`, `DATA_BANK_URL`, `DATA_BANK_API_KEY`,
    /// `DATA_ROOT`, `ARTIFACTS_ROOT`. Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(url) = get("DATA_BANK_URL") {
            self.data_bank.url = url;
        }
        if let Some(key) = get("DATA_BANK_API_KEY") {
            self.data_bank.api_key = key;
        }
        if let Some(root) = get("DATA_ROOT") {
            self.app.data_root = PathBuf::from(root);
        }
        if let Some(root) = get("ARTIFACTS_ROOT") {
            self.app.artifacts_root = PathBuf::from(root);
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.state_store.attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "state_store.attempts must be greater than 0".to_string(),
            ));
        }
        if self.queue.queue_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue("queue.queue_name must not be empty".to_string()));
        }
        if self.queue.job_timeout_sec == 0 {
            return Err(ConfigError::InvalidValue(
                "queue.job_timeout_sec must be greater than 0".to_string(),
            ));
        }
        if self.queue.retry_max > 0 && self.queue.retry_intervals_sec.is_empty() {
            return Err(ConfigError::InvalidValue(
                "queue.retry_intervals_sec must not be empty when retry_max > 0".to_string(),
            ));
        }
        if self.data_bank.timeout_sec == 0 {
            return Err(ConfigError::InvalidValue(
                "data_bank.timeout_sec must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// `{data_root}/corpus_cache`.
    #[must_use]
    pub fn corpus_cache_dir(&self) -> PathBuf {
        model_trainer_training::corpus_cache_dir(&self.app.data_root)
    }
}
