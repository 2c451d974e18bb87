//! Engine configuration.
//!
//! This module provides configuration for batch submission, both execution
//! backends, storage locations, and execution limits.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default maximum number of files accepted in one submission.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the batch engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Submission settings
    /// Maximum number of files in one batch.
    pub max_batch_size: usize,

    // Distributed backend settings
    /// Redis connection URL for the broker.
    pub redis_url: String,
    /// Name of the broker queue.
    pub queue_name: String,
    /// Number of worker tasks in the distributed pool.
    pub num_workers: usize,
    /// How long a worker blocks on the broker before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Hard wall-clock ceiling for one batch.
    pub hard_time_limit: Duration,
    /// Soft ceiling after which the orchestrator stops between files.
    pub soft_time_limit: Duration,
    /// Number of batches a worker runs before it is replaced.
    pub max_tasks_per_worker: u32,
    /// How long task results are kept in the broker.
    pub result_ttl: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,

    // Fallback backend settings
    /// Idle wait between checks of the in-process queue.
    pub fallback_poll_interval: Duration,
    /// Pause after a batch fails inside the in-process worker.
    pub fallback_error_backoff: Duration,

    // Orchestration settings
    /// Extra attempts for a failed file within the same invocation.
    pub max_file_retries: u32,

    // Storage settings
    /// PostgreSQL connection URL; in-memory stores are used when absent.
    pub database_url: Option<String>,
    /// Directory for encrypted artifacts.
    pub artifact_path: PathBuf,
    /// Directory for per-file scratch files; the system temp dir when absent.
    pub scratch_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,

            redis_url: "redis://localhost:6379/0".to_string(),
            queue_name: "dicom_batches".to_string(),
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            hard_time_limit: Duration::from_secs(30 * 60),
            soft_time_limit: Duration::from_secs(25 * 60),
            max_tasks_per_worker: 100,
            result_ttl: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(60),

            fallback_poll_interval: Duration::from_secs(1),
            fallback_error_backoff: Duration::from_secs(5),

            max_file_retries: 0,

            database_url: None,
            artifact_path: PathBuf::from("./uploads"),
            scratch_path: None,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MEDBATCH_MAX_BATCH_SIZE`: Maximum files per batch (default: 50)
    /// - `REDIS_URL`: Broker URL (default: redis://localhost:6379/0)
    /// - `MEDBATCH_QUEUE_NAME`: Broker queue name (default: dicom_batches)
    /// - `MEDBATCH_NUM_WORKERS`: Distributed worker count (default: 4)
    /// - `MEDBATCH_POLL_INTERVAL_SECS`: Broker poll interval (default: 1)
    /// - `MEDBATCH_HARD_TIME_LIMIT_SECS`: Hard per-batch limit (default: 1800)
    /// - `MEDBATCH_SOFT_TIME_LIMIT_SECS`: Soft per-batch limit (default: 1500)
    /// - `MEDBATCH_MAX_TASKS_PER_WORKER`: Batches before a worker is rotated (default: 100)
    /// - `MEDBATCH_RESULT_TTL_SECS`: Broker result retention (default: 3600)
    /// - `MEDBATCH_FALLBACK_BACKOFF_SECS`: In-process error backoff (default: 5)
    /// - `MEDBATCH_MAX_FILE_RETRIES`: Per-file retry budget (default: 0)
    /// - `DATABASE_URL`: PostgreSQL URL (optional)
    /// - `MEDBATCH_ARTIFACT_PATH`: Artifact directory (default: ./uploads)
    /// - `MEDBATCH_SCRATCH_PATH`: Scratch file directory (default: system temp dir)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MEDBATCH_MAX_BATCH_SIZE") {
            config.max_batch_size = parse_env_value(&val, "MEDBATCH_MAX_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("MEDBATCH_QUEUE_NAME") {
            config.queue_name = val;
        }

        if let Ok(val) = std::env::var("MEDBATCH_NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "MEDBATCH_NUM_WORKERS")?;
        }

        if let Ok(val) = std::env::var("MEDBATCH_POLL_INTERVAL_SECS") {
            config.poll_interval = parse_env_secs(&val, "MEDBATCH_POLL_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("MEDBATCH_HARD_TIME_LIMIT_SECS") {
            config.hard_time_limit = parse_env_secs(&val, "MEDBATCH_HARD_TIME_LIMIT_SECS")?;
        }

        if let Ok(val) = std::env::var("MEDBATCH_SOFT_TIME_LIMIT_SECS") {
            config.soft_time_limit = parse_env_secs(&val, "MEDBATCH_SOFT_TIME_LIMIT_SECS")?;
        }

        if let Ok(val) = std::env::var("MEDBATCH_MAX_TASKS_PER_WORKER") {
            config.max_tasks_per_worker = parse_env_value(&val, "MEDBATCH_MAX_TASKS_PER_WORKER")?;
        }

        if let Ok(val) = std::env::var("MEDBATCH_RESULT_TTL_SECS") {
            config.result_ttl = parse_env_secs(&val, "MEDBATCH_RESULT_TTL_SECS")?;
        }

        if let Ok(val) = std::env::var("MEDBATCH_FALLBACK_BACKOFF_SECS") {
            config.fallback_error_backoff = parse_env_secs(&val, "MEDBATCH_FALLBACK_BACKOFF_SECS")?;
        }

        if let Ok(val) = std::env::var("MEDBATCH_MAX_FILE_RETRIES") {
            config.max_file_retries = parse_env_value(&val, "MEDBATCH_MAX_FILE_RETRIES")?;
        }

        if let Ok(val) = std::env::var("DATABASE_URL") {
            if !val.is_empty() {
                config.database_url = Some(val);
            }
        }

        if let Ok(val) = std::env::var("MEDBATCH_ARTIFACT_PATH") {
            config.artifact_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("MEDBATCH_SCRATCH_PATH") {
            if !val.is_empty() {
                config.scratch_path = Some(PathBuf::from(val));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.hard_time_limit.is_zero() || self.soft_time_limit.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "time limits must be greater than 0".to_string(),
            ));
        }

        if self.soft_time_limit >= self.hard_time_limit {
            return Err(ConfigError::ValidationFailed(
                "soft_time_limit must be shorter than hard_time_limit".to_string(),
            ));
        }

        if self.max_tasks_per_worker == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tasks_per_worker must be greater than 0".to_string(),
            ));
        }

        if let Some(url) = &self.database_url {
            if url.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "database_url cannot be empty when set".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Builder method to set the maximum batch size.
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Builder method to set the distributed worker count.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Builder method to set both time limits.
    pub fn with_time_limits(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_time_limit = soft;
        self.hard_time_limit = hard;
        self
    }

    /// Builder method to set the worker rotation threshold.
    pub fn with_max_tasks_per_worker(mut self, max: u32) -> Self {
        self.max_tasks_per_worker = max;
        self
    }

    /// Builder method to set the in-process worker timings.
    pub fn with_fallback_timing(mut self, poll: Duration, error_backoff: Duration) -> Self {
        self.fallback_poll_interval = poll;
        self.fallback_error_backoff = error_backoff;
        self
    }

    /// Builder method to set the per-file retry budget.
    pub fn with_max_file_retries(mut self, retries: u32) -> Self {
        self.max_file_retries = retries;
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Builder method to set the artifact directory.
    pub fn with_artifact_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_path = path.into();
        self
    }

    /// Builder method to set the scratch file directory.
    pub fn with_scratch_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_path = Some(path.into());
        self
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}
