//! Runtime configuration for dispatch, progress tracking and reconciliation.
//!
//! This module provides configuration for the broker connection, worker
//! batching, progress-store TTLs and the job reconciliation thresholds.
//! Values come from `Config::default()` overridden by environment variables
//! via `Config::from_env()`.

use std::time::Duration;

use thiserror::Error;

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

/// Thresholds driving the job reconciliation state machine.
///
/// All four are wall-clock bounds compared against persisted job timestamps.
#[derive(Debug, Clone)]
pub struct JobThresholds {
    /// Maximum time a job may stay in STARTED before being failed.
    pub max_job_runtime: Duration,
    /// Maximum time a PENDING job may go without an executor task id.
    pub no_task_id_timeout: Duration,
    /// How long a STARTED job may run while the executor has no record of
    /// its task before it is considered disappeared.
    pub disappeared_task_retry_threshold: Duration,
    /// How long a PENDING job may sit queued before the worker-availability
    /// warning fires.
    pub stuck_pending_timeout: Duration,
}

impl Default for JobThresholds {
    fn default() -> Self {
        Self {
            max_job_runtime: Duration::from_secs(86_400), // 24 hours
            no_task_id_timeout: Duration::from_secs(600),
            disappeared_task_retry_threshold: Duration::from_secs(1800),
            stuck_pending_timeout: Duration::from_secs(3600),
        }
    }
}

/// Top-level configuration for the trapline runtime.
#[derive(Debug, Clone)]
pub struct Config {
    // Connection settings
    /// Redis connection URL (broker streams and progress keys).
    pub redis_url: String,
    /// PostgreSQL connection URL for the persisted job rows.
    pub database_url: String,

    // Queue settings
    /// Maximum number of tasks reserved per worker pull.
    pub batch_size: usize,
    /// How long a reservation blocks waiting for messages before
    /// returning an empty batch.
    pub reserve_timeout: Duration,
    /// Idle time after which an unacknowledged task becomes eligible for
    /// redelivery to another worker. Must exceed the worst-case task
    /// processing time or duplicates will be common.
    pub redelivery_timeout: Duration,

    // Progress settings
    /// TTL on the pending-set and total keys so abandoned jobs expire.
    pub pending_ttl: Duration,
    /// TTL on the advisory lock guarding pending-set mutation.
    pub lock_ttl: Duration,

    // Reconciliation settings
    /// Thresholds for the status monitor.
    pub thresholds: JobThresholds,
    /// Interval between reconciliation sweeps.
    pub monitor_interval: Duration,

    // Worker settings
    /// Number of worker tasks per pool.
    pub num_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            database_url: "postgres://localhost/trapline".to_string(),
            batch_size: 5,
            reserve_timeout: Duration::from_secs(5),
            redelivery_timeout: Duration::from_secs(1800), // 30 minutes
            pending_ttl: Duration::from_secs(604_800),     // 7 days
            lock_ttl: Duration::from_secs(300),
            thresholds: JobThresholds::default(),
            monitor_interval: Duration::from_secs(180),
            num_workers: 4,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// Recognized variables: `REDIS_URL`, `DATABASE_URL`, `BATCH_SIZE`,
    /// `NUM_WORKERS`, `REDELIVERY_TIMEOUT_SECONDS`, `LOCK_TTL_SECONDS`,
    /// `MAX_JOB_RUNTIME_SECONDS`, `NO_TASK_ID_TIMEOUT_SECONDS`,
    /// `DISAPPEARED_TASK_RETRY_THRESHOLD_SECONDS`,
    /// `STUCK_PENDING_TIMEOUT_SECONDS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(n) = read_env_u64("BATCH_SIZE")? {
            config.batch_size = n as usize;
        }
        if let Some(n) = read_env_u64("NUM_WORKERS")? {
            config.num_workers = n as usize;
        }
        if let Some(n) = read_env_u64("REDELIVERY_TIMEOUT_SECONDS")? {
            config.redelivery_timeout = Duration::from_secs(n);
        }
        if let Some(n) = read_env_u64("LOCK_TTL_SECONDS")? {
            config.lock_ttl = Duration::from_secs(n);
        }
        if let Some(n) = read_env_u64("MAX_JOB_RUNTIME_SECONDS")? {
            config.thresholds.max_job_runtime = Duration::from_secs(n);
        }
        if let Some(n) = read_env_u64("NO_TASK_ID_TIMEOUT_SECONDS")? {
            config.thresholds.no_task_id_timeout = Duration::from_secs(n);
        }
        if let Some(n) = read_env_u64("DISAPPEARED_TASK_RETRY_THRESHOLD_SECONDS")? {
            config.thresholds.disappeared_task_retry_threshold = Duration::from_secs(n);
        }
        if let Some(n) = read_env_u64("STUCK_PENDING_TIMEOUT_SECONDS")? {
            config.thresholds.stuck_pending_timeout = Duration::from_secs(n);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration, returning an error describing the first
    /// problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.redelivery_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "redelivery_timeout must be non-zero".to_string(),
            ));
        }
        if self.lock_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "lock_ttl must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Sets the reservation batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the number of workers per pool.
    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    /// Sets the redelivery timeout for unacknowledged tasks.
    pub fn with_redelivery_timeout(mut self, timeout: Duration) -> Self {
        self.redelivery_timeout = timeout;
        self
    }
}

/// Reads an environment variable as a u64, returning `None` when unset.
fn read_env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
