//! trapline: distributed dispatch, progress tracking and reconciliation
//! for image-processing jobs.
//!
//! A job's task list is published onto a per-job broker stream, consumed
//! in batches by an elastic pool of workers with at-least-once delivery,
//! tracked in a fast store as a shrinking pending set, and periodically
//! reconciled against the task executor's live view so no job is ever
//! silently lost or permanently stuck.

// Core modules
pub mod broker;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod monitor;
pub mod progress;
pub mod storage;

// Re-export commonly used types
pub use broker::{
    BrokerError, ConnectionProvider, ProviderRegistry, TaskQueueCoordinator, TaskRecord,
};
pub use config::{Config, ConfigError, JobThresholds};
pub use dispatch::{JobDispatcher, TaskHandler, WorkerPool, WorkerPoolConfig};
pub use monitor::{JobState, JobStatusMonitor, MonitorRunner, TaskExecutor};
pub use progress::{ProgressTracker, TaskProgress};
pub use storage::{JobRecord, JobStore, PgJobStore};
