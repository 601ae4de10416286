//! Worker pool consuming a job's task queue.
//!
//! Each worker is an independent async task owning its own broker
//! connection (one provider per concurrency context). Workers repeatedly
//! reserve a bounded batch, run every task through the handler, acknowledge
//! the ones that were durably processed and report their ids to the
//! progress tracker, in that order, so a crash before acknowledgment
//! causes redelivery instead of silent loss.
//!
//! Delivery is at-least-once: handlers must tolerate seeing the same task
//! twice.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, ProviderRegistry, ReservedTask, TaskQueueCoordinator, TaskRecord};
use crate::progress::{ProgressError, ProgressTracker};

/// How many times a worker retries a lock-contended progress update
/// before dropping the round.
const PROGRESS_RETRIES: usize = 3;

/// Pause between progress-update retries.
const PROGRESS_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Pause after a broker error before the worker tries again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Broker operation failed.
    #[error("Queue error: {0}")]
    Broker(#[from] BrokerError),

    /// Progress-store operation failed.
    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Error returned by a task handler.
///
/// A failed handle leaves the task unacknowledged, so the broker
/// redelivers it after the redelivery timeout.
#[derive(Debug, Error)]
#[error("Task handler failed: {0}")]
pub struct HandlerError(pub String);

/// The external worker collaborator: runs the image pipeline for one task
/// and persists its results durably before returning.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Processes one task end to end. Returning `Ok` asserts the results
    /// are durably persisted; only then is the task acknowledged and its
    /// id reported as processed.
    async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError>;
}

/// Configuration for a per-job worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Job whose queue this pool consumes.
    pub job_id: String,
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Maximum tasks reserved per pull.
    pub batch_size: usize,
    /// How long a reservation blocks before returning an empty batch.
    pub reserve_timeout: Duration,
    /// Idle time after which unacknowledged tasks are redelivered.
    pub redelivery_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl WorkerPoolConfig {
    /// Creates a configuration for the given job with default settings.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            num_workers: 4,
            batch_size: 5,
            reserve_timeout: Duration::from_secs(5),
            redelivery_timeout: Duration::from_secs(1800),
            shutdown_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the number of workers.
    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    /// Sets the reservation batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the reservation timeout.
    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    /// Sets the redelivery timeout.
    pub fn with_redelivery_timeout(mut self, timeout: Duration) -> Self {
        self.redelivery_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Workers currently processing a batch.
    pub active_workers: usize,
    /// Tasks handled and acknowledged.
    pub tasks_processed: u64,
    /// Tasks whose handler failed (left for redelivery).
    pub tasks_failed: u64,
}

/// Shared counters behind the pool statistics.
struct SharedPoolStats {
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_processed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            tasks_processed: self.tasks_processed.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
        }
    }
}

/// Pool of workers consuming one job's queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    registry: Arc<ProviderRegistry>,
    tracker: ProgressTracker,
    handler: Arc<dyn TaskHandler>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool. Nothing runs until `start`.
    pub fn new(
        config: WorkerPoolConfig,
        registry: Arc<ProviderRegistry>,
        tracker: ProgressTracker,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            tracker,
            handler,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns all workers. Each gets its own connection provider keyed by
    /// its worker name.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let name = format!("worker-{i}");
            let provider = self.registry.provider_for(&name);
            let coordinator = TaskQueueCoordinator::new(
                provider.clone(),
                name.clone(),
                self.config.redelivery_timeout,
            );

            let worker = Worker {
                name,
                job_id: self.config.job_id.clone(),
                coordinator,
                provider,
                tracker: self.tracker.clone(),
                handler: Arc::clone(&self.handler),
                shutdown_rx: self.shutdown_tx.subscribe(),
                batch_size: self.config.batch_size,
                reserve_timeout: self.config.reserve_timeout,
                stats: Arc::clone(&self.stats),
            };

            let handle = tokio::spawn(async move {
                worker.run().await;
            });
            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            job_id = %self.config.job_id,
            num_workers = self.config.num_workers,
            "Worker pool started"
        );
        Ok(())
    }

    /// Gracefully shuts down all workers, letting them finish their
    /// current batch.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(job_id = %self.config.job_id, "Initiating worker pool shutdown");
        let _ = self.shutdown_tx.send(());

        let drain = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, drain).await;
        self.is_running.store(false, Ordering::SeqCst);
        self.registry.close_all().await;

        match result {
            Ok(()) => {
                info!(job_id = %self.config.job_id, "Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

/// A single worker consuming batches from the job's queue.
struct Worker {
    name: String,
    job_id: String,
    coordinator: TaskQueueCoordinator,
    provider: Arc<crate::broker::ConnectionProvider>,
    tracker: ProgressTracker,
    handler: Arc<dyn TaskHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    batch_size: usize,
    reserve_timeout: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Main worker loop: reserve, handle, acknowledge, report.
    async fn run(mut self) {
        info!(worker = %self.name, job_id = %self.job_id, "Worker started");

        if !self.connect_with_retry().await {
            return;
        }

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker = %self.name, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let batch = match self
                .coordinator
                .reserve_tasks(&self.job_id, self.batch_size, self.reserve_timeout)
                .await
            {
                Ok(batch) => batch,
                Err(e) if e.is_connection_error() => {
                    warn!(worker = %self.name, error = %e, "Reservation failed, resetting connection");
                    self.provider.reset().await;
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    if !self.connect_with_retry().await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Reservation failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            if batch.is_empty() {
                // The reservation already waited out its timeout.
                debug!(worker = %self.name, "No tasks available");
                continue;
            }

            self.stats.active_workers.fetch_add(1, Ordering::SeqCst);
            let processed_ids = self.process_batch(batch).await;
            self.stats.active_workers.fetch_sub(1, Ordering::SeqCst);

            if !processed_ids.is_empty() {
                self.report_progress(&processed_ids).await;
            }
        }

        info!(worker = %self.name, "Worker stopped");
    }

    /// Establishes the broker connection, retrying until success or
    /// shutdown.
    async fn connect_with_retry(&mut self) -> bool {
        loop {
            match self.coordinator.connect().await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "Broker unreachable, retrying");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => return false,
                _ => {}
            }
        }
    }

    /// Runs every task in the batch through the handler, acknowledging the
    /// successes. Failed tasks stay unacknowledged for redelivery.
    async fn process_batch(&self, batch: Vec<ReservedTask>) -> Vec<String> {
        let mut processed_ids = Vec::with_capacity(batch.len());

        for reserved in batch {
            let task_id = reserved.task.id.clone();

            match self.handler.handle(&reserved.task).await {
                Ok(()) => {
                    match self.coordinator.acknowledge_task(&reserved.ack).await {
                        Ok(true) => {}
                        Ok(false) => {
                            // Redelivery timeout elapsed mid-processing or
                            // the job was cancelled; the work itself is
                            // durable either way.
                            warn!(worker = %self.name, task_id = %task_id, "Acknowledgment not accepted");
                        }
                        Err(e) => {
                            warn!(worker = %self.name, task_id = %task_id, error = %e, "Acknowledgment failed");
                        }
                    }
                    self.stats.tasks_processed.fetch_add(1, Ordering::SeqCst);
                    processed_ids.push(task_id);
                }
                Err(e) => {
                    warn!(
                        worker = %self.name,
                        task_id = %task_id,
                        error = %e,
                        "Task handler failed, leaving task for redelivery"
                    );
                    self.stats.tasks_failed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        processed_ids
    }

    /// Reports processed ids to the tracker, retrying a few times on lock
    /// contention before dropping the round.
    async fn report_progress(&self, processed_ids: &[String]) {
        for attempt in 0..PROGRESS_RETRIES {
            match self
                .tracker
                .mark_processed(&self.job_id, processed_ids, None)
                .await
            {
                Ok(Some(progress)) => {
                    debug!(
                        worker = %self.name,
                        job_id = %self.job_id,
                        remaining = progress.remaining,
                        processed = progress.processed,
                        "Progress updated"
                    );
                    return;
                }
                Ok(None) => {
                    // Lock contention; retry shortly with the same set.
                    if attempt + 1 < PROGRESS_RETRIES {
                        tokio::time::sleep(PROGRESS_RETRY_DELAY).await;
                    }
                }
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "Progress update failed");
                    return;
                }
            }
        }
        debug!(
            worker = %self.name,
            ids = processed_ids.len(),
            "Progress update skipped after contention; a later update will converge"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = WorkerPoolConfig::new("job-1");

        assert_eq!(config.job_id, "job-1");
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.reserve_timeout, Duration::from_secs(5));
        assert_eq!(config.redelivery_timeout, Duration::from_secs(1800));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_pool_config_builder() {
        let config = WorkerPoolConfig::new("job-2")
            .with_num_workers(8)
            .with_batch_size(10)
            .with_reserve_timeout(Duration::from_secs(2))
            .with_redelivery_timeout(Duration::from_secs(600))
            .with_shutdown_timeout(Duration::from_secs(30));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.reserve_timeout, Duration::from_secs(2));
        assert_eq!(config.redelivery_timeout, Duration::from_secs(600));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_shared_stats() {
        let stats = SharedPoolStats::new();
        stats.tasks_processed.fetch_add(7, Ordering::SeqCst);
        stats.tasks_failed.fetch_add(2, Ordering::SeqCst);
        stats.active_workers.fetch_add(1, Ordering::SeqCst);

        let snapshot = stats.to_pool_stats(4);
        assert_eq!(snapshot.num_workers, 4);
        assert_eq!(snapshot.tasks_processed, 7);
        assert_eq!(snapshot.tasks_failed, 2);
        assert_eq!(snapshot.active_workers, 1);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::AlreadyRunning;
        assert!(err.to_string().contains("already running"));

        let err = PoolError::ShutdownTimeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60"));

        let err = PoolError::from(BrokerError::NoOpenConnection);
        assert!(err.to_string().contains("No open"));
    }
}
