//! Task-executor collaborator boundary.
//!
//! The executor is the external system that actually runs image-processing
//! tasks. This crate only needs three things from it: the live state of a
//! task, the set of currently registered workers and the ability to submit
//! a job for execution. Raw status strings are mapped into
//! `ExecutorTaskState` inside the trait implementation, never downstream.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::status::ExecutorTaskState;

/// Errors that can occur while querying the executor.
///
/// During reconciliation these are logged and treated as "no information
/// this tick"; they never abort a sweep.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor could not be reached.
    #[error("Executor unavailable: {0}")]
    Unavailable(String),

    /// The executor answered with something we could not interpret.
    #[error("Invalid executor response: {0}")]
    InvalidResponse(String),
}

/// Contract for the external task executor.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Returns the live state of a task by its executor-assigned id.
    async fn task_state(&self, task_id: &str) -> Result<ExecutorTaskState, ExecutorError>;

    /// Lists the names of currently registered executor workers.
    async fn active_workers(&self) -> Result<Vec<String>, ExecutorError>;

    /// Enqueues a job for execution, returning the assigned task id.
    async fn submit(&self, job_id: Uuid) -> Result<String, ExecutorError>;
}

/// Cached worker-availability lookup.
///
/// One reconciliation sweep touches many jobs; the stuck-pending check
/// should not hit the executor once per job, so the worker count is cached
/// for a short window (60 seconds by default).
pub struct WorkerAvailabilityCache {
    ttl: Duration,
    state: tokio::sync::Mutex<Option<(Instant, usize)>>,
}

impl WorkerAvailabilityCache {
    /// Creates a cache with the default 60-second window.
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(60))
    }

    /// Creates a cache with a custom window.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the number of registered workers, refreshing the cache when
    /// it is older than the window. Returns `None` when the executor could
    /// not be queried and no fresh value is cached.
    pub async fn worker_count<E: TaskExecutor + ?Sized>(&self, executor: &E) -> Option<usize> {
        let mut state = self.state.lock().await;

        if let Some((fetched_at, count)) = *state {
            if fetched_at.elapsed() < self.ttl {
                return Some(count);
            }
        }

        match executor.active_workers().await {
            Ok(workers) => {
                let count = workers.len();
                *state = Some((Instant::now(), count));
                Some(count)
            }
            Err(e) => {
                warn!(error = %e, "Failed to list executor workers");
                None
            }
        }
    }
}

impl Default for WorkerAvailabilityCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        calls: AtomicUsize,
        workers: Vec<String>,
        fail: bool,
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn task_state(&self, _task_id: &str) -> Result<ExecutorTaskState, ExecutorError> {
            Ok(ExecutorTaskState::Unknown)
        }

        async fn active_workers(&self) -> Result<Vec<String>, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ExecutorError::Unavailable("down".to_string()))
            } else {
                Ok(self.workers.clone())
            }
        }

        async fn submit(&self, _job_id: Uuid) -> Result<String, ExecutorError> {
            Ok("task-1".to_string())
        }
    }

    #[tokio::test]
    async fn test_worker_count_is_cached() {
        let executor = CountingExecutor {
            calls: AtomicUsize::new(0),
            workers: vec!["w1".to_string(), "w2".to_string()],
            fail: false,
        };
        let cache = WorkerAvailabilityCache::with_ttl(Duration::from_secs(60));

        assert_eq!(cache.worker_count(&executor).await, Some(2));
        assert_eq!(cache.worker_count(&executor).await, Some(2));
        assert_eq!(cache.worker_count(&executor).await, Some(2));

        // Only the first lookup should have hit the executor.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_count_refreshes_after_ttl() {
        let executor = CountingExecutor {
            calls: AtomicUsize::new(0),
            workers: vec![],
            fail: false,
        };
        let cache = WorkerAvailabilityCache::with_ttl(Duration::from_millis(10));

        assert_eq!(cache.worker_count(&executor).await, Some(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.worker_count(&executor).await, Some(0));

        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_worker_count_error_yields_none() {
        let executor = CountingExecutor {
            calls: AtomicUsize::new(0),
            workers: vec![],
            fail: true,
        };
        let cache = WorkerAvailabilityCache::new();

        assert_eq!(cache.worker_count(&executor).await, None);
    }
}
