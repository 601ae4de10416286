//! Job dispatch: publishing a job's task list and arming its progress.
//!
//! Dispatching a job is two steps in a fixed order: publish every task to
//! the job's stream, then initialize the progress tracker with the same id
//! set. Cancellation is the reverse: tear down the stream (reserved but
//! unacknowledged tasks die with it) and drop the progress keys.

use thiserror::Error;
use tracing::info;

use crate::broker::{BrokerError, TaskQueueCoordinator, TaskRecord};
use crate::progress::{ProgressError, ProgressTracker};

/// Errors that can occur while dispatching or cancelling a job.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Broker(#[from] BrokerError),

    /// Progress-store operation failed.
    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),

    /// A task manifest could not be parsed.
    #[error("Invalid task manifest: {0}")]
    InvalidManifest(#[from] serde_json::Error),
}

/// Parses a JSON manifest (an array of task records) into tasks.
pub fn tasks_from_manifest(manifest: &str) -> Result<Vec<TaskRecord>, DispatchError> {
    let tasks: Vec<TaskRecord> = serde_json::from_str(manifest)?;
    Ok(tasks)
}

/// Publishes jobs onto their queues and arms progress tracking.
pub struct JobDispatcher {
    coordinator: TaskQueueCoordinator,
    tracker: ProgressTracker,
}

impl JobDispatcher {
    /// Creates a dispatcher from its two collaborators.
    pub fn new(coordinator: TaskQueueCoordinator, tracker: ProgressTracker) -> Self {
        Self {
            coordinator,
            tracker,
        }
    }

    /// Publishes the job's task list and initializes its pending set.
    pub async fn dispatch(
        &self,
        job_id: &str,
        tasks: &[TaskRecord],
    ) -> Result<(), DispatchError> {
        self.coordinator.publish_tasks(job_id, tasks).await?;

        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        self.tracker.initialize_job(job_id, &ids, None).await?;

        info!(job_id, tasks = tasks.len(), "Job dispatched");
        Ok(())
    }

    /// Cancels a job by deleting its queue resources and progress keys.
    ///
    /// A worker mid-task is not interrupted; it finishes or fails that
    /// unit and its acknowledgment lands on a deleted stream.
    pub async fn cancel(&self, job_id: &str) -> Result<(), DispatchError> {
        self.coordinator.cleanup_job_resources(job_id).await?;
        self.tracker.cleanup(job_id).await?;

        info!(job_id, "Job cancelled and resources cleaned up");
        Ok(())
    }
}
