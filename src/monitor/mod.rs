//! Periodic reconciliation of persisted jobs against the executor.
//!
//! This module is independent of the task queue and the progress tracker;
//! it only consumes persisted job rows and the executor's live status API:
//!
//! - **JobState / ExecutorTaskState**: closed status unions, with raw
//!   executor strings mapped once at the boundary
//! - **TaskExecutor**: the external executor contract
//! - **JobStatusMonitor**: the five-scenario check evaluated per job
//! - **MonitorRunner**: the sweep that ticks every non-final job
//!
//! A job is never silently abandoned: it either reaches a terminal status
//! with a logged reason or remains subject to the next sweep.

pub mod check;
pub mod executor;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::storage::JobStore;

pub use check::JobStatusMonitor;
pub use executor::{ExecutorError, TaskExecutor, WorkerAvailabilityCache};
pub use status::{ExecutorTaskState, JobState};

/// Drives the reconciliation monitor on a fixed interval.
pub struct MonitorRunner<E: TaskExecutor, S: JobStore> {
    monitor: Arc<JobStatusMonitor<E, S>>,
    store: Arc<S>,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl<E: TaskExecutor + 'static, S: JobStore + 'static> MonitorRunner<E, S> {
    /// Creates a runner sweeping every `interval`.
    pub fn new(monitor: Arc<JobStatusMonitor<E, S>>, store: Arc<S>, interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            monitor,
            store,
            interval,
            shutdown_tx,
        }
    }

    /// Returns a handle that stops the run loop when triggered.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Runs sweeps until shut down. Each sweep visits every non-final job;
    /// one job's failure never aborts the rest of the sweep.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval_secs = self.interval.as_secs(), "Status monitor started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Status monitor stopped");
                    break;
                }
            }
        }
    }

    /// One reconciliation pass over all non-final jobs.
    pub async fn sweep(&self) {
        let jobs = match self.store.unfinished_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to load jobs for reconciliation sweep");
                return;
            }
        };

        let total = jobs.len();
        let mut changed = 0usize;

        for mut job in jobs {
            match self
                .monitor
                .check_job_status(&mut job, Utc::now(), false, true)
                .await
            {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Job check failed, continuing sweep");
                }
            }
        }

        debug!(jobs = total, changed, "Reconciliation sweep complete");
    }
}
