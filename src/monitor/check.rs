//! Reconciliation of persisted job status against executor reality.
//!
//! `check_job_status` is evaluated once per job per scheduler tick and
//! corrects the persisted status when it disagrees with what the executor
//! observably knows. It handles workers and brokers that disappear, stall
//! or lose state mid-run:
//!
//! 1. recency guard (2 minutes, unless forced)
//! 2. already-final stop (FAILURE stays eligible for resurrection)
//! 3. max runtime exceeded (needs no executor query, checked first)
//! 4. PENDING with no task id past its timeout
//! 5. STARTED but the executor has no live record of the task
//! 6. resurrection: persisted FAILURE contradicted by the executor
//! 7. stuck PENDING with no registered workers (warning only)
//!
//! Executor query failures are logged and treated as "no information this
//! tick"; a job is never failed on the strength of a failed query.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::config::JobThresholds;
use crate::storage::{JobRecord, JobStore, StoreError};

use super::executor::{TaskExecutor, WorkerAvailabilityCache};
use super::status::{ExecutorTaskState, JobState};

/// Minimum time between full checks of the same job.
const RECENCY_GUARD_SECONDS: i64 = 120;

/// What one evaluation decided about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    /// Nothing to correct.
    NoChange,
    /// Force the job to FAILURE for the given reason.
    Fail(&'static str),
    /// Revert a premature FAILURE to match the executor.
    Resurrect(JobState),
    /// The job has sat PENDING suspiciously long; worth checking whether
    /// any workers exist at all.
    StuckPending,
}

/// Pure evaluation of one job against the clock and the executor's answer.
///
/// Separated from I/O so the whole state machine is testable without a
/// scheduler, broker or executor.
fn evaluate(
    job: &JobRecord,
    now: DateTime<Utc>,
    executor_state: Option<ExecutorTaskState>,
    thresholds: &JobThresholds,
) -> Verdict {
    let max_runtime = ChronoDuration::from_std(thresholds.max_job_runtime).unwrap_or_else(|_| ChronoDuration::max_value());
    let no_task_id = ChronoDuration::from_std(thresholds.no_task_id_timeout).unwrap_or_else(|_| ChronoDuration::max_value());
    let disappeared = ChronoDuration::from_std(thresholds.disappeared_task_retry_threshold)
        .unwrap_or_else(|_| ChronoDuration::max_value());
    let stuck_pending = ChronoDuration::from_std(thresholds.stuck_pending_timeout)
        .unwrap_or_else(|_| ChronoDuration::max_value());

    match job.status {
        JobState::Success | JobState::Revoked => Verdict::NoChange,

        JobState::Failure => match executor_state {
            Some(state) if state.contradicts_failure() => match state.as_job_state() {
                Some(target) => Verdict::Resurrect(target),
                None => Verdict::NoChange,
            },
            _ => Verdict::NoChange,
        },

        JobState::Started => {
            let running_since = job.started_at.unwrap_or(job.scheduled_at);
            if now - running_since > max_runtime {
                return Verdict::Fail("max runtime exceeded");
            }
            match executor_state {
                Some(state) if state.indicates_lost_task() && now - running_since > disappeared => {
                    Verdict::Fail("executor has no record of the task")
                }
                _ => Verdict::NoChange,
            }
        }

        JobState::Pending => {
            if job.task_id.is_none() && now - job.scheduled_at > no_task_id {
                return Verdict::Fail("no task id assigned within timeout");
            }
            if now - job.scheduled_at > stuck_pending {
                return Verdict::StuckPending;
            }
            Verdict::NoChange
        }

        JobState::Created | JobState::Received | JobState::Retry => Verdict::NoChange,
    }
}

/// Runs the reconciliation state machine over persisted jobs.
pub struct JobStatusMonitor<E: TaskExecutor, S: JobStore> {
    executor: Arc<E>,
    store: Arc<S>,
    thresholds: JobThresholds,
    worker_cache: WorkerAvailabilityCache,
}

impl<E: TaskExecutor, S: JobStore> JobStatusMonitor<E, S> {
    /// Creates a monitor with the given collaborators and thresholds.
    pub fn new(executor: Arc<E>, store: Arc<S>, thresholds: JobThresholds) -> Self {
        Self {
            executor,
            store,
            thresholds,
            worker_cache: WorkerAvailabilityCache::new(),
        }
    }

    /// Evaluates one job, mutating it in place and returning whether its
    /// status changed.
    ///
    /// `force` bypasses the recency guard. `save` persists the record
    /// (including `last_checked_at`, which is stamped regardless of
    /// whether the status changed).
    pub async fn check_job_status(
        &self,
        job: &mut JobRecord,
        now: DateTime<Utc>,
        force: bool,
        save: bool,
    ) -> Result<bool, StoreError> {
        // Recency guard: stamp only, skip the full check.
        if !force {
            if let Some(last) = job.last_checked_at {
                if now - last < ChronoDuration::seconds(RECENCY_GUARD_SECONDS) {
                    debug!(job_id = %job.id, "Job checked recently, skipping");
                    job.last_checked_at = Some(now);
                    if save {
                        self.store.save_status(job).await?;
                    }
                    return Ok(false);
                }
            }
        }

        // Scenarios that need no executor query (max runtime, missing task
        // id, stuck pending) are decided first; only an inconclusive pass
        // pays for a live status lookup.
        let mut verdict = evaluate(job, now, None, &self.thresholds);
        if verdict == Verdict::NoChange {
            if let Some(state) = self.query_executor(job).await {
                verdict = evaluate(job, now, Some(state), &self.thresholds);
            }
        }

        let changed = match verdict {
            Verdict::NoChange => false,
            Verdict::Fail(reason) => {
                warn!(
                    job_id = %job.id,
                    old_status = %job.status,
                    reason,
                    "Forcing job to FAILURE"
                );
                job.status = JobState::Failure;
                true
            }
            Verdict::Resurrect(target) => {
                info!(
                    job_id = %job.id,
                    new_status = %target,
                    "Executor contradicts persisted FAILURE, resurrecting job"
                );
                job.status = target;
                true
            }
            Verdict::StuckPending => {
                if self.worker_cache.worker_count(self.executor.as_ref()).await == Some(0) {
                    warn!(
                        job_id = %job.id,
                        scheduled_at = %job.scheduled_at,
                        "Job pending past threshold and no workers are registered"
                    );
                }
                // Possibly just queued behind other jobs; never failed here.
                false
            }
        };

        job.last_checked_at = Some(now);
        if save {
            self.store.save_status(job).await?;
        }

        Ok(changed)
    }

    /// Queries the executor for the job's task state when that state can
    /// influence the verdict. Errors degrade to `None`.
    async fn query_executor(&self, job: &JobRecord) -> Option<ExecutorTaskState> {
        let task_id = job.task_id.as_deref()?;
        if !matches!(job.status, JobState::Started | JobState::Failure) {
            return None;
        }

        match self.executor.task_state(task_id).await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(job_id = %job.id, task_id, error = %e, "Executor query failed, no information this tick");
                None
            }
        }
    }
}
