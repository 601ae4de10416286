//! Job and executor status unions.
//!
//! The persisted job status is a closed enum with a fixed final subset.
//! Executor-reported states arrive as raw strings and are mapped into
//! `ExecutorTaskState` once, at the integration boundary; reconciliation
//! logic never pattern-matches on raw strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error for an unrecognized persisted status value.
#[derive(Debug, Error)]
#[error("Unknown job status '{0}'")]
pub struct UnknownStatus(pub String);

/// Persisted status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created but not yet scheduled onto the executor.
    Created,
    /// Scheduled, waiting for the executor to pick it up.
    Pending,
    /// Accepted by a worker but not yet running.
    Received,
    /// Running.
    Started,
    /// Being retried by the executor.
    Retry,
    /// Finished successfully. Final.
    Success,
    /// Failed. Final, but eligible for resurrection when the executor
    /// disagrees.
    Failure,
    /// Cancelled. Final.
    Revoked,
}

impl JobState {
    /// Returns whether this status permits no further transitions
    /// (resurrection aside).
    pub fn is_final(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Revoked)
    }

    /// Returns the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::Pending => "PENDING",
            JobState::Received => "RECEIVED",
            JobState::Started => "STARTED",
            JobState::Retry => "RETRY",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
            JobState::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(JobState::Created),
            "PENDING" => Ok(JobState::Pending),
            "RECEIVED" => Ok(JobState::Received),
            "STARTED" => Ok(JobState::Started),
            "RETRY" => Ok(JobState::Retry),
            "SUCCESS" => Ok(JobState::Success),
            "FAILURE" => Ok(JobState::Failure),
            "REVOKED" => Ok(JobState::Revoked),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Live task state as reported by the executor, after boundary mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorTaskState {
    /// The executor has no record of the task (or reports a state we do
    /// not recognize). Also what a lost task looks like.
    Unknown,
    /// Queued on the executor, not yet picked up.
    Pending,
    /// Accepted by an executor worker.
    Received,
    /// Running.
    Started,
    /// Being retried.
    Retry,
    /// Finished successfully.
    Success,
    /// Failed.
    Failure,
    /// Cancelled.
    Revoked,
}

impl ExecutorTaskState {
    /// Maps a raw executor status string into the closed union.
    /// Unrecognized values collapse to `Unknown`.
    pub fn from_raw(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "PENDING" => ExecutorTaskState::Pending,
            "RECEIVED" => ExecutorTaskState::Received,
            "STARTED" => ExecutorTaskState::Started,
            "RETRY" => ExecutorTaskState::Retry,
            "SUCCESS" => ExecutorTaskState::Success,
            "FAILURE" => ExecutorTaskState::Failure,
            "REVOKED" => ExecutorTaskState::Revoked,
            _ => ExecutorTaskState::Unknown,
        }
    }

    /// Returns whether this state is evidence the task is alive or done,
    /// i.e. grounds for resurrecting a prematurely failed job.
    pub fn contradicts_failure(&self) -> bool {
        matches!(
            self,
            ExecutorTaskState::Started
                | ExecutorTaskState::Received
                | ExecutorTaskState::Retry
                | ExecutorTaskState::Success
        )
    }

    /// Returns whether the executor effectively has no knowledge of a task
    /// that should be running. An executor answering PENDING for a task we
    /// believe STARTED has lost its state for it.
    pub fn indicates_lost_task(&self) -> bool {
        matches!(self, ExecutorTaskState::Unknown | ExecutorTaskState::Pending)
    }

    /// Returns the persisted status a resurrected job should take.
    pub fn as_job_state(&self) -> Option<JobState> {
        match self {
            ExecutorTaskState::Success => Some(JobState::Success),
            ExecutorTaskState::Started
            | ExecutorTaskState::Received
            | ExecutorTaskState::Retry => Some(JobState::Started),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_states() {
        assert!(JobState::Success.is_final());
        assert!(JobState::Failure.is_final());
        assert!(JobState::Revoked.is_final());

        assert!(!JobState::Created.is_final());
        assert!(!JobState::Pending.is_final());
        assert!(!JobState::Received.is_final());
        assert!(!JobState::Started.is_final());
        assert!(!JobState::Retry.is_final());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for state in [
            JobState::Created,
            JobState::Pending,
            JobState::Received,
            JobState::Started,
            JobState::Retry,
            JobState::Success,
            JobState::Failure,
            JobState::Revoked,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_status_is_error() {
        let err = "SLEEPING".parse::<JobState>().unwrap_err();
        assert!(err.to_string().contains("SLEEPING"));
    }

    #[test]
    fn test_raw_mapping_is_case_insensitive() {
        assert_eq!(ExecutorTaskState::from_raw("success"), ExecutorTaskState::Success);
        assert_eq!(ExecutorTaskState::from_raw("Started"), ExecutorTaskState::Started);
    }

    #[test]
    fn test_unrecognized_raw_collapses_to_unknown() {
        assert_eq!(ExecutorTaskState::from_raw("BANANA"), ExecutorTaskState::Unknown);
        assert_eq!(ExecutorTaskState::from_raw(""), ExecutorTaskState::Unknown);
    }

    #[test]
    fn test_contradicts_failure() {
        assert!(ExecutorTaskState::Started.contradicts_failure());
        assert!(ExecutorTaskState::Success.contradicts_failure());
        assert!(!ExecutorTaskState::Pending.contradicts_failure());
        assert!(!ExecutorTaskState::Unknown.contradicts_failure());
        assert!(!ExecutorTaskState::Failure.contradicts_failure());
    }

    #[test]
    fn test_indicates_lost_task() {
        assert!(ExecutorTaskState::Unknown.indicates_lost_task());
        assert!(ExecutorTaskState::Pending.indicates_lost_task());
        assert!(!ExecutorTaskState::Started.indicates_lost_task());
        assert!(!ExecutorTaskState::Success.indicates_lost_task());
    }

    #[test]
    fn test_resurrection_target_state() {
        assert_eq!(
            ExecutorTaskState::Success.as_job_state(),
            Some(JobState::Success)
        );
        assert_eq!(
            ExecutorTaskState::Started.as_job_state(),
            Some(JobState::Started)
        );
        assert_eq!(ExecutorTaskState::Unknown.as_job_state(), None);
        assert_eq!(ExecutorTaskState::Failure.as_job_state(), None);
    }
}
