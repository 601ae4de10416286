//! Persisted job rows.
//!
//! The relational store is authoritative for business data elsewhere; this
//! crate reads and writes only the handful of fields the reconciliation
//! loop needs: status, the executor-assigned task id and three timestamps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::monitor::status::JobState;

/// Errors that can occur during job-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A row carried a status value outside the closed union.
    #[error("Invalid persisted status: {0}")]
    InvalidStatus(String),
}

/// The slice of a persisted job this crate operates on.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Job id.
    pub id: Uuid,
    /// Persisted status.
    pub status: JobState,
    /// Executor-assigned task id, set when the job is dispatched.
    pub task_id: Option<String>,
    /// When the job was scheduled onto the executor.
    pub scheduled_at: DateTime<Utc>,
    /// When the executor reported the job started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the monitor last evaluated this job.
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Creates a record in PENDING as the scheduler would persist it.
    pub fn scheduled(id: Uuid, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobState::Pending,
            task_id: None,
            scheduled_at,
            started_at: None,
            last_checked_at: None,
        }
    }
}

/// Contract for loading and saving the monitored job fields.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Returns every job whose status is not final, i.e. the set the
    /// reconciliation sweep must visit.
    async fn unfinished_jobs(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Persists the record's status and last-check timestamp.
    ///
    /// Only these two fields are written. `task_id` and `started_at` are
    /// owned by the dispatch path and may have been updated in the
    /// database since this record was loaded; writing them back here
    /// would overwrite a concurrent assignment with stale data.
    async fn save_status(&self, job: &JobRecord) -> Result<(), StoreError>;
}

/// PostgreSQL-backed job store.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Connects to the database and returns a new store.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, StoreError> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<JobState>()
            .map_err(|e| StoreError::InvalidStatus(e.to_string()))?;

        Ok(JobRecord {
            id: row.try_get("id")?,
            status,
            task_id: row.try_get("task_id")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            last_checked_at: row.try_get("last_checked_at")?,
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn unfinished_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, task_id, scheduled_at, started_at, last_checked_at
            FROM jobs
            WHERE status NOT IN ('SUCCESS', 'FAILURE', 'REVOKED')
            ORDER BY scheduled_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn save_status(&self, job: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                last_checked_at = $3
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.last_checked_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduled_record_shape() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let job = JobRecord::scheduled(id, now);

        assert_eq!(job.id, id);
        assert_eq!(job.status, JobState::Pending);
        assert!(job.task_id.is_none());
        assert!(job.started_at.is_none());
        assert!(job.last_checked_at.is_none());
        assert_eq!(job.scheduled_at, now);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = StoreError::InvalidStatus("SLEEPING".to_string());
        assert!(err.to_string().contains("SLEEPING"));
    }
}
