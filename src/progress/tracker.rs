//! Per-job pending-set tracking in the fast store.
//!
//! For every job (optionally per processing stage) the tracker keeps the
//! set of still-outstanding item ids and the original total, from which
//! remaining / processed / percentage are derived. Updates are best-effort:
//! a writer that loses the advisory lock simply skips its round, and
//! progress converges as long as some caller eventually reports every id.
//! Reads are always lock-free and may be slightly stale.
//!
//! # Key layout
//!
//! - `job:<id>:pending[:<stage>]`: set of outstanding ids, 7-day TTL
//! - `job:<id>:pending_total[:<stage>]`: original count, same TTL
//! - `job:<id>:lock[:<stage>]`: advisory lock token, short TTL

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::debug;

use super::lock::{AdvisoryLock, TryLock};

/// Errors that can occur during progress operations.
#[derive(Debug, Error)]
pub enum ProgressError {
    /// Failed to connect to the fast store.
    #[error("Progress store connection failed: {0}")]
    ConnectionFailed(String),

    /// A fast-store operation failed.
    #[error("Progress store operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Derived progress counts for one job stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskProgress {
    /// Number of items the stage was initialized with.
    pub total: u64,
    /// Items not yet reported processed.
    pub remaining: u64,
    /// Items reported processed.
    pub processed: u64,
    /// processed / total, in [0.0, 1.0]. A zero-item job is complete.
    pub percentage: f64,
}

impl TaskProgress {
    /// Derives progress from the stored total and the live pending count.
    ///
    /// `remaining` is clamped to `total` so a duplicate initialization can
    /// never produce a negative processed count.
    pub fn from_counts(total: u64, remaining: u64) -> Self {
        let remaining = remaining.min(total);
        let processed = total - remaining;
        let percentage = if total == 0 {
            1.0
        } else {
            processed as f64 / total as f64
        };
        Self {
            total,
            remaining,
            processed,
            percentage,
        }
    }

    /// Returns whether every item has been processed.
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Returns the pending-set key for a job stage.
pub fn pending_key(job_id: &str, stage: Option<&str>) -> String {
    match stage {
        Some(stage) => format!("job:{job_id}:pending:{stage}"),
        None => format!("job:{job_id}:pending"),
    }
}

/// Returns the total-count key for a job stage.
pub fn total_key(job_id: &str, stage: Option<&str>) -> String {
    match stage {
        Some(stage) => format!("job:{job_id}:pending_total:{stage}"),
        None => format!("job:{job_id}:pending_total"),
    }
}

/// Returns the advisory-lock key for a job stage.
pub fn lock_key(job_id: &str, stage: Option<&str>) -> String {
    match stage {
        Some(stage) => format!("job:{job_id}:lock:{stage}"),
        None => format!("job:{job_id}:lock"),
    }
}

/// Tracks outstanding work per job in the fast store.
///
/// Independent of the task queue: the tracker only ever sees identifiers,
/// never task payloads or broker handles.
#[derive(Clone)]
pub struct ProgressTracker {
    redis: ConnectionManager,
    lock: AdvisoryLock,
    pending_ttl: Duration,
}

impl ProgressTracker {
    /// Connects to the fast store and creates a tracker.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::ConnectionFailed` if the store is
    /// unreachable.
    pub async fn connect(
        redis_url: &str,
        pending_ttl: Duration,
        lock_ttl: Duration,
    ) -> Result<Self, ProgressError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ProgressError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| ProgressError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_connection(redis, pending_ttl, lock_ttl))
    }

    /// Creates a tracker from an existing connection manager.
    pub fn from_connection(
        redis: ConnectionManager,
        pending_ttl: Duration,
        lock_ttl: Duration,
    ) -> Self {
        let lock = AdvisoryLock::new(redis.clone(), lock_ttl);
        Self {
            redis,
            lock,
            pending_ttl,
        }
    }

    /// Stores the full id set and its count for a job stage.
    ///
    /// Re-initializing a stage resets it. Both keys carry the pending TTL
    /// so abandoned jobs expire instead of leaking storage.
    pub async fn initialize_job(
        &self,
        job_id: &str,
        item_ids: &[String],
        stage: Option<&str>,
    ) -> Result<(), ProgressError> {
        let pending = pending_key(job_id, stage);
        let total = total_key(job_id, stage);
        let ttl_secs = self.pending_ttl.as_secs();
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic().del(&pending).del(&total);
        if !item_ids.is_empty() {
            pipe.sadd(&pending, item_ids).ignore();
            pipe.expire(&pending, ttl_secs as i64).ignore();
        }
        pipe.cmd("SET")
            .arg(&total)
            .arg(item_ids.len())
            .arg("EX")
            .arg(ttl_secs)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(job_id, stage = stage.unwrap_or("default"), total = item_ids.len(), "Initialized job progress");
        Ok(())
    }

    /// Removes `processed_ids` from the pending set and returns the new
    /// progress.
    ///
    /// Returns `Ok(None)` without blocking when the advisory lock is held
    /// by someone else (the caller skips this round) or when the stage was
    /// never initialized or has expired. Submitting the same ids twice is
    /// idempotent; the second call removes nothing.
    pub async fn mark_processed(
        &self,
        job_id: &str,
        processed_ids: &[String],
        stage: Option<&str>,
    ) -> Result<Option<TaskProgress>, ProgressError> {
        let guard = match self.lock.try_acquire(&lock_key(job_id, stage)).await? {
            TryLock::Acquired(guard) => guard,
            TryLock::Busy => {
                debug!(job_id, stage = stage.unwrap_or("default"), "Progress lock busy, skipping update");
                return Ok(None);
            }
        };

        let result = self.remove_and_count(job_id, processed_ids, stage).await;

        // Release regardless of the mutation outcome; on failure the TTL
        // would reclaim the lock anyway, this just shortens the window.
        self.lock.release(guard).await?;

        result
    }

    /// Lock-free read of the current progress.
    ///
    /// Returns `None` for jobs that were never initialized or have been
    /// cleaned up. Never fails on missing keys; staleness under concurrent
    /// writers is acceptable.
    pub async fn get_progress(
        &self,
        job_id: &str,
        stage: Option<&str>,
    ) -> Result<Option<TaskProgress>, ProgressError> {
        let mut conn = self.redis.clone();

        let total: Option<u64> = conn.get(total_key(job_id, stage)).await?;
        let Some(total) = total else {
            return Ok(None);
        };

        let remaining: u64 = conn.scard(pending_key(job_id, stage)).await?;
        Ok(Some(TaskProgress::from_counts(total, remaining)))
    }

    /// Deletes every stored key for the job across all stages.
    pub async fn cleanup(&self, job_id: &str) -> Result<(), ProgressError> {
        let mut conn = self.redis.clone();
        let pattern = format!("job:{job_id}:*");

        let keys: Vec<String> = {
            let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        if !keys.is_empty() {
            let mut conn = self.redis.clone();
            conn.del::<_, i64>(&keys).await?;
            debug!(job_id, keys = keys.len(), "Cleaned up progress keys");
        }

        Ok(())
    }

    /// The locked section of `mark_processed`.
    async fn remove_and_count(
        &self,
        job_id: &str,
        processed_ids: &[String],
        stage: Option<&str>,
    ) -> Result<Option<TaskProgress>, ProgressError> {
        let mut conn = self.redis.clone();

        let total: Option<u64> = conn.get(total_key(job_id, stage)).await?;
        let Some(total) = total else {
            return Ok(None);
        };

        if !processed_ids.is_empty() {
            conn.srem::<_, _, i64>(pending_key(job_id, stage), processed_ids)
                .await?;
        }

        let remaining: u64 = conn.scard(pending_key(job_id, stage)).await?;
        Ok(Some(TaskProgress::from_counts(total, remaining)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout_without_stage() {
        assert_eq!(pending_key("j1", None), "job:j1:pending");
        assert_eq!(total_key("j1", None), "job:j1:pending_total");
        assert_eq!(lock_key("j1", None), "job:j1:lock");
    }

    #[test]
    fn test_key_layout_with_stage() {
        assert_eq!(
            pending_key("j1", Some("results-saved")),
            "job:j1:pending:results-saved"
        );
        assert_eq!(
            total_key("j1", Some("results-saved")),
            "job:j1:pending_total:results-saved"
        );
        assert_eq!(lock_key("j1", Some("results-saved")), "job:j1:lock:results-saved");
    }

    #[test]
    fn test_progress_counts_add_up() {
        let progress = TaskProgress::from_counts(100, 40);
        assert_eq!(progress.total, 100);
        assert_eq!(progress.remaining, 40);
        assert_eq!(progress.processed, 60);
        assert_eq!(progress.processed + progress.remaining, progress.total);
        assert!((progress.percentage - 0.6).abs() < f64::EPSILON);
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_progress_complete() {
        let progress = TaskProgress::from_counts(100, 0);
        assert_eq!(progress.processed, 100);
        assert!((progress.percentage - 1.0).abs() < f64::EPSILON);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_progress_empty_job_is_complete() {
        let progress = TaskProgress::from_counts(0, 0);
        assert_eq!(progress.processed, 0);
        assert!((progress.percentage - 1.0).abs() < f64::EPSILON);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_progress_clamps_excess_remaining() {
        // A pending set larger than the stored total (duplicate init race)
        // must not underflow the processed count.
        let progress = TaskProgress::from_counts(10, 15);
        assert_eq!(progress.remaining, 10);
        assert_eq!(progress.processed, 0);
        assert!((progress.percentage - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_percentage_bounds() {
        for (total, remaining) in [(0, 0), (1, 0), (1, 1), (100, 50), (100, 200)] {
            let progress = TaskProgress::from_counts(total, remaining);
            assert!(progress.percentage >= 0.0);
            assert!(progress.percentage <= 1.0);
            assert!(progress.processed <= progress.total);
        }
    }
}
