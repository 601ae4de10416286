//! Per-job task queue coordination over broker streams.
//!
//! Each job owns one durable stream and one pull consumer group, both named
//! deterministically from the job id. Tasks are published to the stream,
//! reserved in bounded batches by workers and individually acknowledged.
//! Unacknowledged tasks become eligible for redelivery to another worker
//! once their pending idle time exceeds the configured redelivery timeout,
//! so delivery is at-least-once and downstream processing must tolerate
//! duplicates.
//!
//! # Naming convention
//!
//! - stream: `job_<id>`
//! - subject: `job.<id>.tasks` (carried on each message)
//! - consumer group: `job-<id>-consumer`

use std::sync::Arc;
use std::time::Duration;

use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::connection::{BrokerError, ConnectionProvider};

/// Message field holding the serialized task.
const PAYLOAD_FIELD: &str = "payload";

/// Message field holding the routing subject.
const SUBJECT_FIELD: &str = "subject";

/// Returns the stream name for a job.
pub fn stream_name(job_id: &str) -> String {
    format!("job_{job_id}")
}

/// Returns the routing subject for a job's tasks.
pub fn task_subject(job_id: &str) -> String {
    format!("job.{job_id}.tasks")
}

/// Returns the consumer-group name for a job.
pub fn consumer_group(job_id: &str) -> String {
    format!("job-{job_id}-consumer")
}

/// A unit of image-processing work traveling through the broker.
///
/// The coordinator never opens the payload beyond (de)serialization; all
/// fields besides `id` exist for the worker's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    /// Stable identifier, also reported to the progress tracker.
    pub id: String,
    /// Reference to the image this task processes.
    pub image_url: String,
    /// Opaque extra fields for the worker.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl TaskRecord {
    /// Creates a task for the given id and image reference.
    pub fn new(id: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image_url: image_url.into(),
            metadata: None,
        }
    }

    /// Attaches opaque metadata for the worker.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Opaque acknowledgment handle for a reserved task.
///
/// Valid only until the redelivery timeout elapses; after that the broker
/// may hand the same task to another worker and this handle's ack becomes
/// a no-op.
#[derive(Debug, Clone)]
pub struct AckHandle {
    stream: String,
    group: String,
    entry_id: String,
}

impl AckHandle {
    /// Returns the broker entry id this handle acknowledges.
    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }
}

/// A task together with its acknowledgment handle.
#[derive(Debug, Clone)]
pub struct ReservedTask {
    /// The task payload.
    pub task: TaskRecord,
    /// Handle used to acknowledge the task after durable processing.
    pub ack: AckHandle,
}

/// Creates/destroys per-job queue resources and moves tasks through them.
///
/// One coordinator per concurrency context; the consumer name identifies
/// this context to the broker so concurrent reservations receive disjoint
/// batches.
pub struct TaskQueueCoordinator {
    provider: Arc<ConnectionProvider>,
    consumer_name: String,
    redelivery_timeout: Duration,
}

impl TaskQueueCoordinator {
    /// Creates a coordinator bound to a connection provider.
    ///
    /// `consumer_name` must be unique per concurrency context (e.g.
    /// "worker-3"). `redelivery_timeout` must exceed the worst-case task
    /// processing time, otherwise in-flight tasks are redelivered while
    /// still being worked on.
    pub fn new(
        provider: Arc<ConnectionProvider>,
        consumer_name: impl Into<String>,
        redelivery_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            consumer_name: consumer_name.into(),
            redelivery_timeout,
        }
    }

    /// Opens the broker connection. Must be called before any queue
    /// operation; operations on an unconnected coordinator fail with
    /// `BrokerError::NoOpenConnection` rather than silently no-op.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.provider.get_connection().await?;
        Ok(())
    }

    /// Publishes a task to the job's stream, creating the stream and its
    /// consumer group on first use. Repeated creation is idempotent.
    pub async fn publish_task(&self, job_id: &str, task: &TaskRecord) -> Result<(), BrokerError> {
        let mut conn = self.provider.current().await?;
        self.ensure_stream(&mut conn, job_id).await?;

        let payload = serde_json::to_string(task)?;
        redis::cmd("XADD")
            .arg(stream_name(job_id))
            .arg("*")
            .arg(SUBJECT_FIELD)
            .arg(task_subject(job_id))
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async::<_, String>(&mut conn)
            .await?;

        Ok(())
    }

    /// Publishes a batch of tasks in a single pipelined round trip.
    pub async fn publish_tasks(
        &self,
        job_id: &str,
        tasks: &[TaskRecord],
    ) -> Result<(), BrokerError> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut conn = self.provider.current().await?;
        self.ensure_stream(&mut conn, job_id).await?;

        let stream = stream_name(job_id);
        let subject = task_subject(job_id);
        let mut pipe = redis::pipe();
        for task in tasks {
            let payload = serde_json::to_string(task)?;
            pipe.cmd("XADD")
                .arg(&stream)
                .arg("*")
                .arg(SUBJECT_FIELD)
                .arg(&subject)
                .arg(PAYLOAD_FIELD)
                .arg(payload)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(job_id, count = tasks.len(), "Published task batch");
        Ok(())
    }

    /// Reserves up to `count` tasks for this consumer.
    ///
    /// Tasks whose previous reservation has sat unacknowledged longer than
    /// the redelivery timeout are reclaimed first; the remainder of the
    /// batch comes from never-delivered messages, blocking up to `timeout`.
    /// An empty result after the timeout is a normal outcome, not an error.
    ///
    /// Reservation never creates queue resources: the stream and group
    /// exist only between the first publish and cleanup. Reserving against
    /// a cleaned-up (or never-published) job yields an empty batch.
    pub async fn reserve_tasks(
        &self,
        job_id: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<ReservedTask>, BrokerError> {
        let mut conn = self.provider.current().await?;

        let stream = stream_name(job_id);
        let group = consumer_group(job_id);
        let mut reserved = Vec::with_capacity(count);

        // Redelivery path: claim entries another worker reserved but never
        // acknowledged within the redelivery timeout.
        let stale = match self
            .claim_stale_entries(&mut conn, &stream, &group, count)
            .await
        {
            Ok(stale) => stale,
            Err(BrokerError::Redis(e)) if is_missing_group(&e) => {
                // No stream or group for this job. Wait out the timeout so
                // a still-polling worker keeps its cadence instead of
                // spinning.
                tokio::time::sleep(timeout).await;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        for entry in stale {
            match task_from_entry(&stream, &group, &entry) {
                Ok(task) => reserved.push(task),
                Err(e) => warn!(job_id, entry_id = %entry.id, error = %e, "Skipping undecodable redelivered entry"),
            }
        }

        let remaining = count.saturating_sub(reserved.len());
        if remaining == 0 {
            return Ok(reserved);
        }

        // Fresh deliveries; blocks up to the timeout, then returns whatever
        // arrived (possibly nothing).
        let opts = StreamReadOptions::default()
            .group(&group, &self.consumer_name)
            .count(remaining)
            .block(timeout.as_millis() as usize);

        let reply: StreamReadReply = match conn.xread_options(&[&stream], &[">"], &opts).await {
            Ok(reply) => reply,
            // The group was destroyed by a concurrent cleanup; the tasks
            // that were still reserved died with the stream.
            Err(e) if is_missing_group(&e) => return Ok(reserved),
            Err(e) => return Err(e.into()),
        };

        for key in reply.keys {
            for entry in &key.ids {
                match task_from_entry(&stream, &group, entry) {
                    Ok(task) => reserved.push(task),
                    Err(e) => warn!(job_id, entry_id = %entry.id, error = %e, "Skipping undecodable entry"),
                }
            }
        }

        Ok(reserved)
    }

    /// Acknowledges a completed task, returning whether the broker accepted
    /// the acknowledgment. `false` means the entry was already acknowledged
    /// or its stream is gone.
    pub async fn acknowledge_task(&self, handle: &AckHandle) -> Result<bool, BrokerError> {
        let mut conn = self.provider.current().await?;
        let acked: i64 = conn
            .xack(&handle.stream, &handle.group, &[&handle.entry_id])
            .await?;
        Ok(acked > 0)
    }

    /// Deletes the job's consumer group and stream.
    ///
    /// Idempotent: resources already deleted (or never created) count as
    /// success, so cleanup can be retried freely.
    pub async fn cleanup_job_resources(&self, job_id: &str) -> Result<bool, BrokerError> {
        let mut conn = self.provider.current().await?;

        let destroy = redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(stream_name(job_id))
            .arg(consumer_group(job_id))
            .query_async::<_, i64>(&mut conn)
            .await;

        match destroy {
            Ok(_) => {}
            Err(e) if is_missing_group(&e) => {
                debug!(job_id, "Consumer group already deleted");
            }
            Err(e) => return Err(e.into()),
        }

        self.delete_stream(job_id).await?;
        Ok(true)
    }

    /// Deletes the job's stream. Reserved-but-unacknowledged tasks die with
    /// it and are never redelivered; this is how cancellation is realized.
    pub async fn delete_stream(&self, job_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.provider.current().await?;
        conn.del::<_, i64>(stream_name(job_id)).await?;
        Ok(())
    }

    /// Creates the stream and consumer group if absent. BUSYGROUP from a
    /// concurrent or earlier creation is success.
    async fn ensure_stream(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job_id: &str,
    ) -> Result<(), BrokerError> {
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_name(job_id))
            .arg(consumer_group(job_id))
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<_, String>(conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Claims up to `count` pending entries whose idle time exceeds the
    /// redelivery timeout.
    async fn claim_stale_entries(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<StreamId>, BrokerError> {
        let min_idle_ms = self.redelivery_timeout.as_millis() as usize;

        let pending: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", count).await?;

        let stale_ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();

        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, &self.consumer_name, min_idle_ms, &stale_ids)
            .await?;

        if !claimed.ids.is_empty() {
            warn!(
                stream,
                count = claimed.ids.len(),
                "Reclaimed unacknowledged tasks past redelivery timeout"
            );
        }

        Ok(claimed.ids)
    }
}

/// Decodes a stream entry into a reserved task.
fn task_from_entry(stream: &str, group: &str, entry: &StreamId) -> Result<ReservedTask, BrokerError> {
    let payload: String = entry
        .map
        .get(PAYLOAD_FIELD)
        .and_then(|v| redis::from_redis_value(v).ok())
        .ok_or_else(|| {
            BrokerError::ConnectionFailed(format!("entry {} missing payload field", entry.id))
        })?;

    let task: TaskRecord = serde_json::from_str(&payload)?;

    Ok(ReservedTask {
        task,
        ack: AckHandle {
            stream: stream.to_string(),
            group: group.to_string(),
            entry_id: entry.id.clone(),
        },
    })
}

/// Returns whether an error indicates the consumer group or stream is
/// already gone.
fn is_missing_group(e: &redis::RedisError) -> bool {
    e.code() == Some("NOGROUP")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_naming_is_deterministic_and_distinct() {
        let id = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
        assert_eq!(stream_name(id), format!("job_{id}"));
        assert_eq!(task_subject(id), format!("job.{id}.tasks"));
        assert_eq!(consumer_group(id), format!("job-{id}-consumer"));

        // Different jobs never collide.
        assert_ne!(stream_name("a"), stream_name("b"));
        assert_ne!(consumer_group("a"), consumer_group("b"));
    }

    #[test]
    fn test_task_record_serialization() {
        let task = TaskRecord::new("img-001", "s3://bucket/images/001.jpg")
            .with_metadata(serde_json::json!({ "deployment": "station-4" }));

        let json = serde_json::to_string(&task).expect("serialization should work");
        let parsed: TaskRecord = serde_json::from_str(&json).expect("deserialization should work");

        assert_eq!(parsed, task);
    }

    #[test]
    fn test_task_record_metadata_optional() {
        let parsed: TaskRecord =
            serde_json::from_str(r#"{"id":"img-1","image_url":"file:///img.jpg"}"#)
                .expect("metadata should default");
        assert!(parsed.metadata.is_none());
    }

    #[test]
    fn test_task_from_entry_decodes_payload() {
        let task = TaskRecord::new("img-1", "file:///img.jpg");
        let payload = serde_json::to_string(&task).unwrap();

        let mut map = HashMap::new();
        map.insert(
            PAYLOAD_FIELD.to_string(),
            redis::Value::Data(payload.into_bytes()),
        );
        let entry = StreamId {
            id: "1700000000000-0".to_string(),
            map,
        };

        let reserved = task_from_entry("job_j1", "job-j1-consumer", &entry)
            .expect("entry should decode");
        assert_eq!(reserved.task, task);
        assert_eq!(reserved.ack.entry_id(), "1700000000000-0");
    }

    #[test]
    fn test_task_from_entry_missing_payload_is_error() {
        let entry = StreamId {
            id: "1-0".to_string(),
            map: HashMap::new(),
        };
        assert!(task_from_entry("job_j1", "job-j1-consumer", &entry).is_err());
    }

    #[tokio::test]
    async fn test_operations_require_open_connection() {
        let provider = Arc::new(ConnectionProvider::new("redis://localhost:6379"));
        let coordinator =
            TaskQueueCoordinator::new(provider, "worker-test", Duration::from_secs(1800));

        let task = TaskRecord::new("img-1", "file:///img.jpg");
        let err = coordinator.publish_task("j1", &task).await.unwrap_err();
        assert!(matches!(err, BrokerError::NoOpenConnection));

        let err = coordinator
            .reserve_tasks("j1", 5, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NoOpenConnection));

        let err = coordinator.cleanup_job_resources("j1").await.unwrap_err();
        assert!(matches!(err, BrokerError::NoOpenConnection));

        let err = coordinator.delete_stream("j1").await.unwrap_err();
        assert!(matches!(err, BrokerError::NoOpenConnection));
    }
}
