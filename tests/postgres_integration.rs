//! Integration tests for the Postgres job store.
//!
//! These tests require a live PostgreSQL instance.
//! Run with: DATABASE_URL=postgres://localhost/trapline_test cargo test --test postgres_integration -- --ignored

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use trapline::monitor::JobState;
use trapline::storage::{JobRecord, JobStore, PgJobStore};
use uuid::Uuid;

fn database_url() -> String {
    std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/trapline_test".to_string())
}

async fn pool() -> PgPool {
    let pool = PgPool::connect(&database_url())
        .await
        .expect("Postgres must be reachable");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            status TEXT NOT NULL,
            task_id TEXT,
            scheduled_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            last_checked_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("schema setup should work");
    pool
}

async fn insert(pool: &PgPool, job: &JobRecord) {
    sqlx::query(
        r#"
        INSERT INTO jobs (id, status, task_id, scheduled_at, started_at, last_checked_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(job.id)
    .bind(job.status.as_str())
    .bind(&job.task_id)
    .bind(job.scheduled_at)
    .bind(job.started_at)
    .bind(job.last_checked_at)
    .execute(pool)
    .await
    .expect("insert should work");
}

async fn fetch_task_id(pool: &PgPool, id: Uuid) -> Option<String> {
    sqlx::query_scalar("SELECT task_id FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("select should work")
}

#[tokio::test]
#[ignore]
async fn test_unfinished_jobs_excludes_final_statuses() {
    let pool = pool().await;
    let store = PgJobStore::from_pool(pool.clone());
    let now = Utc::now();

    let pending = JobRecord::scheduled(Uuid::new_v4(), now);
    let mut done = JobRecord::scheduled(Uuid::new_v4(), now);
    done.status = JobState::Success;
    insert(&pool, &pending).await;
    insert(&pool, &done).await;

    let jobs = store.unfinished_jobs().await.expect("query should work");
    let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();

    assert!(ids.contains(&pending.id));
    assert!(!ids.contains(&done.id));
}

#[tokio::test]
#[ignore]
async fn test_save_status_preserves_concurrent_task_id_assignment() {
    let pool = pool().await;
    let store = PgJobStore::from_pool(pool.clone());
    let now = Utc::now();

    let id = Uuid::new_v4();
    insert(&pool, &JobRecord::scheduled(id, now - ChronoDuration::minutes(5))).await;

    // Load the row as the sweep would, while task_id is still NULL.
    let jobs = store.unfinished_jobs().await.expect("query should work");
    let mut loaded = jobs
        .into_iter()
        .find(|j| j.id == id)
        .expect("row should be visible");
    assert!(loaded.task_id.is_none());

    // The dispatch path assigns a task id behind the sweep's back.
    sqlx::query("UPDATE jobs SET task_id = $2 WHERE id = $1")
        .bind(id)
        .bind("task-42")
        .execute(&pool)
        .await
        .expect("update should work");

    // Saving the stale in-memory record must not erase the assignment.
    loaded.last_checked_at = Some(now);
    store.save_status(&loaded).await.expect("save should work");

    assert_eq!(fetch_task_id(&pool, id).await, Some("task-42".to_string()));
}

#[tokio::test]
#[ignore]
async fn test_save_status_persists_status_change() {
    let pool = pool().await;
    let store = PgJobStore::from_pool(pool.clone());
    let now = Utc::now();

    let id = Uuid::new_v4();
    insert(&pool, &JobRecord::scheduled(id, now)).await;

    let mut job = JobRecord::scheduled(id, now);
    job.status = JobState::Failure;
    job.last_checked_at = Some(now);
    store.save_status(&job).await.expect("save should work");

    let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_one(&pool)
        .await
        .expect("select should work");
    assert_eq!(status, "FAILURE");
}
