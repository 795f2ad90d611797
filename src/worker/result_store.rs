//! # Result Store
//!
//! Durable sink for handler results, keyed by `job_id`. Writes are upserts,
//! so persisting the same job twice leaves one record: this is what makes
//! redelivery after a crash between persist and ack harmless.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResultStoreError {
    #[error("Result store backend error: {0}")]
    Backend(String),

    #[cfg(feature = "postgres")]
    #[error("Result store database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub task_type: String,
    pub result: serde_json::Value,
    /// Attempt on which the job succeeded (0 = first try)
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    pub fn new(job_id: Uuid, task_type: impl Into<String>, result: serde_json::Value, attempts: u32) -> Self {
        Self {
            job_id,
            task_type: task_type.into(),
            result,
            attempts,
            completed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ResultStore: Send + Sync + Debug + 'static {
    /// Insert or replace the result for `record.job_id`
    async fn upsert(&self, record: &JobResult) -> Result<(), ResultStoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<JobResult>, ResultStoreError>;
}

/// Process-local result store
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    results: DashMap<Uuid, JobResult>,
    writes: AtomicU32,
    failures_to_inject: AtomicU32,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` upserts fail (for testing)
    pub fn fail_next_writes(&self, count: u32) {
        self.failures_to_inject.store(count, Ordering::SeqCst);
    }

    /// Successful upserts so far, including overwrites
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn upsert(&self, record: &JobResult) -> Result<(), ResultStoreError> {
        let injected = self
            .failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ResultStoreError::Backend("injected write failure".to_string()));
        }
        self.results.insert(record.job_id, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobResult>, ResultStoreError> {
        Ok(self.results.get(&job_id).map(|r| r.value().clone()))
    }
}

#[cfg(feature = "postgres")]
pub use postgres::PgResultStore;

#[cfg(feature = "postgres")]
mod postgres {
    use super::*;
    use sqlx::{PgPool, Row};

    const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobrelay_job_results (
    job_id       UUID PRIMARY KEY,
    task_type    TEXT NOT NULL,
    result       JSONB NOT NULL,
    attempts     INTEGER NOT NULL,
    completed_at TIMESTAMPTZ NOT NULL
);
"#;

    #[derive(Debug, Clone)]
    pub struct PgResultStore {
        pool: PgPool,
    }

    impl PgResultStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        pub async fn migrate(&self) -> Result<(), ResultStoreError> {
            sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
            Ok(())
        }
    }

    #[async_trait]
    impl ResultStore for PgResultStore {
        async fn upsert(&self, record: &JobResult) -> Result<(), ResultStoreError> {
            sqlx::query(
                "INSERT INTO jobrelay_job_results (job_id, task_type, result, attempts, completed_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (job_id) DO UPDATE
                 SET task_type = EXCLUDED.task_type,
                     result = EXCLUDED.result,
                     attempts = EXCLUDED.attempts,
                     completed_at = EXCLUDED.completed_at",
            )
            .bind(record.job_id)
            .bind(&record.task_type)
            .bind(&record.result)
            .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
            .bind(record.completed_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get(&self, job_id: Uuid) -> Result<Option<JobResult>, ResultStoreError> {
            let row = sqlx::query(
                "SELECT job_id, task_type, result, attempts, completed_at
                 FROM jobrelay_job_results WHERE job_id = $1",
            )
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

            row.map(|row| -> Result<JobResult, ResultStoreError> {
                let attempts: i32 = row.try_get("attempts")?;
                Ok(JobResult {
                    job_id: row.try_get("job_id")?,
                    task_type: row.try_get("task_type")?,
                    result: row.try_get("result")?,
                    attempts: u32::try_from(attempts).unwrap_or(0),
                    completed_at: row.try_get("completed_at")?,
                })
            })
            .transpose()
        }
    }
}
