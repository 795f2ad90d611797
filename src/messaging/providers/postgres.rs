//! # PostgreSQL Queue Store
//!
//! Durable [`QueueStore`] backed by plain PostgreSQL tables.
//!
//! Lists and logs share `jobrelay_messages`; the fully qualified queue name
//! (which carries the delivery mode) keeps them apart. Consumer-group state
//! lives in `jobrelay_deliveries`: one row per (queue, group, message) once a
//! message has been handed to that group, holding the current owner, claim
//! time, delivery count and ack time. A message row is deleted once every
//! group registered on its queue has acknowledged it.
//!
//! Concurrent consumers are kept apart with `FOR UPDATE SKIP LOCKED` and
//! `ON CONFLICT DO NOTHING` on delivery rows, so a message is never handed
//! to two consumers of the same group by `read_group`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::messaging::errors::QueueError;
use crate::messaging::store::QueueStore;
use crate::messaging::types::{
    ClaimInfo, DeliveryMode, MessageId, QueueName, QueueStats, StoredMessage,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobrelay_queues (
    queue_name TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS jobrelay_messages (
    id BIGSERIAL PRIMARY KEY,
    queue_name TEXT NOT NULL,
    payload BYTEA NOT NULL,
    enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS jobrelay_messages_queue_idx
    ON jobrelay_messages (queue_name, id);

CREATE TABLE IF NOT EXISTS jobrelay_groups (
    queue_name TEXT NOT NULL,
    group_name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (queue_name, group_name)
);

CREATE TABLE IF NOT EXISTS jobrelay_deliveries (
    queue_name TEXT NOT NULL,
    group_name TEXT NOT NULL,
    message_id BIGINT NOT NULL REFERENCES jobrelay_messages (id) ON DELETE CASCADE,
    consumer TEXT NOT NULL,
    claimed_at TIMESTAMPTZ NOT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 1,
    acked_at TIMESTAMPTZ,
    PRIMARY KEY (queue_name, group_name, message_id)
);
CREATE INDEX IF NOT EXISTS jobrelay_deliveries_pending_idx
    ON jobrelay_deliveries (queue_name, group_name, claimed_at)
    WHERE acked_at IS NULL;

CREATE TABLE IF NOT EXISTS jobrelay_deferred (
    id BIGSERIAL PRIMARY KEY,
    queue_name TEXT NOT NULL,
    payload BYTEA NOT NULL,
    due_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS jobrelay_deferred_due_idx
    ON jobrelay_deferred (queue_name, due_at, id);
"#;

/// PostgreSQL-backed queue store
#[derive(Debug, Clone)]
pub struct PgQueueStore {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Connect and create the schema if missing
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Upper bound on how long an idle consumer sleeps between polls
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes (idempotent)
    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("✅ jobrelay queue schema ready");
        Ok(())
    }

    async fn insert_message(&self, queue: &QueueName, payload: Vec<u8>) -> Result<MessageId, QueueError> {
        let row = sqlx::query(
            "INSERT INTO jobrelay_messages (queue_name, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(queue.to_string())
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageId::from(row.try_get::<i64, _>("id")?))
    }

    async fn require_group(&self, queue: &QueueName, group: &str) -> Result<(), QueueError> {
        let exists = sqlx::query(
            "SELECT 1 FROM jobrelay_groups WHERE queue_name = $1 AND group_name = $2",
        )
        .bind(queue.to_string())
        .bind(group)
        .fetch_optional(&self.pool)
        .await?;
        match exists {
            Some(_) => Ok(()),
            None => Err(QueueError::group_not_found(queue.to_string(), group)),
        }
    }
}

fn plain_message(row: &PgRow) -> Result<StoredMessage, sqlx::Error> {
    Ok(StoredMessage {
        id: MessageId::from(row.try_get::<i64, _>("id")?),
        payload: row.try_get("payload")?,
        enqueued_at: row.try_get("enqueued_at")?,
        delivery_count: 1,
        claim: None,
    })
}

fn claimed_message(row: &PgRow) -> Result<StoredMessage, sqlx::Error> {
    let delivery_count: i32 = row.try_get("delivery_count")?;
    let claimed_at: DateTime<Utc> = row.try_get("claimed_at")?;
    Ok(StoredMessage {
        id: MessageId::from(row.try_get::<i64, _>("id")?),
        payload: row.try_get("payload")?,
        enqueued_at: row.try_get("enqueued_at")?,
        delivery_count: u32::try_from(delivery_count).unwrap_or(0),
        claim: Some(ClaimInfo {
            consumer: row.try_get("consumer")?,
            claimed_at,
        }),
    })
}

fn limit(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

#[async_trait]
impl QueueStore for PgQueueStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO jobrelay_queues (queue_name, mode) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(queue.to_string())
        .bind(queue.mode().as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_group(&self, queue: &QueueName, group: &str) -> Result<(), QueueError> {
        if queue.mode() != DeliveryMode::Stream {
            return Err(QueueError::unsupported("ensure_group", queue.mode().as_str()));
        }
        sqlx::query(
            "INSERT INTO jobrelay_groups (queue_name, group_name) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(queue.to_string())
        .bind(group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn push(&self, queue: &QueueName, payload: Vec<u8>) -> Result<MessageId, QueueError> {
        self.insert_message(queue, payload).await
    }

    async fn pop(&self, queue: &QueueName, count: usize) -> Result<Vec<StoredMessage>, QueueError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM jobrelay_messages
            WHERE id IN (
                SELECT id FROM jobrelay_messages
                WHERE queue_name = $1
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, enqueued_at
            "#,
        )
        .bind(queue.to_string())
        .bind(limit(count))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(plain_message)
            .collect::<Result<Vec<_>, _>>()?;
        messages.sort_by_key(|m| m.id.as_i64());
        Ok(messages)
    }

    async fn append(&self, queue: &QueueName, payload: Vec<u8>) -> Result<MessageId, QueueError> {
        self.insert_message(queue, payload).await
    }

    async fn read_group(
        &self,
        queue: &QueueName,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StoredMessage>, QueueError> {
        self.require_group(queue, group).await?;
        let rows = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT m.id FROM jobrelay_messages m
                WHERE m.queue_name = $1
                  AND NOT EXISTS (
                      SELECT 1 FROM jobrelay_deliveries d
                      WHERE d.queue_name = $1 AND d.group_name = $2 AND d.message_id = m.id
                  )
                ORDER BY m.id
                LIMIT $4
                FOR UPDATE OF m SKIP LOCKED
            ), delivered AS (
                INSERT INTO jobrelay_deliveries
                    (queue_name, group_name, message_id, consumer, claimed_at, delivery_count)
                SELECT $1, $2, id, $3, NOW(), 1 FROM candidates
                ON CONFLICT DO NOTHING
                RETURNING message_id, consumer, claimed_at, delivery_count
            )
            SELECT m.id, m.payload, m.enqueued_at, d.consumer, d.claimed_at, d.delivery_count
            FROM delivered d
            JOIN jobrelay_messages m ON m.id = d.message_id
            ORDER BY m.id
            "#,
        )
        .bind(queue.to_string())
        .bind(group)
        .bind(consumer)
        .bind(limit(count))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(claimed_message)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn ack(
        &self,
        queue: &QueueName,
        group: &str,
        id: &MessageId,
    ) -> Result<bool, QueueError> {
        let message_id = id
            .as_i64()
            .ok_or_else(|| QueueError::invalid_message_id(queue.to_string(), id.as_str()))?;
        let queue_name = queue.to_string();

        let mut tx = self.pool.begin().await?;
        let acked = sqlx::query(
            r#"
            UPDATE jobrelay_deliveries SET acked_at = NOW()
            WHERE queue_name = $1 AND group_name = $2 AND message_id = $3 AND acked_at IS NULL
            "#,
        )
        .bind(&queue_name)
        .bind(group)
        .bind(message_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if acked {
            // drop the message once no registered group still needs it
            sqlx::query(
                r#"
                DELETE FROM jobrelay_messages m
                WHERE m.id = $2
                  AND NOT EXISTS (
                      SELECT 1 FROM jobrelay_groups g
                      WHERE g.queue_name = $1
                        AND NOT EXISTS (
                            SELECT 1 FROM jobrelay_deliveries d
                            WHERE d.queue_name = g.queue_name
                              AND d.group_name = g.group_name
                              AND d.message_id = m.id
                              AND d.acked_at IS NOT NULL
                        )
                  )
                "#,
            )
            .bind(&queue_name)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(queue = %queue_name, group, message_id, acked, "ack");
        Ok(acked)
    }

    async fn claim_idle(
        &self,
        queue: &QueueName,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StoredMessage>, QueueError> {
        let rows = sqlx::query(
            r#"
            WITH idle AS (
                SELECT message_id FROM jobrelay_deliveries
                WHERE queue_name = $1 AND group_name = $2 AND acked_at IS NULL
                  AND claimed_at <= NOW() - make_interval(secs => $4)
                ORDER BY message_id
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobrelay_deliveries d
            SET consumer = $3, claimed_at = NOW(), delivery_count = d.delivery_count + 1
            FROM idle, jobrelay_messages m
            WHERE d.queue_name = $1 AND d.group_name = $2
              AND d.message_id = idle.message_id
              AND m.id = idle.message_id
            RETURNING m.id, m.payload, m.enqueued_at, d.consumer, d.claimed_at, d.delivery_count
            "#,
        )
        .bind(queue.to_string())
        .bind(group)
        .bind(consumer)
        .bind(min_idle.as_secs_f64())
        .bind(limit(count))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(claimed_message)
            .collect::<Result<Vec<_>, _>>()?;
        messages.sort_by_key(|m| m.id.as_i64());
        Ok(messages)
    }

    async fn stats(
        &self,
        queue: &QueueName,
        group: Option<&str>,
    ) -> Result<QueueStats, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM jobrelay_messages WHERE queue_name = $1) AS depth,
                (SELECT COUNT(*) FROM jobrelay_deliveries
                    WHERE queue_name = $1 AND acked_at IS NULL
                      AND ($2::TEXT IS NULL OR group_name = $2)) AS pending,
                (SELECT COUNT(*) FROM jobrelay_deferred WHERE queue_name = $1) AS deferred
            "#,
        )
        .bind(queue.to_string())
        .bind(group)
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<u64, sqlx::Error> {
            Ok(u64::try_from(row.try_get::<i64, _>(column)?).unwrap_or(0))
        };
        Ok(QueueStats {
            depth: count("depth")?,
            pending: count("pending")?,
            deferred: count("deferred")?,
        })
    }

    async fn defer(
        &self,
        queue: &QueueName,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO jobrelay_deferred (queue_name, payload, due_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            "#,
        )
        .bind(queue.to_string())
        .bind(payload)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn promote_due(&self, queue: &QueueName, limit_count: usize) -> Result<usize, QueueError> {
        let promoted = sqlx::query(
            r#"
            WITH due AS (
                DELETE FROM jobrelay_deferred
                WHERE id IN (
                    SELECT id FROM jobrelay_deferred
                    WHERE queue_name = $1 AND due_at <= NOW()
                    ORDER BY due_at, id
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, payload, due_at
            )
            INSERT INTO jobrelay_messages (queue_name, payload)
            SELECT $1, payload FROM due ORDER BY due_at, id
            "#,
        )
        .bind(queue.to_string())
        .bind(limit(limit_count))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(usize::try_from(promoted).unwrap_or(usize::MAX))
    }

    async fn peek(
        &self,
        queue: &QueueName,
        limit_count: usize,
    ) -> Result<Vec<StoredMessage>, QueueError> {
        let rows = sqlx::query(
            "SELECT id, payload, enqueued_at FROM jobrelay_messages WHERE queue_name = $1 ORDER BY id LIMIT $2",
        )
        .bind(queue.to_string())
        .bind(limit(limit_count))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(plain_message)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn wait_for_messages(&self, _queue: &QueueName, timeout: Duration) {
        tokio::time::sleep(timeout.min(self.poll_interval)).await;
    }
}
