//! # Dead-Letter Router
//!
//! Moves permanently failed work to the queue's companion dead-letter log,
//! then acknowledges the original. The write is retried with its own bounded
//! backoff; if the destination stays unreachable the router escalates with
//! an alert and leaves the original unacknowledged so nothing is dropped.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::DeadLetterConfig;
use crate::error::EngineError;
use crate::messaging::{JobEnvelope, JobQueue, MessageId, QueueError, QueueName, QueueStore};
use crate::metrics::jobs as job_metrics;

use super::entry::{DeadLetterEntry, FailureReason};

#[derive(Debug, Clone)]
pub struct DeadLetterRouter {
    config: DeadLetterConfig,
}

impl Default for DeadLetterRouter {
    fn default() -> Self {
        Self::new(DeadLetterConfig::default())
    }
}

impl DeadLetterRouter {
    pub fn new(config: DeadLetterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Dead-letter a decoded envelope and ack its delivery
    pub async fn route(
        &self,
        queue: &JobQueue,
        message_id: &MessageId,
        envelope: JobEnvelope,
        reason: FailureReason,
        last_error: &str,
    ) -> Result<(), EngineError> {
        let entry =
            DeadLetterEntry::for_envelope(envelope, reason, last_error, self.config.last_error_max_len);
        self.deliver(queue, message_id, entry).await
    }

    /// Dead-letter bytes that never decoded into an envelope
    pub async fn route_raw(
        &self,
        queue: &JobQueue,
        message_id: &MessageId,
        payload: &[u8],
        last_error: &str,
    ) -> Result<(), EngineError> {
        let entry =
            DeadLetterEntry::for_raw_payload(payload, last_error, self.config.last_error_max_len);
        self.deliver(queue, message_id, entry).await
    }

    async fn deliver(
        &self,
        queue: &JobQueue,
        message_id: &MessageId,
        entry: DeadLetterEntry,
    ) -> Result<(), EngineError> {
        let destination = queue.dead_letter_name();
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| QueueError::encoding(format!("dead-letter entry: {e}")))?;

        let dlq_id = self
            .write_with_retry(queue.store().as_ref(), &destination, bytes, &entry)
            .await?;

        job_metrics::record_dead_letter(entry.task_type(), entry.failure_reason.as_str());
        info!(
            job_id = ?entry.job_id(),
            task_type = %entry.task_type(),
            reason = %entry.failure_reason,
            last_error = %entry.last_error,
            destination = %destination,
            dlq_id = %dlq_id,
            "☠️ Job dead-lettered"
        );

        queue.ack(message_id).await?;
        Ok(())
    }

    async fn write_with_retry(
        &self,
        store: &dyn QueueStore,
        destination: &QueueName,
        bytes: Vec<u8>,
        entry: &DeadLetterEntry,
    ) -> Result<MessageId, EngineError> {
        let attempts = self.config.write_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match store.append(destination, bytes.clone()).await {
                Ok(id) => return Ok(id),
                Err(e) if attempt >= attempts => {
                    error!(
                        alert = true,
                        job_id = ?entry.job_id(),
                        destination = %destination,
                        attempts = attempt,
                        error = %e,
                        "🚨 Dead-letter destination unreachable; original message left unacknowledged"
                    );
                    return Err(EngineError::DeadLetterUnavailable {
                        queue: destination.to_string(),
                        job_id: entry.job_id(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = self.write_delay(attempt);
                    warn!(
                        job_id = ?entry.job_id(),
                        destination = %destination,
                        attempt = attempt,
                        max_attempts = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Dead-letter write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn write_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.config
            .write_base_delay()
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.config.write_max_delay())
    }

    /// Oldest entries of a queue's dead-letter log, for operator inspection
    ///
    /// Entries that fail to parse are skipped with a warning.
    pub async fn list(&self, queue: &JobQueue, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let destination = queue.dead_letter_name();
        let messages = queue.store().peek(&destination, limit).await?;
        Ok(messages
            .into_iter()
            .filter_map(|m| match serde_json::from_slice::<DeadLetterEntry>(&m.payload) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(destination = %destination, id = %m.id, error = %e, "Unreadable dead-letter entry");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{DeliveryMode, InMemoryQueueStore, JobMeta, TaskType};
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Arc<InMemoryQueueStore>, JobQueue) {
        let store = Arc::new(InMemoryQueueStore::new());
        let queue = JobQueue::durable(
            QueueName::new("ns", "test", DeliveryMode::Stream, "jobs.browser"),
            "browser-workers",
            store.clone(),
        );
        (store, queue)
    }

    fn fast_router(write_attempts: u32) -> DeadLetterRouter {
        DeadLetterRouter::new(DeadLetterConfig {
            write_attempts,
            write_base_delay_ms: 10,
            write_max_delay_ms: 40,
            ..DeadLetterConfig::default()
        })
    }

    async fn claimed(queue: &JobQueue) -> (MessageId, JobEnvelope) {
        let envelope = JobEnvelope::new(TaskType::Browser, json!({"n": 1}), 3, JobMeta::new("test"));
        queue.enqueue(serde_json::to_vec(&envelope).unwrap()).await.unwrap();
        let batch = queue.claim("c1", 1, Duration::ZERO).await.unwrap();
        (batch[0].id.clone(), envelope)
    }

    #[tokio::test]
    async fn test_route_writes_entry_and_acks() {
        let (store, queue) = setup();
        queue.ensure().await.unwrap();
        let (id, envelope) = claimed(&queue).await;
        let job_id = envelope.job_id;

        let router = fast_router(3);
        router
            .route(&queue, &id, envelope, FailureReason::FeatureDisabled, "task disabled")
            .await
            .unwrap();

        assert_eq!(queue.stats().await.unwrap().pending, 0);
        assert_eq!(store.len(queue.name()), 0);
        let entries = router.list(&queue, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id(), Some(job_id));
        assert_eq!(entries[0].failure_reason, FailureReason::FeatureDisabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_write_failures_are_retried() {
        let (store, queue) = setup();
        queue.ensure().await.unwrap();
        let (id, envelope) = claimed(&queue).await;

        store.fail_next_appends(&queue.dead_letter_name(), 2);
        fast_router(3)
            .route(&queue, &id, envelope, FailureReason::MaxAttemptsExceeded, "boom")
            .await
            .unwrap();
        assert_eq!(store.len(&queue.dead_letter_name()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_destination_escalates_without_ack() {
        let (store, queue) = setup();
        queue.ensure().await.unwrap();
        let (id, envelope) = claimed(&queue).await;

        store.fail_next_appends(&queue.dead_letter_name(), 10);
        let err = fast_router(3)
            .route(&queue, &id, envelope, FailureReason::MaxAttemptsExceeded, "boom")
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::DeadLetterUnavailable { attempts: 3, .. }));
        assert!(err.is_fatal());
        // Original stays pending for redelivery
        assert_eq!(queue.stats().await.unwrap().pending, 1);
        assert_eq!(store.len(&queue.dead_letter_name()), 0);
    }

    #[test]
    fn test_write_delay_is_bounded() {
        let router = fast_router(5);
        assert_eq!(router.write_delay(1), Duration::from_millis(10));
        assert_eq!(router.write_delay(2), Duration::from_millis(20));
        assert_eq!(router.write_delay(4), Duration::from_millis(40));
        assert_eq!(router.write_delay(40), Duration::from_millis(40));
    }
}
