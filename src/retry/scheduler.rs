//! # Retry Scheduler
//!
//! Handles a retryable failure: records the attempt, then either parks the
//! envelope in the queue's deferred set for its backoff delay or, once the
//! attempt budget is spent, hands it to the dead-letter router with
//! `max_attempts_exceeded`.
//!
//! The deferred copy is written before the original delivery is acked. A
//! crash between the two yields a duplicate delivery, never a lost job.

use std::time::Duration;

use tracing::{debug, info};

use crate::dead_letter::{sanitize_error, DeadLetterRouter, FailureReason};
use crate::error::EngineError;
use crate::messaging::{EnvelopeCodec, JobEnvelope, JobQueue, MessageId};
use crate::metrics::jobs as job_metrics;

use super::backoff::BackoffCalculator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Re-enqueued through the deferred set
    Scheduled { attempts: u32, delay: Duration },
    /// Attempt budget exhausted
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    backoff: BackoffCalculator,
    codec: EnvelopeCodec,
    dead_letters: DeadLetterRouter,
}

impl RetryScheduler {
    pub fn new(backoff: BackoffCalculator, codec: EnvelopeCodec, dead_letters: DeadLetterRouter) -> Self {
        Self {
            backoff,
            codec,
            dead_letters,
        }
    }

    pub fn backoff(&self) -> &BackoffCalculator {
        &self.backoff
    }

    pub fn dead_letters(&self) -> &DeadLetterRouter {
        &self.dead_letters
    }

    /// Record a failed attempt of `envelope` (delivered as `message_id`)
    pub async fn schedule(
        &self,
        queue: &JobQueue,
        message_id: &MessageId,
        envelope: &JobEnvelope,
        error: &str,
    ) -> Result<RetryOutcome, EngineError> {
        let max_len = self.dead_letters.config().last_error_max_len;
        let next = envelope.next_attempt(Some(sanitize_error(error, max_len)));

        if next.is_exhausted() {
            let attempts = next.attempts;
            self.dead_letters
                .route(queue, message_id, next, FailureReason::MaxAttemptsExceeded, error)
                .await?;
            return Ok(RetryOutcome::DeadLettered { attempts });
        }

        let delay = self.backoff.delay_for(next.attempts);
        let bytes = self.codec.encode(&next)?;
        queue.defer(bytes, delay).await?;
        if !queue.ack(message_id).await? {
            debug!(
                job_id = %next.job_id,
                message_id = %message_id,
                "Retried delivery was no longer pending"
            );
        }

        job_metrics::record_retry(&next.task_type);
        info!(
            job_id = %next.job_id,
            task_type = %next.task_type,
            attempts = next.attempts,
            max_attempts = next.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "🔁 Job scheduled for retry"
        );

        Ok(RetryOutcome::Scheduled {
            attempts: next.attempts,
            delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeadLetterConfig;
    use crate::messaging::{DeliveryMode, InMemoryQueueStore, JobMeta, QueueName, TaskType};
    use crate::retry::backoff::BackoffCalculatorConfig;
    use serde_json::json;
    use std::sync::Arc;

    fn scheduler() -> RetryScheduler {
        RetryScheduler::new(
            BackoffCalculator::new(BackoffCalculatorConfig {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(300),
                max_jitter: Duration::ZERO,
            }),
            EnvelopeCodec::default(),
            DeadLetterRouter::new(DeadLetterConfig::default()),
        )
    }

    async fn claimed(queue: &JobQueue, envelope: &JobEnvelope) -> MessageId {
        let codec = EnvelopeCodec::default();
        queue.enqueue(codec.encode(envelope).unwrap()).await.unwrap();
        queue.claim("c1", 1, Duration::ZERO).await.unwrap()[0].id.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_defers_with_backoff_and_acks() {
        let store = Arc::new(InMemoryQueueStore::new());
        let queue = JobQueue::durable(
            QueueName::new("ns", "test", DeliveryMode::Stream, "jobs.agents"),
            "agent-workers",
            store.clone(),
        );
        queue.ensure().await.unwrap();
        let envelope = JobEnvelope::new(TaskType::AgentWorkflow, json!({}), 3, JobMeta::new("test"));
        let id = claimed(&queue, &envelope).await;

        let outcome = scheduler()
            .schedule(&queue, &id, &envelope, "llm timeout\n  at provider.rs:10")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RetryOutcome::Scheduled {
                attempts: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(queue.stats().await.unwrap().pending, 0);
        assert_eq!(store.deferred_len(queue.name()), 1);
        assert_eq!(store.next_due_in(queue.name()), Some(Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(queue.promote_due(10).await.unwrap(), 1);
        let redelivered = queue.claim("c2", 1, Duration::ZERO).await.unwrap();
        let decoded = EnvelopeCodec::default().decode(&redelivered[0].payload).unwrap();
        assert_eq!(decoded.job_id, envelope.job_id);
        assert_eq!(decoded.attempts, 1);
        assert_eq!(decoded.meta.last_error.as_deref(), Some("llm timeout"));
    }

    #[tokio::test]
    async fn test_last_attempt_goes_to_dead_letter() {
        let store = Arc::new(InMemoryQueueStore::new());
        let queue = JobQueue::simple(
            QueueName::new("ns", "test", DeliveryMode::List, "jobs.generic"),
            store.clone(),
        );
        queue.ensure().await.unwrap();
        let mut envelope = JobEnvelope::new(TaskType::Generic, json!({}), 3, JobMeta::new("test"));
        envelope.attempts = 2;
        let id = claimed(&queue, &envelope).await;

        let scheduler = scheduler();
        let outcome = scheduler.schedule(&queue, &id, &envelope, "boom").await.unwrap();
        assert_eq!(outcome, RetryOutcome::DeadLettered { attempts: 3 });
        assert_eq!(store.deferred_len(queue.name()), 0);

        let entries = scheduler.dead_letters().list(&queue, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_reason, FailureReason::MaxAttemptsExceeded);
        assert_eq!(entries[0].envelope.as_ref().unwrap().attempts, 3);
    }
}
