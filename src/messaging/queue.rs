//! # Job Queue
//!
//! One call pattern over two delivery strategies, selected per logical queue
//! at configuration time:
//!
//! - [`SimpleQueue`] (at-most-once): `claim` removes the message. A consumer
//!   crash after claim loses it. For low-value, idempotent-safe work only.
//! - [`DurableLogQueue`] (at-least-once): `claim` marks the message pending
//!   for the consumer inside a consumer group; it stays in the log until
//!   `ack`. Pending messages idle past a staleness threshold can be
//!   `reclaim`ed by any live consumer of the group.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::errors::QueueError;
use super::store::QueueStore;
use super::types::{DeliveryMode, MessageId, QueueName, QueueStats, StoredMessage};

#[derive(Debug, Clone)]
pub struct SimpleQueue {
    name: QueueName,
    store: Arc<dyn QueueStore>,
}

#[derive(Debug, Clone)]
pub struct DurableLogQueue {
    name: QueueName,
    group: String,
    store: Arc<dyn QueueStore>,
}

/// A logical queue with its delivery strategy
#[derive(Debug, Clone)]
pub enum JobQueue {
    AtMostOnce(SimpleQueue),
    AtLeastOnce(DurableLogQueue),
}

impl JobQueue {
    pub fn simple(name: QueueName, store: Arc<dyn QueueStore>) -> Self {
        Self::AtMostOnce(SimpleQueue { name, store })
    }

    pub fn durable(name: QueueName, group: impl Into<String>, store: Arc<dyn QueueStore>) -> Self {
        Self::AtLeastOnce(DurableLogQueue {
            name,
            group: group.into(),
            store,
        })
    }

    pub fn name(&self) -> &QueueName {
        match self {
            Self::AtMostOnce(q) => &q.name,
            Self::AtLeastOnce(q) => &q.name,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        match self {
            Self::AtMostOnce(_) => DeliveryMode::List,
            Self::AtLeastOnce(_) => DeliveryMode::Stream,
        }
    }

    /// Consumer group, for at-least-once queues
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::AtMostOnce(_) => None,
            Self::AtLeastOnce(q) => Some(&q.group),
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        match self {
            Self::AtMostOnce(q) => &q.store,
            Self::AtLeastOnce(q) => &q.store,
        }
    }

    /// Companion dead-letter destination
    pub fn dead_letter_name(&self) -> QueueName {
        self.name().dead_letter()
    }

    /// Create the queue, its consumer group and its dead-letter log
    pub async fn ensure(&self) -> Result<(), QueueError> {
        let store = self.store();
        store.ensure_queue(self.name()).await?;
        if let Self::AtLeastOnce(q) = self {
            store.ensure_group(&q.name, &q.group).await?;
        }
        store.ensure_queue(&self.dead_letter_name()).await
    }

    /// Write an encoded envelope and return its delivery id
    pub async fn enqueue(&self, payload: Vec<u8>) -> Result<MessageId, QueueError> {
        match self {
            Self::AtMostOnce(q) => q.store.push(&q.name, payload).await,
            Self::AtLeastOnce(q) => q.store.append(&q.name, payload).await,
        }
    }

    /// Claim up to `count` new messages for `consumer`
    ///
    /// Waits up to `block_timeout` for work to arrive; returns an empty batch
    /// on timeout.
    pub async fn claim(
        &self,
        consumer: &str,
        count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StoredMessage>, QueueError> {
        let notifier = self.store().message_notifier(self.name());
        let deadline = Instant::now() + block_timeout;
        loop {
            // registered before looking, so a write landing in between still wakes us
            let mut notified = pin!(notifier.as_deref().map(Notify::notified));
            if let Some(waiter) = notified.as_mut().as_pin_mut() {
                waiter.enable();
            }

            let batch = self.try_claim(consumer, count).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            match notified.as_pin_mut() {
                Some(waiter) => {
                    let _ = tokio::time::timeout(deadline - now, waiter).await;
                }
                None => {
                    self.store()
                        .wait_for_messages(self.name(), deadline - now)
                        .await
                }
            }
        }
    }

    async fn try_claim(&self, consumer: &str, count: usize) -> Result<Vec<StoredMessage>, QueueError> {
        match self {
            Self::AtMostOnce(q) => q.store.pop(&q.name, count).await,
            Self::AtLeastOnce(q) => q.store.read_group(&q.name, &q.group, consumer, count).await,
        }
    }

    /// Mark a claimed message fully processed
    ///
    /// A no-op for at-most-once queues, where claim already removed it.
    pub async fn ack(&self, id: &MessageId) -> Result<bool, QueueError> {
        match self {
            Self::AtMostOnce(_) => Ok(true),
            Self::AtLeastOnce(q) => q.store.ack(&q.name, &q.group, id).await,
        }
    }

    /// Take over messages whose claim has been idle for at least `min_idle`
    ///
    /// Always empty for at-most-once queues.
    pub async fn reclaim(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StoredMessage>, QueueError> {
        match self {
            Self::AtMostOnce(_) => Ok(Vec::new()),
            Self::AtLeastOnce(q) => {
                q.store
                    .claim_idle(&q.name, &q.group, consumer, min_idle, count)
                    .await
            }
        }
    }

    /// Park an encoded envelope in the deferred set for `delay`
    pub async fn defer(&self, payload: Vec<u8>, delay: Duration) -> Result<(), QueueError> {
        self.store().defer(self.name(), payload, delay).await
    }

    /// Move due deferred envelopes back into the live queue
    pub async fn promote_due(&self, limit: usize) -> Result<usize, QueueError> {
        self.store().promote_due(self.name(), limit).await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store().stats(self.name(), self.group()).await
    }
}
