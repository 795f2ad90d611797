//! # Queue Store Trait
//!
//! Backend-agnostic storage primitives underneath the queue abstraction.
//!
//! A store offers two families of structures, addressed by [`QueueName`]:
//!
//! - **Lists** (`push`/`pop`): a claim removes the message. No ack, no redelivery.
//! - **Logs** (`append`/`read_group`/`ack`/`claim_idle`): append-only entries
//!   read through named consumer groups. A delivered entry stays pending for
//!   its group until acknowledged, and pending entries idle past a threshold
//!   can be claimed by another consumer.
//!
//! Every queue also has a companion deferred set holding payloads until a
//! due time; `promote_due` moves due payloads back into the live structure
//! chosen by the queue's [`DeliveryMode`](super::types::DeliveryMode).

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::errors::QueueError;
use super::types::{MessageId, QueueName, QueueStats, StoredMessage};

#[async_trait]
pub trait QueueStore: Send + Sync + Debug + 'static {
    /// Short backend identifier for logs
    fn backend_name(&self) -> &'static str;

    /// Create the queue's structures if missing (idempotent)
    async fn ensure_queue(&self, queue: &QueueName) -> Result<(), QueueError>;

    /// Create a consumer group on a log if missing (idempotent)
    ///
    /// A new group starts from the beginning of the log, so entries appended
    /// before the first consumer came up are still delivered.
    async fn ensure_group(&self, queue: &QueueName, group: &str) -> Result<(), QueueError>;

    /// Append a payload to the tail of a list
    async fn push(&self, queue: &QueueName, payload: Vec<u8>) -> Result<MessageId, QueueError>;

    /// Remove and return up to `count` messages from the head of a list
    async fn pop(&self, queue: &QueueName, count: usize) -> Result<Vec<StoredMessage>, QueueError>;

    /// Append a payload to a log
    async fn append(&self, queue: &QueueName, payload: Vec<u8>) -> Result<MessageId, QueueError>;

    /// Deliver up to `count` never-delivered entries to `consumer`
    ///
    /// Delivered entries become pending for `group` until acked.
    async fn read_group(
        &self,
        queue: &QueueName,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StoredMessage>, QueueError>;

    /// Acknowledge a pending entry
    ///
    /// Returns `false` when the entry was not pending (already acked or
    /// never delivered to this group).
    async fn ack(&self, queue: &QueueName, group: &str, id: &MessageId)
        -> Result<bool, QueueError>;

    /// Transfer pending entries idle for at least `min_idle` to `consumer`
    ///
    /// Each transferred entry's delivery count is incremented.
    async fn claim_idle(
        &self,
        queue: &QueueName,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StoredMessage>, QueueError>;

    /// Depth, pending and deferred counts
    ///
    /// `group` narrows the pending count to one consumer group.
    async fn stats(&self, queue: &QueueName, group: Option<&str>)
        -> Result<QueueStats, QueueError>;

    /// Park a payload in the queue's deferred set until `delay` has elapsed
    async fn defer(
        &self,
        queue: &QueueName,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Move up to `limit` due payloads from the deferred set into the queue
    async fn promote_due(&self, queue: &QueueName, limit: usize) -> Result<usize, QueueError>;

    /// Read up to `limit` entries of a log, oldest first, without delivering them
    async fn peek(&self, queue: &QueueName, limit: usize)
        -> Result<Vec<StoredMessage>, QueueError>;

    /// Handle signalled whenever `queue` gains messages
    ///
    /// `None` for stores that can only be polled; claims then fall back to
    /// [`wait_for_messages`](Self::wait_for_messages).
    fn message_notifier(&self, _queue: &QueueName) -> Option<Arc<Notify>> {
        None
    }

    /// Block until new messages may be available or `timeout` passes
    ///
    /// Stores without push notification just sleep.
    async fn wait_for_messages(&self, _queue: &QueueName, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}
