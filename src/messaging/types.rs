//! # Messaging Types
//!
//! Transport-level types shared by the queue abstraction and its stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery identifier assigned by the backing store
///
/// Opaque to callers; only used for acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric form used by stores that allocate sequential ids
    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Delivery guarantee of a logical queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Simple list queue: claim removes the message, no ack
    #[serde(alias = "at_most_once")]
    List,
    /// Durable log with consumer groups: claim marks pending until ack
    #[serde(alias = "at_least_once")]
    Stream,
}

impl DeliveryMode {
    /// Segment used in queue names
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::List => "queue",
            Self::Stream => "stream",
        }
    }

    /// Label for the queue-depth gauge
    pub const fn kind_label(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified queue name: `{namespace}:{environment}:{mode}:{logical-name}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName {
    namespace: String,
    environment: String,
    mode: DeliveryMode,
    logical: String,
}

impl QueueName {
    pub fn new(
        namespace: impl Into<String>,
        environment: impl Into<String>,
        mode: DeliveryMode,
        logical: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            environment: environment.into(),
            mode,
            logical: logical.into(),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// Companion dead-letter destination
    ///
    /// Always a durable log, whatever the live queue's mode.
    pub fn dead_letter(&self) -> QueueName {
        Self {
            namespace: self.namespace.clone(),
            environment: self.environment.clone(),
            mode: DeliveryMode::Stream,
            logical: format!("{}:dlq", self.logical),
        }
    }

    /// Companion time-ordered deferred set
    pub fn deferred(&self) -> String {
        format!("{self}:deferred")
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.namespace, self.environment, self.mode, self.logical
        )
    }
}

/// Current holder of a claimed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimInfo {
    pub consumer: String,
    pub claimed_at: DateTime<Utc>,
}

/// A message as returned by a store, before envelope decoding
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    /// Times this entry has been handed to a consumer, including this one
    pub delivery_count: u32,
    /// Set for consumer-group deliveries only
    pub claim: Option<ClaimInfo>,
}

/// Queue statistics for gauges and admission decisions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages in the live queue, including pending ones
    pub depth: u64,
    /// Claimed but unacknowledged (stream mode only)
    pub pending: u64,
    /// Waiting in the deferred set for their retry time
    pub deferred: u64,
}
