//! # Messaging Error Types
//!
//! Structured error handling for the queue layer using thiserror instead of
//! `Box<dyn Error>` patterns. Everything the store can fail with lands here;
//! callers above the queue treat these as infrastructure failures.

use thiserror::Error;

/// Errors raised by queue stores and the queue abstraction
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue backend error: {operation}: {message}")]
    Backend { operation: String, message: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Consumer group not found: {queue_name}/{group}")]
    GroupNotFound { queue_name: String, group: String },

    #[error("Invalid message id for {queue_name}: {message_id}")]
    InvalidMessageId {
        queue_name: String,
        message_id: String,
    },

    #[error("Operation {operation} is not supported by {mode} queues")]
    UnsupportedOperation { operation: String, mode: String },

    #[error("Message encoding error: {message}")]
    Encoding { message: String },

    #[error("Network timeout: operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    /// Create a backend error
    pub fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a queue not found error
    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    /// Create a consumer group not found error
    pub fn group_not_found(queue_name: impl Into<String>, group: impl Into<String>) -> Self {
        Self::GroupNotFound {
            queue_name: queue_name.into(),
            group: group.into(),
        }
    }

    /// Create an invalid message id error
    pub fn invalid_message_id(queue_name: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self::InvalidMessageId {
            queue_name: queue_name.into(),
            message_id: message_id.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>, mode: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
            mode: mode.into(),
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Whether retrying the same store call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend { .. } | Self::Timeout { .. } => true,
            #[cfg(feature = "postgres")]
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}
