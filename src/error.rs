//! Engine-level error type
//!
//! Handler failures never surface here; the dispatcher classifies them into
//! retry or dead-letter outcomes. What remains are infrastructure conditions
//! an operator has to see.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::messaging::{CodecError, QueueError};
use crate::worker::ResultStoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Queue store error: {0}")]
    Queue(#[from] QueueError),

    #[error("Envelope codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigurationError),

    #[error("Result store error: {0}")]
    ResultStore(#[from] ResultStoreError),

    /// Every bounded attempt at writing a dead-letter entry failed; the
    /// original message is left unacknowledged
    #[error("Dead-letter destination {queue} unavailable for job {job_id:?} after {attempts} attempts: {source}")]
    DeadLetterUnavailable {
        queue: String,
        job_id: Option<Uuid>,
        attempts: u32,
        #[source]
        source: QueueError,
    },

    /// A dispatcher hit too many consecutive queue-store failures
    #[error("Queue store unavailable for {queue} after {consecutive_failures} consecutive failures: {source}")]
    StoreUnavailable {
        queue: String,
        consecutive_failures: u32,
        #[source]
        source: QueueError,
    },

    #[error("No handler registered for task type '{task_type}' routed to {queue}")]
    MissingHandler { task_type: String, queue: String },

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl EngineError {
    /// Conditions that should page an operator
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeadLetterUnavailable { .. }
                | Self::StoreUnavailable { .. }
                | Self::Worker(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
