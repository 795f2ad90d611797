//! # Task Handler Traits
//!
//! Contract for the code that actually performs a job. Handlers must be
//! idempotent with respect to `job_id`: a job may be delivered more than once
//! (reclaim after a crash, retry after a lost ack) and the durable outcome
//! has to be the same as after a single delivery.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::messaging::{JobEnvelope, MessageId};
use crate::resilience::{CircuitBreaker, CircuitBreakerError, CircuitBreakerRegistry};

/// Failure reported by a task handler
///
/// The variant decides the job's fate: transient shapes are retried with
/// backoff, validation and missing-entity errors go straight to dead-letter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Network blip, downstream 5xx, rate limiting
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Payload can never be processed as given
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A referenced record does not exist
    #[error("Missing referenced entity: {0}")]
    MissingEntity(String),

    /// Dependency is known-bad; the call was not attempted
    #[error("Circuit open for target '{target}'")]
    CircuitOpen { target: String },

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),
}

impl HandlerError {
    pub fn transient(message: impl fmt::Display) -> Self {
        Self::Transient(message.to_string())
    }

    pub fn validation(message: impl fmt::Display) -> Self {
        Self::Validation(message.to_string())
    }

    pub fn missing_entity(message: impl fmt::Display) -> Self {
        Self::MissingEntity(message.to_string())
    }

    /// Whether this error says something about the health of the target
    pub fn counts_against_target(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl<E> From<CircuitBreakerError<E>> for HandlerError
where
    E: Into<HandlerError>,
{
    fn from(error: CircuitBreakerError<E>) -> Self {
        match error {
            CircuitBreakerError::CircuitOpen { target } => Self::CircuitOpen { target },
            CircuitBreakerError::OperationFailed(e) => e.into(),
        }
    }
}

/// Per-delivery context handed to a handler
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub queue: String,
    pub consumer: String,
    pub message_id: MessageId,
    /// Times this delivery has been handed out, including this one
    pub delivery_count: u32,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl HandlerContext {
    pub fn new(
        queue: impl Into<String>,
        consumer: impl Into<String>,
        message_id: MessageId,
        delivery_count: u32,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            queue: queue.into(),
            consumer: consumer.into(),
            message_id,
            delivery_count,
            breakers,
        }
    }

    /// Shared breaker for an external target, for wrapping calls made inside
    /// the handler
    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        self.breakers.get(target)
    }

    /// True when this is a redelivery of a claim that was never acknowledged
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Perform the job and return its business result
    ///
    /// The dispatcher persists the returned value keyed by `job_id` before
    /// acknowledging the delivery.
    async fn handle(
        &self,
        ctx: &HandlerContext,
        job: &JobEnvelope,
    ) -> Result<serde_json::Value, HandlerError>;

    /// Handler name for logging
    fn name(&self) -> &str;
}
