//! # Job Failure Classification
//!
//! Every way a delivery can fail is funnelled through [`JobFailure`] and
//! classified into one of two outcomes:
//!
//! | Failure                          | Outcome                              |
//! |----------------------------------|--------------------------------------|
//! | transient, timeout, circuit open | retry with backoff (up to max)       |
//! | result persistence failure       | retry with backoff (up to max)       |
//! | validation, missing entity       | dead-letter `permanent_validation_error` |
//! | unknown task type, bad envelope  | dead-letter `permanent_validation_error` |
//! | feature disabled                 | dead-letter `feature_disabled`       |
//!
//! Exhaustion (`max_attempts_exceeded`) is decided by the retry scheduler,
//! not here.

use std::fmt;

use crate::constants::error_types;
use crate::dead_letter::FailureReason;
use crate::messaging::TaskType;

use super::handler::HandlerError;

/// Anything that stopped a delivery from completing
#[derive(Debug, Clone, PartialEq)]
pub enum JobFailure {
    Handler(HandlerError),
    UnknownTaskType(String),
    FeatureDisabled(TaskType),
    MalformedEnvelope(String),
    /// Handler succeeded but its result could not be stored
    ResultPersistence(String),
    /// Delivered more often than the attempt budget allows (crash loop)
    PoisonMessage { delivery_count: u32, max_attempts: u32 },
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(e) => write!(f, "{e}"),
            Self::UnknownTaskType(t) => write!(f, "Unknown task type '{t}'"),
            Self::FeatureDisabled(t) => write!(f, "Task type '{t}' is disabled"),
            Self::MalformedEnvelope(e) => write!(f, "Malformed envelope: {e}"),
            Self::ResultPersistence(e) => write!(f, "Failed to persist result: {e}"),
            Self::PoisonMessage {
                delivery_count,
                max_attempts,
            } => write!(
                f,
                "Delivered {delivery_count} times without acknowledgment (max_attempts {max_attempts})"
            ),
        }
    }
}

impl From<HandlerError> for JobFailure {
    fn from(error: HandlerError) -> Self {
        Self::Handler(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// May succeed on a later attempt
    Retryable,
    /// Will never succeed; dead-letter with this reason
    Permanent(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    /// `error_type` metric label
    pub error_type: &'static str,
}

impl ErrorClassification {
    pub fn is_retryable(&self) -> bool {
        self.category == ErrorCategory::Retryable
    }

    fn retryable(error_type: &'static str) -> Self {
        Self {
            category: ErrorCategory::Retryable,
            error_type,
        }
    }

    fn permanent(reason: FailureReason, error_type: &'static str) -> Self {
        Self {
            category: ErrorCategory::Permanent(reason),
            error_type,
        }
    }
}

pub trait ErrorClassifier: Send + Sync + fmt::Debug {
    fn classify(&self, failure: &JobFailure) -> ErrorClassification;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardErrorClassifier;

impl ErrorClassifier for StandardErrorClassifier {
    fn classify(&self, failure: &JobFailure) -> ErrorClassification {
        use FailureReason::*;
        match failure {
            JobFailure::Handler(HandlerError::Transient(_)) => {
                ErrorClassification::retryable(error_types::TRANSIENT)
            }
            JobFailure::Handler(HandlerError::Timeout(_)) => {
                ErrorClassification::retryable(error_types::TIMEOUT)
            }
            JobFailure::Handler(HandlerError::CircuitOpen { .. }) => {
                ErrorClassification::retryable(error_types::CIRCUIT_OPEN)
            }
            JobFailure::ResultPersistence(_) => {
                ErrorClassification::retryable(error_types::RESULT_PERSISTENCE)
            }
            JobFailure::Handler(HandlerError::Validation(_)) => {
                ErrorClassification::permanent(PermanentValidationError, error_types::VALIDATION)
            }
            JobFailure::Handler(HandlerError::MissingEntity(_)) => {
                ErrorClassification::permanent(PermanentValidationError, error_types::MISSING_ENTITY)
            }
            JobFailure::UnknownTaskType(_) => ErrorClassification::permanent(
                PermanentValidationError,
                error_types::UNKNOWN_TASK_TYPE,
            ),
            JobFailure::MalformedEnvelope(_) => ErrorClassification::permanent(
                PermanentValidationError,
                error_types::MALFORMED_ENVELOPE,
            ),
            JobFailure::FeatureDisabled(_) => {
                ErrorClassification::permanent(FeatureDisabled, error_types::FEATURE_DISABLED)
            }
            JobFailure::PoisonMessage { .. } => {
                ErrorClassification::permanent(MaxAttemptsExceeded, error_types::POISON_MESSAGE)
            }
        }
    }
}
