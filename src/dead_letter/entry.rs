//! Dead-letter entry format
//!
//! On the wire an entry is the original envelope with three extra fields:
//!
//! ```json
//! { "job_id": "...", "task_type": "browser", "attempts": 3, "max_attempts": 3,
//!   "payload": {...}, "meta": {...},
//!   "failed_at": "2024-05-01T12:00:00Z",
//!   "failure_reason": "max_attempts_exceeded",
//!   "last_error": "upstream timed out" }
//! ```
//!
//! Payloads that never decoded into an envelope are kept verbatim under
//! `raw_payload` instead of the envelope fields.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::failure_reasons;
use crate::messaging::JobEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxAttemptsExceeded,
    PermanentValidationError,
    FeatureDisabled,
}

impl FailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MaxAttemptsExceeded => failure_reasons::MAX_ATTEMPTS_EXCEEDED,
            Self::PermanentValidationError => failure_reasons::PERMANENT_VALIDATION_ERROR,
            Self::FeatureDisabled => failure_reasons::FEATURE_DISABLED,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    #[serde(flatten)]
    pub envelope: Option<JobEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub failure_reason: FailureReason,
    pub last_error: String,
}

impl DeadLetterEntry {
    pub fn for_envelope(
        envelope: JobEnvelope,
        reason: FailureReason,
        last_error: &str,
        max_error_len: usize,
    ) -> Self {
        Self {
            envelope: Some(envelope),
            raw_payload: None,
            failed_at: Utc::now(),
            failure_reason: reason,
            last_error: sanitize_error(last_error, max_error_len),
        }
    }

    /// Entry for bytes that could not be decoded as an envelope
    pub fn for_raw_payload(payload: &[u8], last_error: &str, max_error_len: usize) -> Self {
        Self {
            envelope: None,
            raw_payload: Some(String::from_utf8_lossy(payload).into_owned()),
            failed_at: Utc::now(),
            failure_reason: FailureReason::PermanentValidationError,
            last_error: sanitize_error(last_error, max_error_len),
        }
    }

    pub fn job_id(&self) -> Option<Uuid> {
        self.envelope.as_ref().map(|e| e.job_id)
    }

    pub fn task_type(&self) -> &str {
        self.envelope
            .as_ref()
            .map_or("unknown", |e| e.task_type.as_str())
    }
}

/// Reduce an error message to a short single-line diagnostic
///
/// Keeps the first non-empty line only, which drops backtraces and
/// multi-line dumps, and truncates to `max_len` characters.
pub fn sanitize_error(message: &str, max_len: usize) -> String {
    let line = message
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    match line.char_indices().nth(max_len) {
        Some((cut, _)) => format!("{}…", &line[..cut]),
        None => line.to_string(),
    }
}
