//! # Envelope Codec
//!
//! Serializes and deserializes the canonical JSON job format. Pure and
//! stateless apart from its size limit; every envelope leaving a producer or
//! entering a handler goes through here.

use crate::messaging::envelope::JobEnvelope;
use thiserror::Error;

/// Default ceiling for an encoded envelope (256 KiB)
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 256 * 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Envelope serialization error: {message}")]
    Serialization { message: String },

    #[error("Envelope deserialization error: {message}")]
    Deserialization { message: String },

    #[error("Invalid envelope field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Envelope too large: {size_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    TooLarge {
        size_bytes: usize,
        limit_bytes: usize,
    },
}

impl CodecError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// JSON codec for job envelopes
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_bytes: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENVELOPE_BYTES)
    }
}

impl EnvelopeCodec {
    pub const fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// Validate and encode an envelope
    pub fn encode(&self, envelope: &JobEnvelope) -> Result<Vec<u8>, CodecError> {
        Self::validate(envelope)?;
        let bytes = serde_json::to_vec(envelope).map_err(|e| CodecError::Serialization {
            message: e.to_string(),
        })?;
        self.check_size(bytes.len())?;
        Ok(bytes)
    }

    /// Decode and validate an envelope
    pub fn decode(&self, bytes: &[u8]) -> Result<JobEnvelope, CodecError> {
        self.check_size(bytes.len())?;
        let envelope: JobEnvelope =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialization {
                message: e.to_string(),
            })?;
        Self::validate(&envelope)?;
        Ok(envelope)
    }

    /// Structural checks shared by encode and decode
    ///
    /// Task type is only checked for presence here; whether it names a known
    /// handler is the dispatcher's call.
    pub fn validate(envelope: &JobEnvelope) -> Result<(), CodecError> {
        if envelope.job_id.is_nil() {
            return Err(CodecError::invalid("job_id", "must not be nil"));
        }
        if envelope.task_type.trim().is_empty() {
            return Err(CodecError::invalid("task_type", "must not be empty"));
        }
        if envelope.max_attempts == 0 {
            return Err(CodecError::invalid("max_attempts", "must be at least 1"));
        }
        if envelope.attempts > envelope.max_attempts {
            return Err(CodecError::invalid(
                "attempts",
                format!(
                    "{} exceeds max_attempts {}",
                    envelope.attempts, envelope.max_attempts
                ),
            ));
        }
        if envelope.meta.source.trim().is_empty() {
            return Err(CodecError::invalid("meta.source", "must not be empty"));
        }
        Ok(())
    }

    fn check_size(&self, size_bytes: usize) -> Result<(), CodecError> {
        if size_bytes > self.max_bytes {
            return Err(CodecError::TooLarge {
                size_bytes,
                limit_bytes: self.max_bytes,
            });
        }
        Ok(())
    }
}
