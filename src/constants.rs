//! # System Constants
//!
//! Names and defaults shared across the engine.

/// Default `service` label and service name
pub const DEFAULT_SERVICE_NAME: &str = "jobrelay";

/// Default first segment of every queue name
pub const DEFAULT_NAMESPACE: &str = "jobrelay";

/// Dead-letter failure reasons as written to `failure_reason`
pub mod failure_reasons {
    pub const MAX_ATTEMPTS_EXCEEDED: &str = "max_attempts_exceeded";
    pub const PERMANENT_VALIDATION_ERROR: &str = "permanent_validation_error";
    pub const FEATURE_DISABLED: &str = "feature_disabled";
}

/// `error_type` metric label values
pub mod error_types {
    pub const TRANSIENT: &str = "transient";
    pub const TIMEOUT: &str = "timeout";
    pub const CIRCUIT_OPEN: &str = "circuit_open";
    pub const VALIDATION: &str = "validation";
    pub const MISSING_ENTITY: &str = "missing_entity";
    pub const UNKNOWN_TASK_TYPE: &str = "unknown_task_type";
    pub const FEATURE_DISABLED: &str = "feature_disabled";
    pub const MALFORMED_ENVELOPE: &str = "malformed_envelope";
    pub const RESULT_PERSISTENCE: &str = "result_persistence";
    pub const POISON_MESSAGE: &str = "poison_message";
}

/// `result` metric label values
pub mod job_results {
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
}
