//! # Dead-Letter Routing
//!
//! Permanently failed work is written to `{queue}:dlq` with failure metadata
//! and removed from the live path. Nothing is silently discarded.

pub mod entry;
pub mod router;

pub use entry::{sanitize_error, DeadLetterEntry, FailureReason};
pub use router::DeadLetterRouter;
