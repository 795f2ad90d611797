//! # Retry and Backoff
//!
//! Retryable failures are re-enqueued through a time-ordered deferred set
//! with capped exponential backoff; a promoter moves due entries back into
//! the live queue.

pub mod backoff;
pub mod promoter;
pub mod scheduler;

pub use backoff::{BackoffCalculator, BackoffCalculatorConfig};
pub use promoter::DeferredPromoter;
pub use scheduler::{RetryOutcome, RetryScheduler};
