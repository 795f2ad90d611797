//! # Worker
//!
//! Task handler contract, handler registry, result persistence and the
//! dispatcher loop that drives them.

pub mod dispatcher;
pub mod error_classifier;
pub mod handler;
pub mod registry;
pub mod result_store;

pub use dispatcher::{DispatchOutcome, DispatchServices, Dispatcher, DispatcherSettings};
pub use error_classifier::{
    ErrorCategory, ErrorClassification, ErrorClassifier, JobFailure, StandardErrorClassifier,
};
pub use handler::{HandlerContext, HandlerError, TaskHandler};
pub use registry::{HandlerRegistry, RegisteredHandler};
#[cfg(feature = "postgres")]
pub use result_store::PgResultStore;
pub use result_store::{InMemoryResultStore, JobResult, ResultStore, ResultStoreError};
