//! # Job Metrics
//!
//! OpenTelemetry instruments for job processing and queue state:
//! - Processing duration histogram per task type and result
//! - Error, retry and dead-letter counters
//! - Queue depth and pending-message gauges
//!
//! ## Usage
//!
//! ```rust
//! use jobrelay_core::metrics::jobs;
//!
//! jobs::record_processing("browser", "success", 0.250);
//! jobs::record_error("browser", "timeout");
//! ```

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use super::labels;

/// Looked up per call; the global provider changes at `init_metrics`
fn meter() -> Meter {
    opentelemetry::global::meter("jobrelay-jobs")
}

/// Handler execution time in seconds
///
/// Labels: task_type, result (success, failed)
pub fn job_processing_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("jobrelay.job.processing.duration")
        .with_description("Time spent executing a job handler")
        .with_unit("s")
        .build()
}

/// Failed handler executions
///
/// Labels: task_type, error_type
pub fn job_errors_total() -> Counter<u64> {
    meter()
        .u64_counter("jobrelay.job.errors.total")
        .with_description("Total number of failed job executions")
        .build()
}

/// Jobs re-scheduled through the deferred set
///
/// Labels: task_type
pub fn job_retries_total() -> Counter<u64> {
    meter()
        .u64_counter("jobrelay.job.retries.total")
        .with_description("Total number of jobs scheduled for retry")
        .build()
}

/// Jobs written to a dead-letter destination
///
/// Labels: task_type, reason
pub fn dead_letter_total() -> Counter<u64> {
    meter()
        .u64_counter("jobrelay.dead_letter.total")
        .with_description("Total number of jobs dead-lettered")
        .build()
}

/// Messages in a live queue
///
/// Labels: queue_name, queue_kind (list, stream)
pub fn queue_depth() -> Gauge<u64> {
    meter()
        .u64_gauge("jobrelay.queue.depth")
        .with_description("Messages currently in the queue")
        .build()
}

/// Claimed but unacknowledged messages
///
/// Labels: queue_name, group
pub fn queue_pending() -> Gauge<u64> {
    meter()
        .u64_gauge("jobrelay.queue.pending")
        .with_description("Messages claimed but not yet acknowledged")
        .build()
}

pub fn record_processing(task_type: &str, result: &'static str, seconds: f64) {
    job_processing_duration().record(
        seconds,
        &labels(&[
            KeyValue::new("task_type", task_type.to_string()),
            KeyValue::new("result", result),
        ]),
    );
}

pub fn record_error(task_type: &str, error_type: &'static str) {
    job_errors_total().add(
        1,
        &labels(&[
            KeyValue::new("task_type", task_type.to_string()),
            KeyValue::new("error_type", error_type),
        ]),
    );
}

pub fn record_retry(task_type: &str) {
    job_retries_total().add(1, &labels(&[KeyValue::new("task_type", task_type.to_string())]));
}

pub fn record_dead_letter(task_type: &str, reason: &'static str) {
    dead_letter_total().add(
        1,
        &labels(&[
            KeyValue::new("task_type", task_type.to_string()),
            KeyValue::new("reason", reason),
        ]),
    );
}

pub fn record_queue_depth(queue_name: &str, queue_kind: &'static str, depth: u64) {
    queue_depth().record(
        depth,
        &labels(&[
            KeyValue::new("queue_name", queue_name.to_string()),
            KeyValue::new("queue_kind", queue_kind),
        ]),
    );
}

pub fn record_queue_pending(queue_name: &str, group: &str, pending: u64) {
    queue_pending().record(
        pending,
        &labels(&[
            KeyValue::new("queue_name", queue_name.to_string()),
            KeyValue::new("group", group.to_string()),
        ]),
    );
}
