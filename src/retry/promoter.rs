//! # Deferred Promoter
//!
//! Periodically moves due envelopes from a queue's deferred set back into
//! the live queue. One promoter runs per logical queue.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::messaging::{JobQueue, QueueError};

#[derive(Debug, Clone)]
pub struct DeferredPromoter {
    queue: JobQueue,
    interval: Duration,
    batch: usize,
    max_consecutive_errors: u32,
}

impl DeferredPromoter {
    pub fn new(queue: JobQueue, interval: Duration, batch: usize, max_consecutive_errors: u32) -> Self {
        Self {
            queue,
            interval,
            batch: batch.max(1),
            max_consecutive_errors: max_consecutive_errors.max(1),
        }
    }

    /// Promote everything currently due, in batches
    pub async fn promote_once(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        loop {
            let promoted = self.queue.promote_due(self.batch).await?;
            total += promoted;
            if promoted < self.batch {
                return Ok(total);
            }
        }
    }

    /// Run until `shutdown` flips to `true`
    ///
    /// Store failures are retried on the next tick; too many in a row are
    /// returned as [`EngineError::StoreUnavailable`].
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        info!(queue = %self.queue.name(), interval_ms = self.interval.as_millis() as u64, "Starting deferred promoter");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    // Sender gone: treat as shutdown
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.promote_once().await {
                Ok(0) => consecutive_errors = 0,
                Ok(promoted) => {
                    consecutive_errors = 0;
                    debug!(queue = %self.queue.name(), promoted = promoted, "Promoted deferred jobs");
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.max_consecutive_errors {
                        error!(
                            queue = %self.queue.name(),
                            consecutive_failures = consecutive_errors,
                            error = %e,
                            "❌ Deferred promoter giving up"
                        );
                        return Err(EngineError::StoreUnavailable {
                            queue: self.queue.name().to_string(),
                            consecutive_failures: consecutive_errors,
                            source: e,
                        });
                    }
                    warn!(
                        queue = %self.queue.name(),
                        consecutive_failures = consecutive_errors,
                        error = %e,
                        "Deferred promotion failed"
                    );
                }
            }
        }

        info!(queue = %self.queue.name(), "Deferred promoter stopped");
        Ok(())
    }
}
