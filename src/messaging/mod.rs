//! # Messaging Module
//!
//! Job envelopes, their wire codec, and the queue abstraction that carries
//! them between producers and dispatchers.

pub mod codec;
pub mod envelope;
pub mod errors;
pub mod providers;
pub mod queue;
pub mod store;
pub mod types;

pub use codec::{CodecError, EnvelopeCodec, DEFAULT_MAX_ENVELOPE_BYTES};
pub use envelope::{JobEnvelope, JobMeta, TaskType, UnknownTaskType};
pub use errors::QueueError;
pub use providers::InMemoryQueueStore;
#[cfg(feature = "postgres")]
pub use providers::PgQueueStore;
pub use queue::{DurableLogQueue, JobQueue, SimpleQueue};
pub use store::QueueStore;
pub use types::{ClaimInfo, DeliveryMode, MessageId, QueueName, QueueStats, StoredMessage};
