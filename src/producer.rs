//! # Job Producer
//!
//! Admission side of the engine. A submission is checked against the
//! feature gate, validated, routed by task type and (optionally) held to a
//! queue depth quota before it is written. Anything that cannot be accepted
//! comes back as a structured [`SubmitRejection`].
//!
//! ```rust
//! use std::sync::Arc;
//! use jobrelay_core::features::FeatureGate;
//! use jobrelay_core::messaging::{DeliveryMode, InMemoryQueueStore, JobMeta, JobQueue, QueueName, TaskType};
//! use jobrelay_core::producer::JobProducer;
//!
//! # tokio_test::block_on(async {
//! let queue = JobQueue::simple(
//!     QueueName::new("jobrelay", "development", DeliveryMode::List, "jobs.generic"),
//!     Arc::new(InMemoryQueueStore::new()),
//! );
//! let producer = JobProducer::new(Arc::new(FeatureGate::default()))
//!     .with_route(TaskType::Generic, queue, 3, None);
//!
//! let receipt = producer
//!     .submit(TaskType::Generic, serde_json::json!({"n": 1}), JobMeta::new("docs"))
//!     .await
//!     .unwrap();
//! assert_eq!(receipt.queue, "jobrelay:development:queue:jobs.generic");
//! # });
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::features::FeatureGate;
use crate::messaging::{
    CodecError, EnvelopeCodec, JobEnvelope, JobMeta, JobQueue, MessageId, QueueError, TaskType,
};

#[derive(Debug, Error)]
pub enum SubmitRejection {
    #[error("Task type '{0}' is disabled")]
    FeatureDisabled(TaskType),

    #[error("No queue is configured for task type '{0}'")]
    NoRoute(TaskType),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(#[from] CodecError),

    #[error("Queue {queue} is at capacity ({depth}/{max_depth})")]
    QueueAtCapacity {
        queue: String,
        depth: u64,
        max_depth: u64,
    },

    #[error("Queue unavailable: {0}")]
    Queue(#[from] QueueError),
}

impl SubmitRejection {
    /// Short machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::FeatureDisabled(_) => "feature_disabled",
            Self::NoRoute(_) => "no_route",
            Self::InvalidEnvelope(_) => "invalid_envelope",
            Self::QueueAtCapacity { .. } => "quota_exceeded",
            Self::Queue(_) => "queue_unavailable",
        }
    }
}

/// Accepted submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub message_id: MessageId,
    pub queue: String,
}

#[derive(Debug, Clone)]
struct ProducerRoute {
    queue: JobQueue,
    max_attempts: u32,
    max_depth: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct JobProducer {
    routes: HashMap<TaskType, ProducerRoute>,
    features: Arc<FeatureGate>,
    codec: EnvelopeCodec,
}

impl JobProducer {
    pub fn new(features: Arc<FeatureGate>) -> Self {
        Self {
            routes: HashMap::new(),
            features,
            codec: EnvelopeCodec::default(),
        }
    }

    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Route `task_type` to `queue`
    pub fn with_route(
        mut self,
        task_type: TaskType,
        queue: JobQueue,
        max_attempts: u32,
        max_depth: Option<u64>,
    ) -> Self {
        self.routes.insert(
            task_type,
            ProducerRoute {
                queue,
                max_attempts,
                max_depth,
            },
        );
        self
    }

    /// Queue a task type is routed to
    pub fn queue_for(&self, task_type: TaskType) -> Option<&JobQueue> {
        self.routes.get(&task_type).map(|r| &r.queue)
    }

    /// Build an envelope for `payload` and enqueue it
    pub async fn submit(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        meta: JobMeta,
    ) -> Result<SubmitReceipt, SubmitRejection> {
        let route = self.admit(task_type)?;
        let envelope = JobEnvelope::new(task_type, payload, route.max_attempts, meta);
        self.write(route, &envelope).await
    }

    /// Enqueue a caller-built envelope as is
    pub async fn submit_envelope(&self, envelope: &JobEnvelope) -> Result<SubmitReceipt, SubmitRejection> {
        let task_type = envelope.task_kind().map_err(|e| {
            SubmitRejection::InvalidEnvelope(CodecError::InvalidField {
                field: "task_type",
                reason: e.to_string(),
            })
        })?;
        let route = self.admit(task_type)?;
        self.write(route, envelope).await
    }

    fn admit(&self, task_type: TaskType) -> Result<&ProducerRoute, SubmitRejection> {
        if !self.features.is_enabled(task_type) {
            debug!(task_type = %task_type, "Rejecting submission for disabled task type");
            return Err(SubmitRejection::FeatureDisabled(task_type));
        }
        self.routes
            .get(&task_type)
            .ok_or(SubmitRejection::NoRoute(task_type))
    }

    async fn write(&self, route: &ProducerRoute, envelope: &JobEnvelope) -> Result<SubmitReceipt, SubmitRejection> {
        let bytes = self.codec.encode(envelope)?;

        if let Some(max_depth) = route.max_depth {
            let depth = route.queue.stats().await?.depth;
            if depth >= max_depth {
                warn!(
                    queue = %route.queue.name(),
                    depth = depth,
                    max_depth = max_depth,
                    "Rejecting submission, queue at capacity"
                );
                return Err(SubmitRejection::QueueAtCapacity {
                    queue: route.queue.name().to_string(),
                    depth,
                    max_depth,
                });
            }
        }

        let message_id = route.queue.enqueue(bytes).await?;
        debug!(
            job_id = %envelope.job_id,
            correlation_id = %envelope.meta.correlation_id,
            task_type = %envelope.task_type,
            queue = %route.queue.name(),
            message_id = %message_id,
            "📤 Job enqueued"
        );
        Ok(SubmitReceipt {
            job_id: envelope.job_id,
            message_id,
            queue: route.queue.name().to_string(),
        })
    }
}
