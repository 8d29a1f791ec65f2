//! Durable queue backend contract
//!
//! A pool talks to its backing queue exclusively through [`QueueBackend`].
//! The contract is modeled on AMQP-style brokers: persistent publish,
//! single-message polling, cancellable push subscriptions, and
//! tag-addressed ack/reject. [`MemoryBroker`] is the in-process
//! implementation used in tests and as the reference for the semantics.

mod memory;

pub use memory::{MemoryBroker, MemoryBrokerConfig};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Per-delivery acknowledgement credential, scoped to the backend
/// connection that produced the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle for a push subscription, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A message handed out by the backend, pending acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub tag: DeliveryTag,
    /// True when the backend has handed this message out before.
    pub redelivered: bool,
}

/// Queue metadata reported by `declare`.
#[derive(Debug, Clone, Copy)]
pub struct QueueInfo {
    /// Messages currently ready for delivery.
    pub depth: u64,
}

/// Backend failures.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend connection is gone. Producers treat this as fatal and
    /// rely on their supervisor for a restart.
    #[error("backend connection lost: {0}")]
    ConnectionLost(String),

    /// The named queue has not been declared.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// The tag does not match an outstanding delivery. Expected under
    /// at-least-once semantics when an ack races a redelivery.
    #[error("unknown delivery tag: {0}")]
    UnknownTag(DeliveryTag),

    /// The subscription is not active.
    #[error("unknown subscription")]
    UnknownSubscription,

    /// The backend does not implement an optional operation.
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

/// Contract for a durable queue backend.
///
/// Implementations must be safe for concurrent use; every queue producer
/// owns its own handle (or clone) and never shares in-flight state.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// Declare a queue, creating it if needed. Idempotent.
    async fn declare(&self, queue: &str, durable: bool) -> Result<QueueInfo, BackendError>;

    /// Publish a message. `persistent` asks the backend to survive restarts.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        persistent: bool,
    ) -> Result<(), BackendError>;

    /// Poll for a single message without holding a subscription.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BackendError>;

    /// Start a push subscription delivering into `sink`. At most
    /// `prefetch` deliveries may be outstanding (unacked) at a time.
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
        sink: mpsc::Sender<Delivery>,
    ) -> Result<SubscriptionId, BackendError>;

    /// Cancel a push subscription. Deliveries already in flight may still
    /// arrive at the sink and must be rejected by the consumer.
    async fn cancel(&self, queue: &str, id: SubscriptionId) -> Result<(), BackendError>;

    /// Acknowledge a delivery as fully processed.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BackendError>;

    /// Reject a delivery. With `redeliver` the message re-enters the
    /// queue; without it the backend dead-letters or drops it.
    async fn reject(&self, tag: DeliveryTag, redeliver: bool) -> Result<(), BackendError>;

    /// Number of messages ready for delivery.
    async fn depth(&self, queue: &str) -> Result<u64, BackendError>;

    /// Best-effort snapshot of the ready messages. Optional.
    async fn peek(&self, _queue: &str) -> Result<Vec<Vec<u8>>, BackendError> {
        Err(BackendError::Unsupported("peek"))
    }
}
