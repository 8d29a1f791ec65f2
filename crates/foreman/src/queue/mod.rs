//! Queue producers
//!
//! A queue producer owns the backend connection for a pool queue and emits
//! jobs downstream only in response to demand from worker monitors. The
//! dispatch state machine lives in [`producer`]; [`dispatcher`] holds the
//! pending demand units and the strategy for serving them.

mod dispatcher;
mod producer;

pub(crate) use dispatcher::Dispatcher;
pub(crate) use producer::{ConsumerRef, JobDelivery, JobPredicate, ProducerCommand, QueueProducer};

pub use producer::{ProducerGone, ProducerHandle, QueueStatus};
