//! Failure modes
//!
//! A failure mode decides what happens to a job whose worker died while
//! holding it. Handlers run detached from the monitor that invoked them
//! and must be idempotent: at-least-once semantics mean the same job can
//! reach a handler more than once (for instance a local nack racing a
//! broker redelivery).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::job::Job;
use crate::pool::PoolId;
use crate::registry::PoolRegistry;

/// Everything a handler may need: the pool, the job as held at the time
/// of the crash, and settlement helpers routed through the pool's queue
/// producers.
pub struct FailureContext {
    pool: PoolId,
    job: Job,
    registry: Arc<PoolRegistry>,
}

impl FailureContext {
    pub(crate) fn new(pool: PoolId, job: Job, registry: Arc<PoolRegistry>) -> Self {
        Self {
            pool,
            job,
            registry,
        }
    }

    pub fn pool(&self) -> &PoolId {
        &self.pool
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Acknowledge the job away so the backend drops it. Returns false
    /// when no producer was reachable; the backend's visibility timeout
    /// then redelivers, which is safe for idempotent handlers.
    pub async fn ack_job(&self) -> bool {
        match self.registry.closest_producer(&self.pool) {
            Some(producer) => producer.ack(self.job.clone()).await.is_ok(),
            None => false,
        }
    }

    /// Reject the job back onto the queue for another worker.
    pub async fn nack_job(&self) -> bool {
        match self.registry.closest_producer(&self.pool) {
            Some(producer) => producer.nack(self.job.clone()).await.is_ok(),
            None => false,
        }
    }
}

/// Invoked in a detached context when a worker dies while holding a job.
#[async_trait]
pub trait FailureMode: Send + Sync + 'static {
    async fn handle_failure(&self, ctx: FailureContext);
}

/// Log the loss and drop the job.
#[derive(Debug, Default, Clone, Copy)]
pub struct Abandon;

#[async_trait]
impl FailureMode for Abandon {
    async fn handle_failure(&self, ctx: FailureContext) {
        error!(
            pool = %ctx.pool(),
            job = %ctx.job().id,
            task = %ctx.job().task,
            "worker died holding job, abandoning it"
        );
        if !ctx.ack_job().await {
            warn!(job = %ctx.job().id, "could not settle abandoned job, backend will redeliver");
        }
    }
}

/// Put the job back on the queue so another worker picks it up.
#[derive(Debug, Default, Clone, Copy)]
pub struct Requeue;

#[async_trait]
impl FailureMode for Requeue {
    async fn handle_failure(&self, ctx: FailureContext) {
        warn!(
            pool = %ctx.pool(),
            job = %ctx.job().id,
            task = %ctx.job().task,
            "worker died holding job, requeueing it"
        );
        if !ctx.nack_job().await {
            warn!(job = %ctx.job().id, "could not requeue job, backend will redeliver");
        }
    }
}
