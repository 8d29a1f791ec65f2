//! Submission API
//!
//! A [`Client`] is a per-submitter identity. Submitting stamps the job
//! with a reply address owned by that client; only the same client may
//! collect the result, and a result that misses its collection window is
//! silently discarded.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::job::{Job, OwnerId, ReplyTo, RequestId, Task};
use crate::pool::{Pool, PoolId};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// No queue producer is reachable (transient during a component
    /// restart, permanent after shutdown).
    #[error("no queue producer available for pool {0}")]
    NoQueue(PoolId),

    /// Collecting a job submitted by somebody else.
    #[error("job was submitted by a different owner")]
    OwnerMismatch,

    /// Collecting a job that was submitted without a reply address.
    #[error("job does not expect a reply")]
    NoReplyExpected,

    /// The pool is shutting down.
    #[error("pool is shut down")]
    PoolClosed,
}

/// Submitter identity bound to a pool.
#[derive(Clone)]
pub struct Client {
    owner: OwnerId,
    pool: Pool,
}

impl Client {
    pub(crate) fn new(pool: Pool) -> Self {
        Self {
            owner: OwnerId::new(),
            pool,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Enqueue a task and return the job whose result this client may
    /// later collect. The enqueue itself is fire-and-forget: a returned
    /// job only means the pool accepted it.
    pub async fn submit(&self, task: Task) -> Result<Job, SubmitError> {
        let request = RequestId::new();
        let job = Job::new(task).with_reply(ReplyTo {
            owner: self.owner,
            request,
        });

        let producer = self
            .pool
            .registry()
            .closest_producer(self.pool.id())
            .ok_or_else(|| SubmitError::NoQueue(self.pool.id().clone()))?;

        // Register before enqueueing so a fast worker cannot reply into
        // the void.
        self.pool.replies().register(request);
        producer
            .enqueue(job.clone())
            .await
            .map_err(|_| SubmitError::PoolClosed)?;
        debug!(job = %job.id, task = %job.task, "submitted");
        Ok(job)
    }

    /// Enqueue a task nobody will wait on.
    pub async fn submit_forget(&self, task: Task) -> Result<(), SubmitError> {
        let job = Job::new(task);
        let producer = self
            .pool
            .registry()
            .closest_producer(self.pool.id())
            .ok_or_else(|| SubmitError::NoQueue(self.pool.id().clone()))?;
        producer
            .enqueue(job)
            .await
            .map_err(|_| SubmitError::PoolClosed)?;
        Ok(())
    }

    /// Wait for a job's result. Returns `None` on timeout; the eventual
    /// reply is then dropped. `timeout` defaults to the pool's configured
    /// collect timeout.
    pub async fn collect(
        &self,
        job: &Job,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, SubmitError> {
        let from = job.from.ok_or(SubmitError::NoReplyExpected)?;
        if from.owner != self.owner {
            return Err(SubmitError::OwnerMismatch);
        }
        let timeout = timeout.unwrap_or(self.pool.config().collect_timeout);
        Ok(self.pool.replies().wait(from.request, timeout).await)
    }
}
