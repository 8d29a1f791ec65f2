//! # Foreman
//!
//! A background-job processing pool with demand-driven dispatch over a
//! durable queue.
//!
//! ## Features
//!
//! - **Durable enqueueing**: jobs are published persistent to a pluggable
//!   queue backend and acknowledged only after a worker produced a result
//! - **Demand-driven dispatch**: a producer releases a job only when a
//!   worker monitor has asked for one, so at most one job is in flight
//!   per worker
//! - **Crash handling**: a monitor owns the job leased to its worker;
//!   worker death triggers a pluggable failure mode with exactly that job
//! - **Long-lived worker state**: each worker initializes user state once
//!   and carries it across jobs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Client / Pool API                       │
//! │  (submit, collect, suspend/resume, status, filter)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ enqueue
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      QueueProducer(s)                        │
//! │  (own the backend queue, emit one job per demand unit)      │
//! └─────────────────────────────────────────────────────────────┘
//!                  demand ▲          │ job
//!                         │          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerMonitor(s)                        │
//! │  (one worker each; hold the leased job; run failure modes)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ job            ▲ job_done
//!                              ▼                │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Worker(s)                            │
//! │  (user state + user methods; ack + reply after each job)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use foreman::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(MemoryBroker::new());
//!     let pool = Pool::start(
//!         PoolConfig::new("thumbnails").with_num_workers(4),
//!         ThumbnailModule::default(),
//!         backend,
//!         Arc::new(Abandon),
//!     )
//!     .await?;
//!
//!     let client = pool.client();
//!     let job = client.submit(Task::apply("resize", vec![800.into()])).await?;
//!     let result = client.collect(&job, None).await?;
//!     println!("{result:?}");
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod backend;
pub mod config;
pub mod failure;
pub mod job;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod worker;

mod reply;

/// Prelude for common imports
pub mod prelude {
    pub use crate::api::{Client, SubmitError};
    pub use crate::backend::{MemoryBroker, QueueBackend};
    pub use crate::config::{DispatcherStrategy, PoolConfig};
    pub use crate::failure::{Abandon, FailureContext, FailureMode, Requeue};
    pub use crate::job::{Job, JobId, Task};
    pub use crate::pool::{Pool, PoolError, PoolId, PoolStatus};
    pub use crate::worker::WorkerModule;
}

// Re-export key types at crate root
pub use api::{Client, SubmitError};
pub use backend::{BackendError, MemoryBroker, QueueBackend};
pub use config::{DispatcherStrategy, PoolConfig};
pub use failure::{Abandon, FailureContext, FailureMode, Requeue};
pub use job::{Job, JobId, NodeId, OwnerId, Task};
pub use pool::{Pool, PoolError, PoolId, PoolStatus, WorkerStats};
pub use queue::QueueStatus;
pub use registry::{PoolRegistry, Role, Scope};
pub use worker::WorkerModule;
