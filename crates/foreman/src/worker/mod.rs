//! Workers and their monitors
//!
//! A worker holds user state and executes one job at a time. It never
//! subscribes to queues itself: its monitor leases jobs to it and watches
//! for its death, because a worker cannot be trusted to report its own.

mod module;
mod monitor;

pub use module::WorkerModule;
pub use monitor::MonitorHandle;

pub(crate) use module::{ErasedWorkerModule, ModuleAdapter, WorkerState};
pub(crate) use monitor::{MonitorError, MonitorMsg, WorkerMonitor};

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::job::{Job, JobId};
use crate::pool::PoolId;
use crate::registry::{MemberId, PoolRegistry};
use crate::reply::ReplyRouter;

/// Registry entry for a live worker. Liveness tracks the worker's job
/// inbox: when the worker task ends, the inbox closes.
#[derive(Debug, Clone)]
pub struct WorkerRef {
    pub(crate) id: MemberId,
    feed: mpsc::Sender<Job>,
}

impl WorkerRef {
    pub(crate) fn is_closed(&self) -> bool {
        self.feed.is_closed()
    }
}

/// What a worker needs besides its module: where to ack, where to reply.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub pool: PoolId,
    pub registry: Arc<PoolRegistry>,
    pub replies: Arc<ReplyRouter>,
}

/// The monitor's ownership link to its worker.
#[derive(Debug)]
pub(crate) struct WorkerLink {
    pub join: JoinHandle<anyhow::Result<()>>,
    pub feed: mpsc::Sender<Job>,
    pub done: mpsc::Receiver<JobId>,
    pub member: MemberId,
}

impl WorkerLink {
    pub fn worker_ref(&self) -> WorkerRef {
        WorkerRef {
            id: self.member,
            feed: self.feed.clone(),
        }
    }
}

/// Spawn a worker and wait for its `init` to finish. Returns an error
/// when `init` fails or the task dies during startup; the caller decides
/// when to retry.
pub(crate) async fn spawn_worker(
    module: Arc<dyn ErasedWorkerModule>,
    init_args: Value,
    ctx: WorkerContext,
) -> anyhow::Result<WorkerLink> {
    let (feed_tx, feed_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = mpsc::channel(1);
    let (ready_tx, ready_rx) = oneshot::channel();

    let join = tokio::spawn(worker_loop(module, init_args, ctx, ready_tx, feed_rx, done_tx));

    match ready_rx.await {
        Ok(Ok(())) => Ok(WorkerLink {
            join,
            feed: feed_tx,
            done: done_rx,
            member: MemberId::new(),
        }),
        Ok(Err(message)) => {
            join.abort();
            anyhow::bail!("worker init failed: {message}")
        }
        Err(_) => {
            join.abort();
            anyhow::bail!("worker exited during startup")
        }
    }
}

/// The worker task: initialize user state once, then execute leased jobs
/// strictly in order until the monitor goes away.
async fn worker_loop(
    module: Arc<dyn ErasedWorkerModule>,
    init_args: Value,
    ctx: WorkerContext,
    ready: oneshot::Sender<Result<(), String>>,
    mut feed: mpsc::Receiver<Job>,
    done: mpsc::Sender<JobId>,
) -> anyhow::Result<()> {
    let mut state = match module.boot(&init_args).await {
        Ok(state) => {
            let _ = ready.send(Ok(()));
            state
        }
        Err(err) => {
            let _ = ready.send(Err(format!("{err:#}")));
            return Err(err);
        }
    };
    debug!(pool = %ctx.pool, "worker ready");

    while let Some(job) = feed.recv().await {
        execute(&module, &ctx, &mut state, job, &done).await?;
    }

    debug!(pool = %ctx.pool, "worker feed closed, exiting");
    Ok(())
}

/// Run one job: dispatch the task, ack through the nearest queue
/// producer, reply if a reply is expected, then report completion. A task
/// error propagates out and takes the worker down; that exit is the
/// failure signal the monitor acts on.
async fn execute(
    module: &Arc<dyn ErasedWorkerModule>,
    ctx: &WorkerContext,
    state: &mut WorkerState,
    mut job: Job,
    done: &mpsc::Sender<JobId>,
) -> anyhow::Result<()> {
    let job_id = job.id;
    debug!(job = %job_id, task = %job.task, "executing");

    let value = match module.dispatch(&job.task, state).await {
        Ok(value) => value,
        Err(err) => {
            error!(job = %job_id, err = %format!("{err:#}"), "task failed");
            return Err(err);
        }
    };

    job.result = Some(value.clone());
    match ctx.registry.closest_producer(&ctx.pool) {
        Some(producer) => {
            if producer.ack(job.clone()).await.is_err() {
                warn!(job = %job_id, "queue producer gone before ack; job will be redelivered");
            }
        }
        None => {
            warn!(job = %job_id, "no queue producer to ack; job will be redelivered");
        }
    }

    if let Some(from) = job.from {
        ctx.replies.deliver(from.request, value);
    }

    let _ = done.send(job_id).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{NodeId, Task};
    use async_trait::async_trait;
    use serde_json::json;

    struct Flaky;

    #[async_trait]
    impl WorkerModule for Flaky {
        type State = u32;

        async fn init(&self, args: &Value) -> anyhow::Result<u32> {
            if args.get("fail_init").is_some() {
                anyhow::bail!("refusing to start");
            }
            Ok(0)
        }

        async fn call(
            &self,
            method: &str,
            _args: &[Value],
            state: &mut u32,
        ) -> anyhow::Result<Value> {
            match method {
                "bump" => {
                    *state += 1;
                    Ok(json!(*state))
                }
                "explode" => anyhow::bail!("boom"),
                other => anyhow::bail!("unknown method: {other}"),
            }
        }
    }

    fn context() -> WorkerContext {
        WorkerContext {
            pool: PoolId::local("worker-test"),
            registry: Arc::new(PoolRegistry::new(NodeId::default())),
            replies: ReplyRouter::new(),
        }
    }

    fn erased() -> Arc<dyn ErasedWorkerModule> {
        Arc::new(ModuleAdapter::new(Flaky))
    }

    #[tokio::test]
    async fn init_failure_surfaces_to_the_spawner() {
        let err = spawn_worker(erased(), json!({"fail_init": true}), context())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("worker init failed"));
    }

    #[tokio::test]
    async fn worker_executes_jobs_in_order_and_reports_done() {
        let link = spawn_worker(erased(), Value::Null, context())
            .await
            .unwrap();
        let mut done = link.done;

        for _ in 0..2 {
            link.feed.send(Job::new(Task::method("bump"))).await.unwrap();
        }
        let first = done.recv().await.unwrap();
        let second = done.recv().await.unwrap();
        assert_ne!(first, second);

        drop(link.feed);
        assert!(link.join.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn task_failure_kills_the_worker() {
        let link = spawn_worker(erased(), Value::Null, context())
            .await
            .unwrap();

        link.feed
            .send(Job::new(Task::method("explode")))
            .await
            .unwrap();

        let exit = link.join.await.unwrap();
        assert!(exit.is_err());
        assert!(link.feed.is_closed());
    }

    #[tokio::test]
    async fn reply_is_delivered_for_jobs_that_expect_one() {
        use crate::job::{OwnerId, ReplyTo, RequestId};

        let ctx = context();
        let replies = Arc::clone(&ctx.replies);
        let link = spawn_worker(erased(), Value::Null, ctx).await.unwrap();

        let request = RequestId::new();
        replies.register(request);
        let job = Job::new(Task::method("bump")).with_reply(ReplyTo {
            owner: OwnerId::new(),
            request,
        });
        link.feed.send(job).await.unwrap();

        let value = replies
            .wait(request, std::time::Duration::from_secs(1))
            .await;
        assert_eq!(value, Some(json!(1)));
    }
}
