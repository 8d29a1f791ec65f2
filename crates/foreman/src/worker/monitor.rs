//! Worker monitors
//!
//! A monitor owns exactly one worker and the job currently leased to it.
//! Queue producers cannot observe worker deaths fast enough to requeue
//! work, and a worker cannot report its own death, so the monitor binds
//! "currently leased job" to "worker lifetime": when the worker exits
//! while a job is held, the monitor invokes the pool's failure mode with
//! that job.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn};

use crate::failure::{FailureContext, FailureMode};
use crate::job::JobId;
use crate::pool::PoolId;
use crate::queue::{ConsumerRef, JobDelivery, ProducerHandle};
use crate::registry::{Member, MemberId, PoolRegistry, RegistryError, Role, Scope};
use crate::reply::ReplyRouter;

use super::{spawn_worker, ErasedWorkerModule, WorkerContext, WorkerLink};

pub(crate) enum MonitorMsg {
    /// (Re-)issue demand to every local queue producer.
    SubscribeToQueues,
    /// Is a job currently leased?
    IsBusy(oneshot::Sender<bool>),
    Stop,
}

/// Cloneable mailbox handle to a worker monitor.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    pub(crate) id: MemberId,
    tx: mpsc::Sender<MonitorMsg>,
}

impl MonitorHandle {
    fn channel() -> (Self, mpsc::Receiver<MonitorMsg>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Self {
                id: MemberId::new(),
                tx,
            },
            rx,
        )
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) async fn subscribe_to_queues(&self) {
        let _ = self.tx.send(MonitorMsg::SubscribeToQueues).await;
    }

    /// `None` when the monitor is restarting.
    pub(crate) async fn is_busy(&self) -> Option<bool> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(MonitorMsg::IsBusy(tx)).await.ok()?;
        rx.await.ok()
    }

    pub(crate) async fn stop(&self) {
        let _ = self.tx.send(MonitorMsg::Stop).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum MonitorError {
    #[error("worker died: {0}")]
    WorkerDied(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The job handed to the worker and the producer that supplied it.
struct Lease {
    job: crate::job::Job,
    source: ProducerHandle,
}

pub(crate) struct WorkerMonitor {
    pool: PoolId,
    module: Arc<dyn ErasedWorkerModule>,
    failure: Arc<dyn FailureMode>,
    registry: Arc<PoolRegistry>,
    replies: Arc<ReplyRouter>,
    init_args: Value,
    init_retry: Duration,
    handle: MonitorHandle,
    ctrl: mpsc::Receiver<MonitorMsg>,
    jobs_tx: mpsc::Sender<JobDelivery>,
    jobs_rx: mpsc::Receiver<JobDelivery>,
    current: Option<Lease>,
    /// Jobs received while one is leased (possible with several
    /// producers); leased strictly one at a time.
    backlog: VecDeque<JobDelivery>,
    /// Producers currently holding one of our demand units.
    demanded: HashSet<MemberId>,
}

impl WorkerMonitor {
    pub fn new(
        pool: PoolId,
        module: Arc<dyn ErasedWorkerModule>,
        failure: Arc<dyn FailureMode>,
        registry: Arc<PoolRegistry>,
        replies: Arc<ReplyRouter>,
        init_args: Value,
        init_retry: Duration,
    ) -> (Self, MonitorHandle) {
        let (handle, ctrl) = MonitorHandle::channel();
        let (jobs_tx, jobs_rx) = mpsc::channel(16);
        let monitor = Self {
            pool,
            module,
            failure,
            registry,
            replies,
            init_args,
            init_retry,
            handle: handle.clone(),
            ctrl,
            jobs_tx,
            jobs_rx,
            current: None,
            backlog: VecDeque::new(),
            demanded: HashSet::new(),
        };
        (monitor, handle)
    }

    #[instrument(name = "worker_monitor", skip(self), fields(pool = %self.pool))]
    pub async fn run(mut self) -> Result<(), MonitorError> {
        let Some(worker) = self.boot_worker().await else {
            // Stopped while still retrying init; nothing was registered.
            return Ok(());
        };

        self.registry.join(
            &self.pool,
            Role::WorkerMonitors,
            Member::Monitor(self.handle.clone()),
        )?;
        self.registry
            .join(&self.pool, Role::Workers, Member::Worker(worker.worker_ref()))?;

        // Self-post so subscription happens from the main loop, after the
        // worker is wired up.
        let _ = self.handle.tx.send(MonitorMsg::SubscribeToQueues).await;
        info!("worker monitor up");

        let (worker, outcome) = self.event_loop(worker).await;
        self.terminate(worker, outcome).await
    }

    /// Bring up the worker, retrying failed inits after `init_retry`.
    /// Returns `None` when asked to stop first.
    async fn boot_worker(&mut self) -> Option<WorkerLink> {
        loop {
            let ctx = WorkerContext {
                pool: self.pool.clone(),
                registry: Arc::clone(&self.registry),
                replies: Arc::clone(&self.replies),
            };
            match spawn_worker(Arc::clone(&self.module), self.init_args.clone(), ctx).await {
                Ok(worker) => return Some(worker),
                Err(err) => {
                    warn!(%err, retry_in = ?self.init_retry, "worker init failed, scheduling retry");
                    let retry = tokio::time::sleep(self.init_retry);
                    tokio::pin!(retry);
                    loop {
                        tokio::select! {
                            _ = &mut retry => break,
                            msg = self.ctrl.recv() => match msg {
                                None | Some(MonitorMsg::Stop) => return None,
                                Some(MonitorMsg::IsBusy(reply)) => {
                                    let _ = reply.send(false);
                                }
                                Some(MonitorMsg::SubscribeToQueues) => {}
                            },
                        }
                    }
                }
            }
        }
    }

    async fn event_loop(
        &mut self,
        mut worker: WorkerLink,
    ) -> (WorkerLink, Result<(), MonitorError>) {
        let outcome = loop {
            tokio::select! {
                msg = self.ctrl.recv() => match msg {
                    None | Some(MonitorMsg::Stop) => break Ok(()),
                    Some(MonitorMsg::SubscribeToQueues) => self.subscribe_to_queues().await,
                    Some(MonitorMsg::IsBusy(reply)) => {
                        let _ = reply.send(self.current.is_some());
                    }
                },
                Some(delivery) = self.jobs_rx.recv() => self.accept(delivery, &mut worker).await,
                Some(job_id) = worker.done.recv() => self.on_job_done(job_id, &mut worker).await,
                exit = &mut worker.join => {
                    break Err(MonitorError::WorkerDied(describe_exit(exit)));
                }
            }
        };
        (worker, outcome)
    }

    /// Issue one demand unit to every local producer we do not already
    /// have one with. Safe to call repeatedly; also the re-subscription
    /// path after a producer restart.
    async fn subscribe_to_queues(&mut self) {
        let producers: Vec<ProducerHandle> = self
            .registry
            .members(&self.pool, Role::Queues, Scope::Local)
            .into_iter()
            .filter_map(|m| m.as_producer().cloned())
            .collect();

        // Demand held by producers that no longer exist is gone with them.
        let live: HashSet<MemberId> = producers.iter().map(|p| p.id).collect();
        self.demanded.retain(|id| live.contains(id));

        // Producers whose job we are still working on are covered too.
        let mut covered = self.demanded.clone();
        if let Some(lease) = &self.current {
            covered.insert(lease.source.id);
        }
        for pending in &self.backlog {
            covered.insert(pending.source.id);
        }

        for producer in producers {
            if covered.contains(&producer.id) {
                continue;
            }
            covered.insert(producer.id);
            self.issue_demand(producer).await;
        }
    }

    async fn issue_demand(&mut self, producer: ProducerHandle) {
        let consumer = ConsumerRef {
            id: self.handle.id,
            sink: self.jobs_tx.clone(),
        };
        if producer.demand(consumer).await.is_ok() {
            self.demanded.insert(producer.id);
        } else {
            // Producer restarting; the pool re-broadcasts subscription
            // once its replacement is up.
            debug!("producer gone while issuing demand");
        }
    }

    /// Inbound job event: stamp the processing node, then lease it to the
    /// worker, or hold it if a job is already in flight.
    async fn accept(&mut self, mut delivery: JobDelivery, worker: &mut WorkerLink) {
        delivery.job.by = Some(self.registry.node().clone());
        self.demanded.remove(&delivery.source.id);

        if self.current.is_some() {
            self.backlog.push_back(delivery);
            return;
        }
        self.lease(delivery, worker).await;
    }

    async fn lease(&mut self, delivery: JobDelivery, worker: &mut WorkerLink) {
        let JobDelivery { job, source } = delivery;
        debug!(job = %job.id, "leasing job to worker");
        self.current = Some(Lease {
            job: job.clone(),
            source,
        });
        if worker.feed.send(job).await.is_err() {
            // Worker is on its way down; the exit branch fires next and
            // the failure mode covers the job we just leased.
            warn!("worker feed closed while leasing");
        }
    }

    async fn on_job_done(&mut self, job_id: JobId, worker: &mut WorkerLink) {
        match self.current.take() {
            Some(lease) if lease.job.id == job_id => {
                debug!(job = %job_id, "job done, renewing demand");
                self.issue_demand(lease.source).await;
            }
            other => {
                warn!(job = %job_id, "completion for a job that is not leased");
                self.current = other;
            }
        }
        if self.current.is_none() {
            if let Some(next) = self.backlog.pop_front() {
                self.lease(next, worker).await;
            }
        }
    }

    /// Termination path. Runs on every exit: a leased job goes to the
    /// failure mode on a detached task so a slow handler never blocks the
    /// supervisor's restart; jobs never handed to the worker go straight
    /// back to their queues.
    async fn terminate(
        mut self,
        worker: WorkerLink,
        outcome: Result<(), MonitorError>,
    ) -> Result<(), MonitorError> {
        self.registry
            .leave(&self.pool, Role::WorkerMonitors, self.handle.id);
        self.registry.leave(&self.pool, Role::Workers, worker.member);

        if let Some(lease) = self.current.take() {
            warn!(job = %lease.job.id, "stopping while holding a job, invoking failure mode");
            let failure = Arc::clone(&self.failure);
            let ctx = FailureContext::new(
                self.pool.clone(),
                lease.job,
                Arc::clone(&self.registry),
            );
            tokio::spawn(async move { failure.handle_failure(ctx).await });
        }

        self.jobs_rx.close();
        while let Some(delivery) = self.backlog.pop_front() {
            let _ = delivery.source.nack(delivery.job).await;
        }
        while let Ok(delivery) = self.jobs_rx.try_recv() {
            let _ = delivery.source.nack(delivery.job).await;
        }

        worker.join.abort();

        match &outcome {
            Ok(()) => info!("worker monitor stopped"),
            Err(err) => error!(%err, "worker monitor stopping"),
        }
        outcome
    }
}

fn describe_exit(exit: Result<anyhow::Result<()>, JoinError>) -> String {
    match exit {
        Ok(Ok(())) => "worker exited unexpectedly".to_string(),
        Ok(Err(err)) => format!("task failed: {err:#}"),
        Err(err) if err.is_panic() => "task panicked".to_string(),
        Err(_) => "worker task cancelled".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureMode;
    use crate::job::{Job, NodeId, Task};
    use crate::worker::{ModuleAdapter, WorkerModule};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    struct Toggle;

    #[async_trait]
    impl WorkerModule for Toggle {
        type State = ();

        async fn init(&self, args: &Value) -> anyhow::Result<()> {
            if args.get("fail_init").is_some() {
                anyhow::bail!("nope");
            }
            Ok(())
        }

        async fn call(
            &self,
            method: &str,
            _args: &[Value],
            _state: &mut (),
        ) -> anyhow::Result<Value> {
            match method {
                "ok" => Ok(json!("ok")),
                "die" => anyhow::bail!("task blew up"),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                }
                other => anyhow::bail!("unknown method: {other}"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingFailure {
        seen: Mutex<Vec<(PoolId, crate::job::JobId)>>,
    }

    #[async_trait]
    impl FailureMode for RecordingFailure {
        async fn handle_failure(&self, ctx: FailureContext) {
            self.seen
                .lock()
                .push((ctx.pool().clone(), ctx.job().id));
        }
    }

    struct Fixture {
        monitor_handle: MonitorHandle,
        monitor_join: tokio::task::JoinHandle<Result<(), MonitorError>>,
        producer_handle: ProducerHandle,
        producer_rx: mpsc::Receiver<crate::queue::ProducerCommand>,
        failure: Arc<RecordingFailure>,
        pool: PoolId,
        registry: Arc<PoolRegistry>,
    }

    async fn start_monitor(init_args: Value) -> Fixture {
        let pool = PoolId::local("monitor-test");
        let registry = Arc::new(PoolRegistry::new(NodeId::default()));
        registry.create(&pool);

        let (producer_handle, producer_rx) = ProducerHandle::channel();
        registry
            .join(&pool, Role::Queues, Member::Producer(producer_handle.clone()))
            .unwrap();

        let failure = Arc::new(RecordingFailure::default());
        let (monitor, monitor_handle) = WorkerMonitor::new(
            pool.clone(),
            Arc::new(ModuleAdapter::new(Toggle)),
            Arc::clone(&failure) as Arc<dyn FailureMode>,
            Arc::clone(&registry),
            ReplyRouter::new(),
            init_args,
            Duration::from_millis(20),
        );
        let monitor_join = tokio::spawn(monitor.run());

        Fixture {
            monitor_handle,
            monitor_join,
            producer_handle,
            producer_rx,
            failure,
            pool,
            registry,
        }
    }

    /// Pull the demand unit the monitor sends on startup.
    async fn expect_demand(fx: &mut Fixture) -> ConsumerRef {
        loop {
            match fx.producer_rx.recv().await.expect("producer command") {
                crate::queue::ProducerCommand::Demand(consumer) => return consumer,
                _ => continue,
            }
        }
    }

    fn deliver(fx: &Fixture, consumer: &ConsumerRef, task: Task) -> Job {
        let job = Job::new(task);
        let delivery = JobDelivery {
            job: job.clone(),
            source: fx.producer_handle.clone(),
        };
        consumer.sink.try_send(delivery).expect("monitor accepts");
        job
    }

    #[tokio::test]
    async fn monitor_subscribes_with_one_demand_unit() {
        let mut fx = start_monitor(Value::Null).await;
        let consumer = expect_demand(&mut fx).await;
        assert!(!consumer.sink.is_closed());

        // Exactly one unit; nothing further without a completed job.
        assert!(fx.producer_rx.try_recv().is_err());

        fx.monitor_handle.stop().await;
        fx.monitor_join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn job_flows_through_and_demand_renews() {
        let mut fx = start_monitor(Value::Null).await;
        let consumer = expect_demand(&mut fx).await;

        let job = deliver(&fx, &consumer, Task::method("ok"));

        // Worker acks through the registry's producer...
        let acked = loop {
            match fx.producer_rx.recv().await.unwrap() {
                crate::queue::ProducerCommand::Ack(j) => break j,
                _ => continue,
            }
        };
        assert_eq!(acked.id, job.id);
        assert_eq!(acked.result, Some(json!("ok")));
        assert_eq!(acked.by.as_ref(), Some(fx.registry.node()));

        // ...and the monitor renews one demand unit.
        let renewed = expect_demand(&mut fx).await;
        assert!(!renewed.sink.is_closed());

        fx.monitor_handle.stop().await;
        fx.monitor_join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn busy_flag_tracks_the_lease() {
        let mut fx = start_monitor(Value::Null).await;
        let consumer = expect_demand(&mut fx).await;

        assert_eq!(fx.monitor_handle.is_busy().await, Some(false));

        deliver(&fx, &consumer, Task::method("hang"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.monitor_handle.is_busy().await, Some(true));
    }

    #[tokio::test]
    async fn worker_death_invokes_the_failure_mode_with_the_held_job() {
        let mut fx = start_monitor(Value::Null).await;
        let consumer = expect_demand(&mut fx).await;

        let job = deliver(&fx, &consumer, Task::method("die"));

        let outcome = fx.monitor_join.await.unwrap();
        assert!(matches!(outcome, Err(MonitorError::WorkerDied(_))));

        // Detached failure task needs a beat to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = fx.failure.seen.lock().clone();
        assert_eq!(seen, vec![(fx.pool.clone(), job.id)]);
    }

    #[tokio::test]
    async fn clean_stop_without_a_lease_skips_the_failure_mode() {
        let mut fx = start_monitor(Value::Null).await;
        let _consumer = expect_demand(&mut fx).await;

        fx.monitor_handle.stop().await;
        fx.monitor_join.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.failure.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn init_failure_keeps_retrying_until_stopped() {
        let mut fx = start_monitor(json!({"fail_init": true})).await;

        // Never subscribes while init keeps failing.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fx.producer_rx.try_recv().is_err());
        assert_eq!(fx.monitor_handle.is_busy().await, Some(false));

        fx.monitor_handle.stop().await;
        fx.monitor_join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_job_is_buffered_until_the_first_completes() {
        let mut fx = start_monitor(Value::Null).await;
        let consumer = expect_demand(&mut fx).await;

        deliver(&fx, &consumer, Task::method("hang"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let buffered = deliver(&fx, &consumer, Task::method("ok"));
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Still exactly one in flight; the second job was not acked.
        assert_eq!(fx.monitor_handle.is_busy().await, Some(true));
        assert!(fx.producer_rx.try_recv().is_err());

        // On stop, the buffered job is returned to its queue.
        fx.monitor_handle.stop().await;
        fx.monitor_join.await.unwrap().unwrap();
        let nacked = loop {
            match fx.producer_rx.recv().await.unwrap() {
                crate::queue::ProducerCommand::Nack(j) => break j,
                _ => continue,
            }
        };
        assert_eq!(nacked.id, buffered.id);
    }
}
