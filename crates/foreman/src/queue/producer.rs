//! Queue producer
//!
//! Owns the backend queue for a pool and releases jobs downstream only
//! when a monitor has asked for one. The producer is a mailbox task; all
//! public interaction goes through [`ProducerHandle`].
//!
//! Dispatch states:
//!
//! - *Idle*: no push subscription. Incoming demand polls the backend
//!   once per unit; when the poll comes back empty the producer starts a
//!   push subscription sized by the pending demand.
//! - *Subscribed*: the backend pushes deliveries. Emitting the last
//!   demanded job cancels the subscription first, so the producer never
//!   holds jobs it has no consumer for. A delivery that races the
//!   cancellation is rejected back onto the queue.
//! - *Suspended*: no polling, no subscribing; inbound deliveries are
//!   rejected with redelivery and demand is held until resume.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendError, Delivery, DeliveryTag, QueueBackend, SubscriptionId};
use crate::config::PoolConfig;
use crate::job::Job;
use crate::pool::PoolId;
use crate::registry::{MemberId, PoolRegistry, Role};

use super::Dispatcher;

/// Predicate used by `filter`.
pub(crate) type JobPredicate = Arc<dyn Fn(&Job) -> bool + Send + Sync>;

/// Backend depth plus the suspension flag.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatus {
    pub depth: u64,
    pub suspended: bool,
}

/// The producer's mailbox has closed (component restart in progress or
/// pool shutdown).
#[derive(Debug, thiserror::Error)]
#[error("queue producer is gone")]
pub struct ProducerGone;

/// One monitor willing to accept one job.
#[derive(Debug, Clone)]
pub(crate) struct ConsumerRef {
    pub id: MemberId,
    pub sink: mpsc::Sender<JobDelivery>,
}

/// A job handed downstream, tagged with the producer it came from so the
/// consumer can ask it for more.
#[derive(Debug)]
pub(crate) struct JobDelivery {
    pub job: Job,
    pub source: ProducerHandle,
}

pub(crate) enum ProducerCommand {
    Enqueue(Job),
    Ack(Job),
    Nack(Job),
    Suspend,
    Resume,
    Status(oneshot::Sender<QueueStatus>),
    Filter(JobPredicate, oneshot::Sender<Result<Vec<Job>, BackendError>>),
    Demand(ConsumerRef),
    Stop,
}

/// Cloneable mailbox handle to a queue producer.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    pub(crate) id: MemberId,
    tx: mpsc::Sender<ProducerCommand>,
}

impl ProducerHandle {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<ProducerCommand>) {
        let (tx, rx) = mpsc::channel(64);
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

    async fn send(&self, cmd: ProducerCommand) -> Result<(), ProducerGone> {
        self.tx.send(cmd).await.map_err(|_| ProducerGone)
    }

    /// Serialize and publish a job. Fire-and-forget beyond mailbox entry.
    pub async fn enqueue(&self, job: Job) -> Result<(), ProducerGone> {
        self.send(ProducerCommand::Enqueue(job)).await
    }

    /// Acknowledge a processed job using its delivery credentials.
    pub async fn ack(&self, job: Job) -> Result<(), ProducerGone> {
        self.send(ProducerCommand::Ack(job)).await
    }

    /// Reject a job back onto the queue.
    pub async fn nack(&self, job: Job) -> Result<(), ProducerGone> {
        self.send(ProducerCommand::Nack(job)).await
    }

    pub async fn suspend(&self) -> Result<(), ProducerGone> {
        self.send(ProducerCommand::Suspend).await
    }

    pub async fn resume(&self) -> Result<(), ProducerGone> {
        self.send(ProducerCommand::Resume).await
    }

    /// Backend-reported queue depth plus the suspension flag.
    pub async fn status(&self) -> Result<QueueStatus, ProducerGone> {
        let (tx, rx) = oneshot::channel();
        self.send(ProducerCommand::Status(tx)).await?;
        rx.await.map_err(|_| ProducerGone)
    }

    /// Best-effort snapshot of queued jobs matching `predicate`.
    pub(crate) async fn filter(
        &self,
        predicate: JobPredicate,
    ) -> Result<Result<Vec<Job>, BackendError>, ProducerGone> {
        let (tx, rx) = oneshot::channel();
        self.send(ProducerCommand::Filter(predicate, tx)).await?;
        rx.await.map_err(|_| ProducerGone)
    }

    /// Register one unit of demand from a monitor.
    pub(crate) async fn demand(&self, consumer: ConsumerRef) -> Result<(), ProducerGone> {
        self.send(ProducerCommand::Demand(consumer)).await
    }

    pub(crate) async fn stop(&self) {
        let _ = self.send(ProducerCommand::Stop).await;
    }
}

struct ActiveSubscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<Delivery>,
}

pub(crate) struct QueueProducer {
    pool: PoolId,
    queue: String,
    exchange: String,
    durable: bool,
    prefetch: u16,
    backend: Arc<dyn QueueBackend>,
    registry: Arc<PoolRegistry>,
    handle: ProducerHandle,
    rx: mpsc::Receiver<ProducerCommand>,
    demand: Dispatcher,
    subscription: Option<ActiveSubscription>,
    suspended: bool,
}

impl QueueProducer {
    pub fn new(
        pool: PoolId,
        config: &PoolConfig,
        backend: Arc<dyn QueueBackend>,
        registry: Arc<PoolRegistry>,
    ) -> (Self, ProducerHandle) {
        let (handle, rx) = ProducerHandle::channel();
        let producer = Self {
            queue: pool.queue_name(),
            pool,
            exchange: config.exchange.clone(),
            durable: config.durable,
            prefetch: config.prefetch.max(1),
            backend,
            registry,
            handle: handle.clone(),
            rx,
            demand: Dispatcher::new(config.dispatcher),
            subscription: None,
            suspended: false,
        };
        (producer, handle)
    }

    /// Run until stopped, the mailbox closes, or the backend fails. A
    /// backend failure is returned so the supervisor restarts the
    /// producer with a fresh connection. Registration happened at spawn
    /// time; this task only deregisters on the way out.
    #[instrument(name = "queue_producer", skip(self), fields(pool = %self.pool, queue = %self.queue))]
    pub async fn run(mut self) -> Result<(), BackendError> {
        self.backend.declare(&self.queue, self.durable).await?;
        info!("queue producer up");

        let result = self.event_loop().await;

        self.registry.leave(&self.pool, Role::Queues, self.handle.id);
        if let Err(err) = self.cancel_subscription().await {
            warn!(%err, "failed to cancel subscription during shutdown");
        }
        if let Err(err) = &result {
            error!(%err, "queue producer stopping on error");
        } else {
            info!("queue producer stopped");
        }
        result
    }

    async fn event_loop(&mut self) -> Result<(), BackendError> {
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    None | Some(ProducerCommand::Stop) => return Ok(()),
                    Some(cmd) => self.handle_command(cmd).await?,
                },
                delivery = Self::next_delivery(&mut self.subscription) => match delivery {
                    Some(delivery) => self.on_delivery(delivery).await?,
                    None => {
                        // Backend-initiated cancel; exit normally and let
                        // the supervisor bring up a fresh producer.
                        info!("subscription closed by the backend");
                        self.subscription = None;
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn next_delivery(subscription: &mut Option<ActiveSubscription>) -> Option<Delivery> {
        match subscription {
            Some(sub) => sub.rx.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_command(&mut self, cmd: ProducerCommand) -> Result<(), BackendError> {
        match cmd {
            ProducerCommand::Enqueue(job) => self.enqueue(job).await,
            ProducerCommand::Ack(job) => {
                self.settle(&job, true).await;
                Ok(())
            }
            ProducerCommand::Nack(job) => {
                self.settle(&job, false).await;
                Ok(())
            }
            ProducerCommand::Suspend => {
                if !self.suspended {
                    info!("suspending");
                    self.suspended = true;
                    self.cancel_subscription().await?;
                }
                Ok(())
            }
            ProducerCommand::Resume => {
                if self.suspended {
                    info!("resuming");
                    self.suspended = false;
                    self.pump().await?;
                }
                Ok(())
            }
            ProducerCommand::Status(reply) => {
                let depth = self.backend.depth(&self.queue).await?;
                let _ = reply.send(QueueStatus {
                    depth,
                    suspended: self.suspended,
                });
                Ok(())
            }
            ProducerCommand::Filter(predicate, reply) => {
                let _ = reply.send(self.snapshot(predicate).await);
                Ok(())
            }
            ProducerCommand::Demand(consumer) => {
                debug!(consumer = ?consumer.id, "demand received");
                self.demand.push(consumer);
                if self.suspended {
                    debug!("suspended, holding demand");
                    return Ok(());
                }
                self.pump().await
            }
            ProducerCommand::Stop => Ok(()),
        }
    }

    async fn enqueue(&mut self, job: Job) -> Result<(), BackendError> {
        let payload = match job.encode() {
            Ok(payload) => payload,
            Err(err) => {
                error!(job = %job.id, %err, "dropping job that failed to serialize");
                return Ok(());
            }
        };
        self.backend
            .publish(&self.exchange, &self.queue, payload, true)
            .await?;
        debug!(job = %job.id, task = %job.task, "enqueued");
        Ok(())
    }

    /// Ack or nack a job using its delivery credentials. Settlement
    /// failures are expected under at-least-once delivery (the tag may
    /// have expired and the job been redelivered) and are not fatal.
    async fn settle(&mut self, job: &Job, ack: bool) {
        let Some(tag) = job.private else {
            warn!(job = %job.id, "job carries no delivery credentials, cannot settle");
            return;
        };
        let outcome = if ack {
            self.backend.ack(tag).await
        } else {
            self.backend.reject(tag, true).await
        };
        match outcome {
            Ok(()) => debug!(job = %job.id, %tag, ack, "settled"),
            Err(err) => warn!(job = %job.id, %tag, %err, "settlement failed"),
        }
    }

    /// Idle-state dispatch: poll once per pending demand unit; subscribe
    /// when the queue runs dry with demand still pending.
    async fn pump(&mut self) -> Result<(), BackendError> {
        if self.suspended || self.subscription.is_some() {
            return Ok(());
        }
        self.demand.prune();
        while !self.demand.is_empty() {
            match self.backend.get(&self.queue).await? {
                Some(delivery) => self.emit(delivery).await?,
                None => {
                    let (tx, rx) = mpsc::channel(self.prefetch as usize);
                    let id = self.backend.subscribe(&self.queue, self.prefetch, tx).await?;
                    debug!(outstanding = self.demand.len(), "queue empty, subscribed for pushes");
                    self.subscription = Some(ActiveSubscription { id, rx });
                    break;
                }
            }
        }
        Ok(())
    }

    async fn on_delivery(&mut self, delivery: Delivery) -> Result<(), BackendError> {
        if self.suspended {
            self.requeue(delivery.tag).await;
            return Ok(());
        }
        self.demand.prune();
        if self.demand.is_empty() {
            // A delivery raced the cancellation, or every consumer that
            // demanded has since died. Either way there is no demand.
            debug!(tag = %delivery.tag, "delivery without outstanding demand, requeueing");
            self.cancel_subscription().await?;
            self.requeue(delivery.tag).await;
            return Ok(());
        }
        if self.demand.len() == 1 {
            // Last demanded job: cancel before emitting so no further
            // pushes arrive without a consumer.
            self.cancel_subscription().await?;
        }
        self.emit(delivery).await
    }

    /// Hand one delivery to one demand unit.
    async fn emit(&mut self, delivery: Delivery) -> Result<(), BackendError> {
        let tag = delivery.tag;
        let mut job = match Job::decode(&delivery.payload) {
            Ok(job) => job,
            Err(err) => {
                warn!(%tag, %err, "dead-lettering undecodable payload");
                if let Err(err) = self.backend.reject(tag, false).await {
                    warn!(%tag, %err, "failed to reject undecodable payload");
                }
                return Ok(());
            }
        };
        job.private = Some(tag);

        let Some(consumer) = self.demand.pop() else {
            self.requeue(tag).await;
            return Ok(());
        };
        let event = JobDelivery {
            job,
            source: self.handle.clone(),
        };
        if consumer.sink.send(event).await.is_err() {
            // The monitor died between demanding and delivery; put the
            // job back so a live monitor picks it up.
            warn!(consumer = ?consumer.id, "consumer vanished, requeueing job");
            self.requeue(tag).await;
        }
        Ok(())
    }

    async fn requeue(&self, tag: DeliveryTag) {
        if let Err(err) = self.backend.reject(tag, true).await {
            warn!(%tag, %err, "failed to requeue delivery");
        }
    }

    async fn cancel_subscription(&mut self) -> Result<(), BackendError> {
        let Some(mut sub) = self.subscription.take() else {
            return Ok(());
        };
        match self.backend.cancel(&self.queue, sub.id).await {
            Ok(()) => {}
            Err(BackendError::UnknownSubscription) => {
                warn!("subscription already gone on cancel")
            }
            Err(err) => return Err(err),
        }
        // Deliveries that were already in flight re-enter the queue.
        sub.rx.close();
        while let Ok(delivery) = sub.rx.try_recv() {
            self.requeue(delivery.tag).await;
        }
        Ok(())
    }

    async fn snapshot(&self, predicate: JobPredicate) -> Result<Vec<Job>, BackendError> {
        let payloads = self.backend.peek(&self.queue).await?;
        Ok(payloads
            .iter()
            .filter_map(|p| Job::decode(p).ok())
            .filter(|job| predicate(job))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBroker;
    use crate::job::{NodeId, Task};

    fn fixture() -> (QueueProducer, ProducerHandle, Arc<MemoryBroker>) {
        let pool = PoolId::local("prod-test");
        let backend = Arc::new(MemoryBroker::new());
        let registry = Arc::new(PoolRegistry::new(NodeId::default()));
        registry.create(&pool);
        let config = PoolConfig::new("prod-test");
        let (producer, handle) = QueueProducer::new(
            pool,
            &config,
            Arc::clone(&backend) as Arc<dyn QueueBackend>,
            registry,
        );
        (producer, handle, backend)
    }

    fn consumer() -> (ConsumerRef, mpsc::Receiver<JobDelivery>) {
        let (tx, rx) = mpsc::channel(4);
        (
            ConsumerRef {
                id: MemberId::new(),
                sink: tx,
            },
            rx,
        )
    }

    async fn publish_job(backend: &MemoryBroker, queue: &str) -> Job {
        let job = Job::new(Task::Run);
        backend
            .publish("", queue, job.encode().unwrap(), true)
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn demand_with_ready_job_emits_without_subscribing() {
        let (mut producer, _handle, backend) = fixture();
        backend.declare(&producer.queue, true).await.unwrap();
        let job = publish_job(&backend, &producer.queue).await;

        let (c, mut rx) = consumer();
        producer
            .handle_command(ProducerCommand::Demand(c))
            .await
            .unwrap();

        let delivery = rx.try_recv().expect("job emitted");
        assert_eq!(delivery.job.id, job.id);
        assert!(delivery.job.private.is_some());
        assert!(producer.subscription.is_none());
        assert!(producer.demand.is_empty());
    }

    #[tokio::test]
    async fn starved_demand_subscribes_and_push_satisfies_it() {
        let (mut producer, _handle, backend) = fixture();
        backend.declare(&producer.queue, true).await.unwrap();

        let (c, mut rx) = consumer();
        producer
            .handle_command(ProducerCommand::Demand(c))
            .await
            .unwrap();
        assert!(producer.subscription.is_some());

        let job = publish_job(&backend, &producer.queue).await;
        let delivery = producer
            .subscription
            .as_mut()
            .unwrap()
            .rx
            .recv()
            .await
            .expect("pushed");
        producer.on_delivery(delivery).await.unwrap();

        // Last demand unit: subscription cancelled before emitting.
        assert!(producer.subscription.is_none());
        assert_eq!(rx.try_recv().unwrap().job.id, job.id);
    }

    #[tokio::test]
    async fn delivery_without_demand_is_requeued() {
        let (mut producer, _handle, backend) = fixture();
        backend.declare(&producer.queue, true).await.unwrap();
        publish_job(&backend, &producer.queue).await;

        let delivery = backend.get(&producer.queue).await.unwrap().unwrap();
        producer.on_delivery(delivery).await.unwrap();

        let again = backend.get(&producer.queue).await.unwrap().expect("requeued");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn suspended_producer_holds_demand_and_requeues_deliveries() {
        let (mut producer, _handle, backend) = fixture();
        backend.declare(&producer.queue, true).await.unwrap();
        publish_job(&backend, &producer.queue).await;

        producer
            .handle_command(ProducerCommand::Suspend)
            .await
            .unwrap();

        let (c, mut rx) = consumer();
        producer
            .handle_command(ProducerCommand::Demand(c))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert!(producer.subscription.is_none());
        assert_eq!(producer.demand.len(), 1);

        // A straggler delivery while suspended goes straight back.
        let delivery = backend.get(&producer.queue).await.unwrap().unwrap();
        producer.on_delivery(delivery).await.unwrap();
        assert_eq!(backend.depth(&producer.queue).await.unwrap(), 1);

        // Resume replays the held demand.
        producer
            .handle_command(ProducerCommand::Resume)
            .await
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn status_reports_depth_and_suspension() {
        let (mut producer, _handle, backend) = fixture();
        backend.declare(&producer.queue, true).await.unwrap();
        publish_job(&backend, &producer.queue).await;
        producer
            .handle_command(ProducerCommand::Suspend)
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        producer
            .handle_command(ProducerCommand::Status(tx))
            .await
            .unwrap();
        let status = rx.await.unwrap();
        assert_eq!(status.depth, 1);
        assert!(status.suspended);
    }

    #[tokio::test]
    async fn filter_returns_matching_jobs() {
        let (mut producer, _handle, backend) = fixture();
        backend.declare(&producer.queue, true).await.unwrap();

        let wanted = Job::new(Task::method("thumbnail"));
        backend
            .publish("", &producer.queue, wanted.encode().unwrap(), true)
            .await
            .unwrap();
        backend
            .publish(
                "",
                &producer.queue,
                Job::new(Task::Run).encode().unwrap(),
                true,
            )
            .await
            .unwrap();

        let predicate: JobPredicate =
            Arc::new(|job: &Job| matches!(&job.task, Task::Method(m) if m == "thumbnail"));
        let (tx, rx) = oneshot::channel();
        producer
            .handle_command(ProducerCommand::Filter(predicate, tx))
            .await
            .unwrap();

        let jobs = rx.await.unwrap().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, wanted.id);
    }

    #[tokio::test]
    async fn dead_consumer_demand_requeues_the_job() {
        let (mut producer, _handle, backend) = fixture();
        backend.declare(&producer.queue, true).await.unwrap();
        publish_job(&backend, &producer.queue).await;

        let (c, rx) = consumer();
        drop(rx);
        producer
            .handle_command(ProducerCommand::Demand(c))
            .await
            .unwrap();

        // Demand evaporated with its consumer; the job is still queued.
        assert_eq!(backend.depth(&producer.queue).await.unwrap(), 1);
    }
}
