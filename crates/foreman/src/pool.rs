//! Pool runtime
//!
//! Starting a pool creates its registry groups, brings up the configured
//! queue producers and worker monitors, and runs a supervisor that
//! restarts whichever component exits. User errors never propagate this
//! far; a component exit here means a worker died, a backend connection
//! broke, or the pool is shutting down.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::api::Client;
use crate::backend::QueueBackend;
use crate::config::PoolConfig;
use crate::failure::FailureMode;
use crate::job::{Job, NodeId};
use crate::queue::{JobPredicate, QueueProducer, QueueStatus};
use crate::registry::{Member, PoolRegistry, RegistryError, Role, Scope};
use crate::reply::ReplyRouter;
use crate::worker::{ErasedWorkerModule, ModuleAdapter, WorkerModule, WorkerMonitor};

/// Delay before a crashed component is brought back.
const RESTART_BACKOFF: Duration = Duration::from_millis(200);

/// How long shutdown waits for components to drain before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Pool identity: a plain local name, or a name shared across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolId {
    Local(String),
    Global(String),
}

impl PoolId {
    pub fn local(name: impl Into<String>) -> Self {
        PoolId::Local(name.into())
    }

    pub fn global(name: impl Into<String>) -> Self {
        PoolId::Global(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            PoolId::Local(name) | PoolId::Global(name) => name,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, PoolId::Global(_))
    }

    /// Backend queue the pool's jobs live on.
    pub(crate) fn queue_name(&self) -> String {
        format!("foreman.{}", self.name())
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolId::Local(name) => write!(f, "{name}"),
            PoolId::Global(name) => write!(f, "global:{name}"),
        }
    }
}

/// Worker-side half of a pool status report.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WorkerStats {
    pub total: usize,
    /// Monitors currently holding a leased job.
    pub busy: usize,
}

/// Combined pool status.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatus {
    pub queue: QueueStatus,
    pub workers: WorkerStats,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No queue producer reachable; transient while a producer restarts.
    #[error("no queue producer available for pool {0}")]
    NoQueue(PoolId),

    /// The pool is shutting down.
    #[error("pool is shut down")]
    Closed,

    #[error(transparent)]
    Backend(#[from] crate::backend::BackendError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

enum ComponentKind {
    Producer,
    Monitor,
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentKind::Producer => write!(f, "queue producer"),
            ComponentKind::Monitor => write!(f, "worker monitor"),
        }
    }
}

struct PoolInner {
    id: PoolId,
    config: PoolConfig,
    registry: Arc<PoolRegistry>,
    replies: Arc<ReplyRouter>,
    backend: Arc<dyn QueueBackend>,
    module: Arc<dyn ErasedWorkerModule>,
    failure: Arc<dyn FailureMode>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// A running pool. Cloning shares the same pool; dropping does not stop
/// it, call [`Pool::shutdown`].
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Start a pool with its own single-node registry.
    pub async fn start<M: WorkerModule>(
        config: PoolConfig,
        module: M,
        backend: Arc<dyn QueueBackend>,
        failure: Arc<dyn FailureMode>,
    ) -> Result<Pool, PoolError> {
        let registry = Arc::new(PoolRegistry::new(NodeId::default()));
        Self::start_with_registry(registry, config, module, backend, failure).await
    }

    /// Start a pool on a shared registry, for processes hosting several
    /// pools or participating in a multi-node registry.
    pub async fn start_with_registry<M: WorkerModule>(
        registry: Arc<PoolRegistry>,
        config: PoolConfig,
        module: M,
        backend: Arc<dyn QueueBackend>,
        failure: Arc<dyn FailureMode>,
    ) -> Result<Pool, PoolError> {
        let id = if config.global {
            PoolId::global(&config.name)
        } else {
            PoolId::local(&config.name)
        };
        registry.create(&id);
        info!(pool = %id, num_queues = config.num_queues, num_workers = config.num_workers, "starting pool");

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            id,
            config,
            registry,
            replies: ReplyRouter::new(),
            backend,
            module: Arc::new(ModuleAdapter::new(module)),
            failure,
            shutdown,
            supervisor: Mutex::new(None),
        });

        let pool = Pool { inner };
        pool.spawn_supervisor()?;
        Ok(pool)
    }

    pub fn id(&self) -> &PoolId {
        &self.inner.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// A fresh submitter identity on this pool.
    pub fn client(&self) -> Client {
        Client::new(self.clone())
    }

    pub(crate) fn registry(&self) -> &Arc<PoolRegistry> {
        &self.inner.registry
    }

    pub(crate) fn replies(&self) -> &Arc<ReplyRouter> {
        &self.inner.replies
    }

    /// Stop delivering jobs to workers. Enqueueing keeps working.
    pub async fn suspend(&self) -> Result<(), PoolError> {
        let producers = self.producers(Scope::Cluster);
        if producers.is_empty() {
            return Err(PoolError::NoQueue(self.inner.id.clone()));
        }
        join_all(producers.iter().map(|p| p.suspend())).await;
        Ok(())
    }

    /// Resume delivering jobs.
    pub async fn resume(&self) -> Result<(), PoolError> {
        let producers = self.producers(Scope::Cluster);
        if producers.is_empty() {
            return Err(PoolError::NoQueue(self.inner.id.clone()));
        }
        join_all(producers.iter().map(|p| p.resume())).await;
        Ok(())
    }

    /// Queue depth and suspension from one producer, plus how many of the
    /// pool's monitors currently hold a job. An enqueue that has not
    /// reached the backend yet may not be reflected.
    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        let producer = self
            .inner
            .registry
            .closest_producer(&self.inner.id)
            .ok_or_else(|| PoolError::NoQueue(self.inner.id.clone()))?;
        let queue = producer.status().await.map_err(|_| PoolError::Closed)?;

        let monitors: Vec<_> = self
            .inner
            .registry
            .members(&self.inner.id, Role::WorkerMonitors, Scope::Local)
            .into_iter()
            .filter_map(|m| m.as_monitor().cloned())
            .collect();
        let total = monitors.len();
        let busy = join_all(monitors.iter().map(|m| m.is_busy()))
            .await
            .into_iter()
            .filter(|b| *b == Some(true))
            .count();

        Ok(PoolStatus {
            queue,
            workers: WorkerStats { total, busy },
        })
    }

    /// Best-effort snapshot of queued jobs matching `predicate`,
    /// delegated to one queue producer.
    pub async fn filter<F>(&self, predicate: F) -> Result<Vec<Job>, PoolError>
    where
        F: Fn(&Job) -> bool + Send + Sync + 'static,
    {
        let producer = self
            .inner
            .registry
            .closest_producer(&self.inner.id)
            .ok_or_else(|| PoolError::NoQueue(self.inner.id.clone()))?;
        let predicate: JobPredicate = Arc::new(predicate);
        let result = producer
            .filter(predicate)
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(result?)
    }

    /// Graceful teardown: stop components, delete the registry groups.
    pub async fn shutdown(&self) {
        info!(pool = %self.inner.id, "shutting down pool");
        let _ = self.inner.shutdown.send(true);
        let supervisor = self.inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
    }

    fn producers(&self, scope: Scope) -> Vec<crate::queue::ProducerHandle> {
        self.inner
            .registry
            .members(&self.inner.id, Role::Queues, scope)
            .into_iter()
            .filter_map(|m| m.as_producer().cloned())
            .collect()
    }

    fn spawn_supervisor(&self) -> Result<(), PoolError> {
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.inner.shutdown.subscribe();

        let mut components: JoinSet<ComponentKind> = JoinSet::new();
        for _ in 0..inner.config.num_queues {
            spawn_producer(&inner, &mut components)?;
        }
        for _ in 0..inner.config.num_workers {
            spawn_monitor(&inner, &mut components);
        }

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    Some(exit) = components.join_next() => {
                        let kind = match exit {
                            Ok(kind) => kind,
                            Err(join_err) => {
                                // A component task itself blew up; its
                                // registry entry is dead and lookups skip
                                // it, but it cannot be identified for
                                // restart.
                                error!(pool = %inner.id, %join_err, "pool component crashed hard");
                                continue;
                            }
                        };
                        if *shutdown_rx.borrow() {
                            continue;
                        }
                        warn!(pool = %inner.id, component = %kind, "component exited, restarting");
                        tokio::time::sleep(RESTART_BACKOFF).await;
                        if *shutdown_rx.borrow() {
                            continue;
                        }
                        match kind {
                            ComponentKind::Producer => {
                                if spawn_producer(&inner, &mut components).is_ok() {
                                    // Monitor subscriptions do not survive a
                                    // producer restart; have every monitor
                                    // re-issue its demand.
                                    resubscribe_monitors(&inner).await;
                                }
                            }
                            ComponentKind::Monitor => spawn_monitor(&inner, &mut components),
                        }
                    }
                }
            }
            teardown(&inner, &mut components).await;
        });

        *self.inner.supervisor.lock() = Some(handle);
        Ok(())
    }
}

/// Construct a producer, register it, and hand it to the supervisor's
/// join set. Registration happens here, synchronously, so a
/// re-subscription broadcast issued right after cannot miss it.
fn spawn_producer(
    inner: &Arc<PoolInner>,
    components: &mut JoinSet<ComponentKind>,
) -> Result<(), PoolError> {
    let (producer, handle) = QueueProducer::new(
        inner.id.clone(),
        &inner.config,
        Arc::clone(&inner.backend),
        Arc::clone(&inner.registry),
    );
    inner
        .registry
        .join(&inner.id, Role::Queues, Member::Producer(handle))?;
    components.spawn(async move {
        if let Err(err) = producer.run().await {
            error!(%err, "queue producer failed");
        }
        ComponentKind::Producer
    });
    Ok(())
}

fn spawn_monitor(inner: &Arc<PoolInner>, components: &mut JoinSet<ComponentKind>) {
    let (monitor, _handle) = WorkerMonitor::new(
        inner.id.clone(),
        Arc::clone(&inner.module),
        Arc::clone(&inner.failure),
        Arc::clone(&inner.registry),
        Arc::clone(&inner.replies),
        inner.config.init_args.clone(),
        inner.config.init_retry,
    );
    components.spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(%err, "worker monitor failed");
        }
        ComponentKind::Monitor
    });
}

async fn resubscribe_monitors(inner: &Arc<PoolInner>) {
    for member in inner
        .registry
        .members(&inner.id, Role::WorkerMonitors, Scope::Local)
    {
        if let Some(monitor) = member.as_monitor() {
            monitor.subscribe_to_queues().await;
        }
    }
}

/// Ordered teardown: monitors first so leased and buffered jobs settle,
/// then producers, then the registry groups.
async fn teardown(inner: &Arc<PoolInner>, components: &mut JoinSet<ComponentKind>) {
    for member in inner
        .registry
        .members(&inner.id, Role::WorkerMonitors, Scope::Local)
    {
        if let Some(monitor) = member.as_monitor() {
            monitor.stop().await;
        }
    }
    for member in inner.registry.members(&inner.id, Role::Queues, Scope::Local) {
        if let Some(producer) = member.as_producer() {
            producer.stop().await;
        }
    }

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while !components.is_empty() {
        match tokio::time::timeout_at(deadline, components.join_next()).await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                warn!(pool = %inner.id, remaining = components.len(), "shutdown grace elapsed, aborting components");
                break;
            }
        }
    }
    components.shutdown().await;

    inner.registry.delete(&inner.id);
    debug!(pool = %inner.id, "pool torn down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_id_accessors() {
        let local = PoolId::local("reports");
        let global = PoolId::global("reports");

        assert_eq!(local.name(), "reports");
        assert!(!local.is_global());
        assert!(global.is_global());
        assert_eq!(local.to_string(), "reports");
        assert_eq!(global.to_string(), "global:reports");
        assert_eq!(local.queue_name(), "foreman.reports");
    }

    #[test]
    fn pool_id_serde_round_trip() {
        let id = PoolId::global("etl");
        let json = serde_json::to_string(&id).unwrap();
        let back: PoolId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
