//! In-memory queue backend
//!
//! Reference implementation of [`QueueBackend`] used in tests and for
//! single-process deployments. It mirrors broker semantics closely enough
//! to exercise every consumer-side path: delivery tags, prefetch credit,
//! cancel races, and a visibility timeout that requeues unacknowledged
//! deliveries as redelivered.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{BackendError, Delivery, DeliveryTag, QueueBackend, QueueInfo, SubscriptionId};

/// Broker tuning knobs.
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// How long a delivery may stay unacknowledged before it is requeued
    /// as redelivered.
    pub visibility_timeout: Duration,

    /// How often the broker checks for expired deliveries and retries
    /// push deliveries that previously found every subscriber full.
    pub sweep_interval: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(25),
        }
    }
}

impl MemoryBrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

struct ReadyMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

struct InFlight {
    queue: String,
    payload: Vec<u8>,
    deadline: Instant,
    subscription: Option<u64>,
}

struct Subscriber {
    id: u64,
    prefetch: u16,
    inflight: u16,
    sink: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ReadyMessage>,
    subscribers: Vec<Subscriber>,
    /// Round-robin cursor over subscribers.
    next: usize,
    /// Rejected without redelivery.
    dead: Vec<Vec<u8>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, InFlight>,
    next_tag: u64,
    next_subscription: u64,
}

/// In-process broker.
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    config: MemoryBrokerConfig,
    sweeper: JoinHandle<()>,
}

impl MemoryBroker {
    /// Create a broker with default settings. Must be called inside a
    /// tokio runtime (the broker spawns a background sweeper).
    pub fn new() -> Self {
        Self::with_config(MemoryBrokerConfig::default())
    }

    pub fn with_config(config: MemoryBrokerConfig) -> Self {
        let state = Arc::new(Mutex::new(BrokerState::default()));
        let sweeper = {
            let state = Arc::clone(&state);
            let visibility = config.visibility_timeout;
            let interval = config.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let mut state = state.lock();
                    sweep(&mut state, Instant::now());
                    let queues: Vec<String> = state.queues.keys().cloned().collect();
                    for queue in queues {
                        pump(&mut state, &queue, visibility);
                    }
                }
            })
        };

        Self {
            state,
            config,
            sweeper,
        }
    }

    /// Messages rejected without redelivery on `queue`.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.dead.clone())
            .unwrap_or_default()
    }

    /// Deliveries handed out but not yet acknowledged, across all queues.
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Requeue every delivery whose visibility deadline has passed.
fn sweep(state: &mut BrokerState, now: Instant) {
    let expired: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, m)| m.deadline <= now)
        .map(|(tag, _)| *tag)
        .collect();

    for tag in expired {
        let Some(inflight) = state.unacked.remove(&tag) else {
            continue;
        };
        debug!(tag, queue = %inflight.queue, "visibility timeout, requeueing delivery");
        let queue = state.queues.entry(inflight.queue.clone()).or_default();
        if let Some(sub) = inflight.subscription {
            credit(queue, sub);
        }
        queue.ready.push_front(ReadyMessage {
            payload: inflight.payload,
            redelivered: true,
        });
    }
}

/// Return one unit of prefetch credit to a subscriber, if it still exists.
fn credit(queue: &mut QueueState, subscription: u64) {
    if let Some(sub) = queue.subscribers.iter_mut().find(|s| s.id == subscription) {
        sub.inflight = sub.inflight.saturating_sub(1);
    }
}

/// Push ready messages to subscribers with available credit.
fn pump(state: &mut BrokerState, queue_name: &str, visibility: Duration) {
    let now = Instant::now();
    loop {
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        if queue.ready.is_empty() || queue.subscribers.is_empty() {
            return;
        }

        // Drop subscribers whose sink is gone; their in-flight deliveries
        // come back via the visibility timeout.
        queue.subscribers.retain(|s| !s.sink.is_closed());
        let count = queue.subscribers.len();
        if count == 0 {
            return;
        }

        let Some(msg) = queue.ready.front() else {
            return;
        };
        let tag = state.next_tag;
        let delivery = Delivery {
            payload: msg.payload.clone(),
            tag: DeliveryTag(tag),
            redelivered: msg.redelivered,
        };

        let mut delivered_to = None;
        for offset in 0..count {
            let idx = (queue.next + offset) % count;
            let sub = &mut queue.subscribers[idx];
            if sub.inflight >= sub.prefetch {
                continue;
            }
            match sub.sink.try_send(delivery.clone()) {
                Ok(()) => {
                    sub.inflight += 1;
                    delivered_to = Some((idx, sub.id));
                    break;
                }
                Err(mpsc::error::TrySendError::Full(_)) => continue,
                Err(mpsc::error::TrySendError::Closed(_)) => continue,
            }
        }

        let Some((idx, sub_id)) = delivered_to else {
            // Every subscriber is out of credit or full; the sweeper
            // retries shortly.
            return;
        };

        queue.next = (idx + 1) % count;
        let Some(msg) = queue.ready.pop_front() else {
            return;
        };
        state.next_tag += 1;
        state.unacked.insert(
            tag,
            InFlight {
                queue: queue_name.to_string(),
                payload: msg.payload,
                deadline: now + visibility,
                subscription: Some(sub_id),
            },
        );
        trace!(tag, queue = queue_name, "pushed delivery");
    }
}

#[async_trait]
impl QueueBackend for MemoryBroker {
    async fn declare(&self, queue: &str, _durable: bool) -> Result<QueueInfo, BackendError> {
        let mut state = self.state.lock();
        let q = state.queues.entry(queue.to_string()).or_default();
        Ok(QueueInfo {
            depth: q.ready.len() as u64,
        })
    }

    async fn publish(
        &self,
        _exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        _persistent: bool,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state
            .queues
            .entry(routing_key.to_string())
            .or_default()
            .ready
            .push_back(ReadyMessage {
                payload,
                redelivered: false,
            });
        pump(&mut state, routing_key, self.config.visibility_timeout);
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BackendError> {
        let mut state = self.state.lock();
        sweep(&mut state, Instant::now());
        let visibility = self.config.visibility_timeout;

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BackendError::UnknownQueue(queue.to_string()))?;
        let Some(msg) = q.ready.pop_front() else {
            return Ok(None);
        };

        let tag = state.next_tag;
        state.next_tag += 1;
        let delivery = Delivery {
            payload: msg.payload.clone(),
            tag: DeliveryTag(tag),
            redelivered: msg.redelivered,
        };
        state.unacked.insert(
            tag,
            InFlight {
                queue: queue.to_string(),
                payload: msg.payload,
                deadline: Instant::now() + visibility,
                subscription: None,
            },
        );
        Ok(Some(delivery))
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
        sink: mpsc::Sender<Delivery>,
    ) -> Result<SubscriptionId, BackendError> {
        let mut state = self.state.lock();
        let id = state.next_subscription;
        state.next_subscription += 1;

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BackendError::UnknownQueue(queue.to_string()))?;
        q.subscribers.push(Subscriber {
            id,
            prefetch: prefetch.max(1),
            inflight: 0,
            sink,
        });
        debug!(queue, subscription = id, prefetch, "subscription started");
        pump(&mut state, queue, self.config.visibility_timeout);
        Ok(SubscriptionId(id))
    }

    async fn cancel(&self, queue: &str, id: SubscriptionId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BackendError::UnknownQueue(queue.to_string()))?;
        let before = q.subscribers.len();
        q.subscribers.retain(|s| s.id != id.0);
        if q.subscribers.len() == before {
            return Err(BackendError::UnknownSubscription);
        }
        debug!(queue, subscription = id.0, "subscription cancelled");
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let inflight = state
            .unacked
            .remove(&tag.0)
            .ok_or(BackendError::UnknownTag(tag))?;
        let name = inflight.queue.clone();
        if let Some(sub) = inflight.subscription {
            if let Some(queue) = state.queues.get_mut(&name) {
                credit(queue, sub);
            }
        }
        pump(&mut state, &name, self.config.visibility_timeout);
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, redeliver: bool) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let inflight = state
            .unacked
            .remove(&tag.0)
            .ok_or(BackendError::UnknownTag(tag))?;
        let name = inflight.queue.clone();
        {
            let Some(queue) = state.queues.get_mut(&name) else {
                warn!(queue = %name, "rejected delivery for a deleted queue");
                return Ok(());
            };
            if let Some(sub) = inflight.subscription {
                credit(queue, sub);
            }
            if redeliver {
                queue.ready.push_front(ReadyMessage {
                    payload: inflight.payload,
                    redelivered: true,
                });
            } else {
                queue.dead.push(inflight.payload);
            }
        }
        pump(&mut state, &name, self.config.visibility_timeout);
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, BackendError> {
        let mut state = self.state.lock();
        sweep(&mut state, Instant::now());
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u64)
            .ok_or_else(|| BackendError::UnknownQueue(queue.to_string()))
    }

    async fn peek(&self, queue: &str) -> Result<Vec<Vec<u8>>, BackendError> {
        let mut state = self.state.lock();
        sweep(&mut state, Instant::now());
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .ok_or_else(|| BackendError::UnknownQueue(queue.to_string()))
    }
}
