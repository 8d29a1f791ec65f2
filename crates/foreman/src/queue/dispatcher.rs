//! Pending demand bookkeeping
//!
//! Each unit is one monitor willing to accept one job. The length of the
//! queue is the producer's outstanding demand; it can never go negative
//! because emission consumes exactly one unit.

use std::collections::VecDeque;

use rand::Rng;

use crate::config::DispatcherStrategy;

use super::producer::ConsumerRef;

pub(crate) struct Dispatcher {
    strategy: DispatcherStrategy,
    units: VecDeque<ConsumerRef>,
}

impl Dispatcher {
    pub fn new(strategy: DispatcherStrategy) -> Self {
        Self {
            strategy,
            units: VecDeque::new(),
        }
    }

    pub fn push(&mut self, consumer: ConsumerRef) {
        self.units.push_back(consumer);
    }

    /// Next demand unit per the configured strategy. Units whose consumer
    /// has gone away are discarded; a restarted monitor re-issues demand.
    pub fn pop(&mut self) -> Option<ConsumerRef> {
        loop {
            if self.units.is_empty() {
                return None;
            }
            let unit = match self.strategy {
                DispatcherStrategy::Fifo => self.units.pop_front()?,
                DispatcherStrategy::Random => {
                    let idx = rand::thread_rng().gen_range(0..self.units.len());
                    self.units.remove(idx)?
                }
            };
            if !unit.sink.is_closed() {
                return Some(unit);
            }
        }
    }

    /// Drop demand from consumers that no longer exist.
    pub fn prune(&mut self) {
        self.units.retain(|u| !u.sink.is_closed());
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemberId;
    use tokio::sync::mpsc;

    fn unit() -> (ConsumerRef, mpsc::Receiver<super::super::JobDelivery>) {
        let (tx, rx) = mpsc::channel(1);
        (
            ConsumerRef {
                id: MemberId::new(),
                sink: tx,
            },
            rx,
        )
    }

    #[test]
    fn fifo_serves_in_arrival_order() {
        let mut dispatcher = Dispatcher::new(DispatcherStrategy::Fifo);
        let (a, _ra) = unit();
        let (b, _rb) = unit();
        let first = a.id;
        dispatcher.push(a);
        dispatcher.push(b);

        assert_eq!(dispatcher.len(), 2);
        assert_eq!(dispatcher.pop().map(|u| u.id), Some(first));
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn pop_skips_dead_consumers() {
        let mut dispatcher = Dispatcher::new(DispatcherStrategy::Fifo);
        let (a, ra) = unit();
        let (b, _rb) = unit();
        let live = b.id;
        dispatcher.push(a);
        dispatcher.push(b);
        drop(ra);

        assert_eq!(dispatcher.pop().map(|u| u.id), Some(live));
        assert!(dispatcher.pop().is_none());
    }

    #[test]
    fn prune_discards_dead_demand() {
        let mut dispatcher = Dispatcher::new(DispatcherStrategy::Fifo);
        let (a, ra) = unit();
        dispatcher.push(a);
        drop(ra);

        dispatcher.prune();
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn random_strategy_serves_every_unit() {
        let mut dispatcher = Dispatcher::new(DispatcherStrategy::Random);
        let mut receivers = Vec::new();
        for _ in 0..5 {
            let (u, r) = unit();
            dispatcher.push(u);
            receivers.push(r);
        }

        let mut served = 0;
        while dispatcher.pop().is_some() {
            served += 1;
        }
        assert_eq!(served, 5);
    }
}
