//! Reply routing between workers and submitters
//!
//! Replies are matched on the request id stamped into `Job::from`. A slot
//! is registered at submission time; the result is buffered if it lands
//! before the submitter waits for it, and a slot abandoned by a timeout is
//! removed so the late reply is dropped instead of piling up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::job::RequestId;

enum Slot {
    /// Registered, nobody waiting yet.
    Expecting,
    /// Result arrived before the submitter asked for it.
    Ready(Value),
    /// Submitter is parked on the receiver.
    Waiting(oneshot::Sender<Value>),
}

/// Per-pool reply switchboard.
#[derive(Default)]
pub(crate) struct ReplyRouter {
    slots: Mutex<HashMap<RequestId, Slot>>,
}

impl ReplyRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Announce that a reply is expected for `request`.
    pub fn register(&self, request: RequestId) {
        self.slots.lock().insert(request, Slot::Expecting);
    }

    /// Hand in a result. Results for unregistered (stale or reply-less)
    /// requests are dropped.
    pub fn deliver(&self, request: RequestId, value: Value) {
        let mut slots = self.slots.lock();
        match slots.remove(&request) {
            Some(Slot::Waiting(tx)) => {
                // A receiver dropped mid-send means the waiter timed out
                // at the same instant; either way the reply is consumed.
                let _ = tx.send(value);
            }
            Some(Slot::Expecting) => {
                slots.insert(request, Slot::Ready(value));
            }
            Some(Slot::Ready(old)) => {
                // Duplicate execution under at-least-once delivery; keep
                // the first result.
                trace!(?request, "dropping duplicate reply");
                slots.insert(request, Slot::Ready(old));
            }
            None => {
                trace!(?request, "dropping stale reply");
            }
        }
    }

    /// Wait up to `timeout` for the reply to `request`. Returns `None` on
    /// timeout (the slot is forgotten, so a late reply is discarded) and
    /// for requests that were never registered.
    pub async fn wait(&self, request: RequestId, timeout: Duration) -> Option<Value> {
        let rx = {
            let mut slots = self.slots.lock();
            match slots.remove(&request) {
                Some(Slot::Ready(value)) => return Some(value),
                Some(Slot::Expecting) | Some(Slot::Waiting(_)) => {
                    let (tx, rx) = oneshot::channel();
                    slots.insert(request, Slot::Waiting(tx));
                    rx
                }
                None => return None,
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Some(value),
            _ => {
                // Timed out or the router dropped the sender; forget the
                // slot so the eventual reply is discarded.
                self.slots.lock().remove(&request);
                None
            }
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}
