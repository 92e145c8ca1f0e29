//! bus.rs
//! Policy-change fan-out: resolver → every registered consumer.
//!
//! Each subscriber gets its own bounded crossbeam channel. Publishing never
//! blocks the resolver: a full subscriber misses the message (counted), a
//! dropped subscriber is pruned on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use log::debug;
use parking_lot::Mutex;

use crate::controls::policy::ControlPolicy;

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    /// A new policy became current. The location producer should adopt
    /// `current.minimum_displacement_m` as its sampling threshold.
    Changed {
        previous: Option<ControlPolicy>,
        current: ControlPolicy,
    },
    /// The current policy's TTL lapsed and was re-resolved.
    Expired { expired: ControlPolicy },
}

pub struct PolicyBus {
    subscribers: Mutex<Vec<Sender<PolicyEvent>>>,
    capacity: usize,
    missed: AtomicU64,
}

impl PolicyBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            missed: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Receiver<PolicyEvent> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Non-blocking delivery to every live subscriber.
    pub fn publish(&self, event: PolicyEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.missed.fetch_add(1, Ordering::Relaxed);
                debug!("[PolicyBus] subscriber full; dropped {:?}", event);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn missed_count(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }
}

impl Default for PolicyBus {
    fn default() -> Self {
        Self::new(64)
    }
}
