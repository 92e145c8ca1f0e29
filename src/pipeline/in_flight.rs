//! in_flight.rs
//! Tracks which pending events are currently owned by a transmission worker.
//!
//! - One mutex guards the set; reserve, release, filter and the scheduler's
//!   read-filter-mark pass all run inside it.
//! - Workers delete acknowledged events and release them in the same critical
//!   section, so a concurrent tick never sees a deleted-but-still-listed event.
//! - Reserve is idempotent; releasing an absent id is a no-op.

use std::collections::HashSet;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::pipeline::event::{Event, LocalId};

/// The guarded set. Only reachable through `InFlightTracker::critical`.
#[derive(Debug, Default)]
pub struct InFlightSet {
    ids: HashSet<LocalId>,
}

impl InFlightSet {
    pub fn reserve(&mut self, ids: &[LocalId]) -> usize {
        ids.iter().filter(|id| self.ids.insert(**id)).count()
    }

    pub fn release(&mut self, ids: &[LocalId]) -> usize {
        ids.iter().filter(|id| self.ids.remove(*id)).count()
    }

    pub fn filter(&self, candidates: &[LocalId]) -> Vec<LocalId> {
        candidates
            .iter()
            .copied()
            .filter(|id| !self.ids.contains(id))
            .collect()
    }

    /// Drops events owned by a worker, and events that were never persisted.
    pub fn filter_events(&self, pending: Vec<Event>) -> Vec<Event> {
        pending
            .into_iter()
            .filter(|e| match e.local_id {
                Some(id) => !self.ids.contains(&id),
                None => false,
            })
            .collect()
    }

    pub fn contains(&self, id: LocalId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct InFlightTracker {
    set: Mutex<InFlightSet>,
    idle: Notify,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with exclusive access to the set. Wakes `wait_idle` callers
    /// if the set is empty afterwards.
    pub fn critical<R>(&self, f: impl FnOnce(&mut InFlightSet) -> R) -> R {
        let (out, now_empty) = {
            let mut set = self.set.lock();
            let out = f(&mut set);
            (out, set.is_empty())
        };
        if now_empty {
            self.idle.notify_waiters();
        }
        out
    }

    pub fn reserve(&self, ids: &[LocalId]) -> usize {
        self.critical(|set| set.reserve(ids))
    }

    pub fn release(&self, ids: &[LocalId]) -> usize {
        let released = self.critical(|set| set.release(ids));
        if released < ids.len() {
            debug!(
                "[InFlight] release of {} ids freed {} (rest were not in flight)",
                ids.len(),
                released
            );
        }
        released
    }

    pub fn filter(&self, candidates: &[LocalId]) -> Vec<LocalId> {
        self.set.lock().filter(candidates)
    }

    /// Read → filter → partition → reserve, as one critical section.
    /// Every id of every returned group is in flight when this returns.
    pub fn claim<E>(
        &self,
        load_pending: impl FnOnce() -> Result<Vec<Event>, E>,
        partition: impl FnOnce(Vec<Event>) -> Vec<Vec<Event>>,
    ) -> Result<Vec<Vec<Event>>, E> {
        self.critical(|set| {
            let pending = load_pending()?;
            let unpersisted = pending.iter().filter(|e| e.local_id.is_none()).count();
            if unpersisted > 0 {
                warn!("[InFlight] dropping {} pending event(s) without a local id", unpersisted);
            }
            let groups = partition(set.filter_events(pending));
            for group in &groups {
                let ids: Vec<LocalId> = group.iter().filter_map(|e| e.local_id).collect();
                set.reserve(&ids);
            }
            Ok(groups)
        })
    }

    /// Runs `delete` and releases `ids` under the same lock.
    pub fn complete<R>(&self, ids: &[LocalId], delete: impl FnOnce() -> R) -> R {
        self.critical(|set| {
            let out = delete();
            set.release(ids);
            out
        })
    }

    pub fn contains(&self, id: LocalId) -> bool {
        self.set.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.set.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.lock().is_empty()
    }

    /// Resolves once no event is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
