//! scheduler.rs
//! Periodic batching of pending events.
//!
//! - One tokio task. Wakes on the policy interval timer, on a flush-now
//!   request, or on a policy change (which also re-arms the timer).
//! - A tick claims pending events through the in-flight tracker, cuts them
//!   into batches of the policy's batch size (read order kept) and spawns
//!   one worker per batch. Ticks never wait on workers.
//! - Overlapping ticks are harmless: claimed events are invisible to later ticks.

use std::time::Duration;

use log::{debug, error, info};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::controls::policy::ControlPolicy;
use crate::pipeline::{
    event::Event,
    worker::{Batch, TerminalOutcome, TransmissionWorker, WorkerContext},
};

/// Pending flush requests beyond this coalesce into one.
const FLUSH_QUEUE: usize = 4;

/// Splits `events` into consecutive groups of at most `size`, preserving order.
pub fn partition(events: Vec<Event>, size: usize) -> Vec<Vec<Event>> {
    let size = size.max(1);
    let mut out = Vec::with_capacity(events.len().div_ceil(size));
    let mut iter = events.into_iter().peekable();
    while iter.peek().is_some() {
        out.push(iter.by_ref().take(size).collect());
    }
    out
}

/// A flush request; the sender, if any, receives the number of batches dispatched.
type FlushRequest = Option<oneshot::Sender<usize>>;

/// Cloneable trigger for an immediate tick.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    flush_tx: mpsc::Sender<FlushRequest>,
}

impl SchedulerHandle {
    /// Requests a tick without waiting for it. Returns `false` once the scheduler has stopped.
    pub fn flush_now(&self) -> bool {
        match self.flush_tx.try_send(None) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Requests a tick and waits until its batches are claimed and spawned.
    /// `None` if the scheduler has stopped.
    pub async fn flush(&self) -> Option<usize> {
        let (tx, rx) = oneshot::channel();
        self.flush_tx.send(Some(tx)).await.ok()?;
        rx.await.ok()
    }
}

pub struct BatchScheduler {
    ctx: WorkerContext,
    policy_rx: watch::Receiver<ControlPolicy>,
    flush_rx: mpsc::Receiver<FlushRequest>,
    shutdown: watch::Receiver<bool>,
    next_seq: u64,
}

impl BatchScheduler {
    pub fn new(ctx: WorkerContext, policy_rx: watch::Receiver<ControlPolicy>) -> (Self, SchedulerHandle) {
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_QUEUE);
        let shutdown = ctx.shutdown.clone();
        let scheduler = Self {
            ctx,
            policy_rx,
            flush_rx,
            shutdown,
            next_seq: 0,
        };
        (scheduler, SchedulerHandle { flush_tx })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn current_interval(&self) -> Duration {
        self.policy_rx.borrow().batch_interval()
    }

    fn current_batch_size(&self) -> usize {
        self.policy_rx.borrow().batch_size.max(1)
    }

    pub async fn run(mut self) {
        let mut interval = {
            let policy = self.policy_rx.borrow_and_update();
            policy.batch_interval()
        };
        info!("[Scheduler] started; interval={}s", interval.as_secs());

        let timer = tokio::time::sleep(interval);
        tokio::pin!(timer);
        let mut policy_open = true;

        loop {
            tokio::select! {
                _ = &mut timer => {
                    self.tick();
                    timer.as_mut().reset(Instant::now() + interval);
                }
                Some(request) = self.flush_rx.recv() => {
                    debug!("[Scheduler] flush requested");
                    let dispatched = self.tick().len();
                    if let Some(ack) = request {
                        let _ = ack.send(dispatched);
                    }
                }
                changed = self.policy_rx.changed(), if policy_open => {
                    if changed.is_err() {
                        policy_open = false;
                        continue;
                    }
                    let next = self.policy_rx.borrow_and_update().batch_interval();
                    if next != interval {
                        info!("[Scheduler] interval {}s → {}s", interval.as_secs(), next.as_secs());
                        interval = next;
                    }
                    // Cancel-and-rearm: the old deadline never fires.
                    timer.as_mut().reset(Instant::now() + interval);
                    self.tick();
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("[Scheduler] stopped after {} batch(es)", self.next_seq);
    }

    /// One scheduling pass. Returns the spawned workers' handles; the loop
    /// drops them, tests may await them.
    pub fn tick(&mut self) -> Vec<JoinHandle<TerminalOutcome>> {
        self.ctx.metrics.record_tick();
        let batch_size = self.current_batch_size();
        let store = self.ctx.store.clone();

        let groups = match self
            .ctx
            .in_flight
            .claim(|| store.read_all_pending(), |pending| partition(pending, batch_size))
        {
            Ok(groups) => groups,
            Err(e) => {
                error!("[Scheduler] reading pending events failed: {}", e);
                return Vec::new();
            }
        };

        if groups.is_empty() {
            debug!("[Scheduler] nothing pending");
            return Vec::new();
        }
        debug!(
            "[Scheduler] dispatching {} batch(es) of ≤{} (interval {}s)",
            groups.len(),
            batch_size,
            self.current_interval().as_secs()
        );

        groups
            .into_iter()
            .map(|events| {
                self.next_seq += 1;
                let batch = Batch {
                    seq: self.next_seq,
                    events,
                };
                self.ctx.metrics.record_dispatch(batch.len());
                TransmissionWorker::new(self.ctx.clone(), batch).spawn()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::EventKind;

    fn events(n: i64) -> Vec<Event> {
        (1..=n)
            .map(|id| {
                let mut e = Event::new(EventKind::TrackingStarted, "u", "s", "d");
                e.local_id = Some(id);
                e
            })
            .collect()
    }

    fn ids(groups: &[Vec<Event>]) -> Vec<Vec<i64>> {
        groups
            .iter()
            .map(|g| g.iter().filter_map(|e| e.local_id).collect())
            .collect()
    }

    #[test]
    fn partition_preserves_order_and_sizes() {
        let groups = partition(events(120), 50);
        let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(groups[0][0].local_id, Some(1));
        assert_eq!(groups[2][19].local_id, Some(120));
    }

    #[test]
    fn partition_edge_cases() {
        assert!(partition(Vec::new(), 50).is_empty());
        assert_eq!(ids(&partition(events(3), 0)), vec![vec![1], vec![2], vec![3]]);
        assert_eq!(ids(&partition(events(4), 10)), vec![vec![1, 2, 3, 4]]);
    }

    #[tokio::test]
    async fn flush_handle_reports_closed_scheduler() {
        let (tx, rx) = mpsc::channel(1);
        let handle = SchedulerHandle { flush_tx: tx };
        assert!(handle.flush_now());
        // Full queue still counts as requested.
        assert!(handle.flush_now());
        drop(rx);
        assert!(!handle.flush_now());
        assert_eq!(handle.flush().await, None);
    }
}
