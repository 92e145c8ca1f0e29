//! worker.rs
//! One transmission worker per dispatched batch.
//!
//! State machine: Idle → Sending → { Success | RetryWait → Sending | PermanentFailure }.
//!
//! - Entry with the retry counter at the cap ends the batch as `Exhausted`
//!   without sending; events stay pending for a later tick.
//! - Events whose required related record is missing are left out of the
//!   payload and stay pending; an empty payload ends as `NothingToSend`.
//! - A disconnected network ends the attempt as `Deferred` (no send, no delete).
//! - 2xx deletes the transmitted events (`Delivered`); 4xx deletes them too
//!   (`Rejected`) so a poison batch cannot stall delivery.
//! - Anything else waits `backoff_base ^ retry` seconds on a timer and resends.
//! - Every terminal outcome releases the whole batch from the in-flight set
//!   exactly once; delete + release share one critical section.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use tokio::{sync::watch, task::JoinHandle};

use crate::controls::device::DeviceStateProvider;
use crate::error::StoreResult;
use crate::pipeline::{
    event::{Event, LocalId, RelatedKind, WireEvent},
    in_flight::InFlightTracker,
    store::EventStore,
    transport::{RequestHeaders, Transport, gzip_json},
};
use crate::utils::metrics::TransmissionMetrics;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BACKOFF_BASE: f64 = 2.7;

/// Ordered group of events sent in one request.
#[derive(Debug, Clone)]
pub struct Batch {
    pub seq: u64,
    pub events: Vec<Event>,
}

impl Batch {
    pub fn ids(&self) -> Vec<LocalId> {
        self.events.iter().filter_map(|e| e.local_id).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    /// `backoff_base ^ retry` seconds.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let secs = self.backoff_base.powi(retry as i32);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Sending,
    RetryWait,
    Success,
    PermanentFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// 2xx; `deleted` events removed from the store.
    Delivered { deleted: usize },
    /// 4xx; events removed anyway.
    Rejected { status: u16, deleted: usize },
    /// Nothing deliverable in the batch.
    NothingToSend,
    /// Network reported down; left pending.
    Deferred,
    /// Retry cap reached; left pending.
    Exhausted { attempts: u32 },
    /// Shutdown observed; left pending.
    Cancelled,
}

impl TerminalOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TerminalOutcome::Delivered { .. } | TerminalOutcome::Rejected { .. } | TerminalOutcome::NothingToSend
        )
    }

    fn terminal_state(&self) -> WorkerState {
        if self.is_success() {
            WorkerState::Success
        } else {
            WorkerState::PermanentFailure
        }
    }
}

/// Per-batch bookkeeping.
#[derive(Debug, Clone)]
pub struct TransmissionAttempt {
    pub ids: Vec<LocalId>,
    pub retry_count: u32,
    pub next_delay: Option<Duration>,
}

/// Collaborators every worker shares.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn EventStore>,
    pub transport: Arc<dyn Transport>,
    pub in_flight: Arc<InFlightTracker>,
    pub device: Arc<dyn DeviceStateProvider>,
    pub metrics: Arc<TransmissionMetrics>,
    pub headers: RequestHeaders,
    pub events_path: String,
    pub retry: RetryPolicy,
    /// Flips to `true` on pipeline shutdown.
    pub shutdown: watch::Receiver<bool>,
}

struct Payload {
    wire: Vec<WireEvent>,
    sent_ids: Vec<LocalId>,
    malformed: Vec<LocalId>,
}

enum SendResult {
    Done(TerminalOutcome),
    Transient(String),
}

pub struct TransmissionWorker {
    ctx: WorkerContext,
    batch: Batch,
    attempt: TransmissionAttempt,
    state: WorkerState,
}

impl TransmissionWorker {
    pub fn new(ctx: WorkerContext, batch: Batch) -> Self {
        let attempt = TransmissionAttempt {
            ids: batch.ids(),
            retry_count: 0,
            next_delay: None,
        };
        Self {
            ctx,
            batch,
            attempt,
            state: WorkerState::Idle,
        }
    }

    pub fn spawn(self) -> JoinHandle<TerminalOutcome> {
        tokio::spawn(self.run())
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn attempt(&self) -> &TransmissionAttempt {
        &self.attempt
    }

    /// Drives the batch to a terminal outcome and releases it from the in-flight set.
    pub async fn run(mut self) -> TerminalOutcome {
        let outcome = self.drive().await;
        self.state = outcome.terminal_state();
        self.report(&outcome);
        outcome
    }

    async fn drive(&mut self) -> TerminalOutcome {
        loop {
            // ================================================================
            // Entry checks
            // ================================================================
            if *self.ctx.shutdown.borrow() {
                return self.release_only(TerminalOutcome::Cancelled);
            }
            if self.attempt.retry_count >= self.ctx.retry.max_retries {
                return self.release_only(TerminalOutcome::Exhausted {
                    attempts: self.attempt.retry_count,
                });
            }
            self.state = WorkerState::Sending;

            match self.send_once().await {
                SendResult::Done(outcome) => return outcome,
                SendResult::Transient(reason) => {
                    self.attempt.retry_count += 1;
                    let delay = self.ctx.retry.delay_for(self.attempt.retry_count);
                    self.attempt.next_delay = Some(delay);
                    self.state = WorkerState::RetryWait;
                    self.ctx.metrics.record_retry();
                    warn!(
                        "[Worker] batch #{} transient failure ({}); retry {} in {:.1}s",
                        self.batch.seq,
                        reason,
                        self.attempt.retry_count,
                        delay.as_secs_f64()
                    );
                    if !self.wait_or_cancel(delay).await {
                        return self.release_only(TerminalOutcome::Cancelled);
                    }
                }
            }
        }
    }

    async fn send_once(&mut self) -> SendResult {
        let payload = match self.build_payload() {
            Ok(p) => p,
            Err(e) => {
                error!("[Worker] batch #{} could not read related records: {}", self.batch.seq, e);
                return SendResult::Done(self.release_only(TerminalOutcome::Deferred));
            }
        };

        if !payload.malformed.is_empty() && self.ctx.metrics.record_malformed(&payload.malformed) > 0 {
            warn!(
                "[Worker] batch #{}: {} event(s) missing a related record; left pending",
                self.batch.seq,
                payload.malformed.len()
            );
        }

        if payload.wire.is_empty() {
            return SendResult::Done(self.release_only(TerminalOutcome::NothingToSend));
        }

        if self.ctx.device.snapshot().is_disconnected() {
            info!("[Worker] batch #{}: network disconnected; deferring", self.batch.seq);
            return SendResult::Done(self.release_only(TerminalOutcome::Deferred));
        }

        let body = match gzip_json(&payload.wire) {
            Ok(b) => b,
            Err(e) => {
                error!("[Worker] batch #{}: {}", self.batch.seq, e);
                return SendResult::Done(self.release_only(TerminalOutcome::Deferred));
            }
        };

        let started = Instant::now();
        let response = self
            .ctx
            .transport
            .post(&self.ctx.events_path, &body, &self.ctx.headers)
            .await;

        match response {
            Ok(resp) if resp.is_success() => {
                let deleted = self.delete_and_release(&payload.sent_ids);
                self.ctx
                    .metrics
                    .record_delivered(payload.sent_ids.len(), started.elapsed().as_millis() as u64);
                SendResult::Done(TerminalOutcome::Delivered { deleted })
            }
            Ok(resp) if resp.is_client_error() => {
                let deleted = self.delete_and_release(&payload.sent_ids);
                self.ctx.metrics.record_rejected(payload.sent_ids.len(), resp.status);
                warn!(
                    "[Worker] batch #{} rejected with {}; discarded {} event(s): {}",
                    self.batch.seq,
                    resp.status,
                    deleted,
                    String::from_utf8_lossy(&resp.body)
                );
                SendResult::Done(TerminalOutcome::Rejected {
                    status: resp.status,
                    deleted,
                })
            }
            Ok(resp) => SendResult::Transient(format!("status {}", resp.status)),
            Err(e) => SendResult::Transient(e.to_string()),
        }
    }

    /// Wire payload in batch order, minus events whose required record is missing.
    fn build_payload(&self) -> StoreResult<Payload> {
        let mut wire = Vec::with_capacity(self.batch.len());
        let mut sent_ids = Vec::with_capacity(self.batch.len());
        let mut malformed = Vec::new();

        'events: for event in &self.batch.events {
            let Some(id) = event.local_id else { continue };
            let required = event.kind.required_related();

            let mut location = None;
            let mut activity = None;
            let mut health = None;
            for kind in RelatedKind::ALL {
                let record = match event.related_ref(kind) {
                    Some(ref_id) => self.ctx.store.related_record(kind, ref_id)?,
                    None => None,
                };
                if record.is_none() && required == Some(kind) {
                    debug!("[Worker] event {} lacks its {} record", id, kind.name());
                    malformed.push(id);
                    continue 'events;
                }
                match kind {
                    RelatedKind::Location => location = record,
                    RelatedKind::Activity => activity = record,
                    RelatedKind::Health => health = record,
                }
            }

            wire.push(WireEvent {
                id,
                user_id: event.user_id.clone(),
                session_id: event.session_id.clone(),
                device_id: event.device_id.clone(),
                kind: event.kind,
                recorded_at: event.recorded_at,
                location,
                activity,
                health,
                data: event.metadata.clone(),
            });
            sent_ids.push(id);
        }

        Ok(Payload { wire, sent_ids, malformed })
    }

    async fn wait_or_cancel(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.ctx.shutdown.changed() => match changed {
                    Ok(()) if *self.ctx.shutdown.borrow() => return false,
                    Ok(()) => continue,
                    Err(_) => {
                        (&mut sleep).await;
                        return true;
                    }
                },
            }
        }
    }

    /// Deletes the transmitted ids and releases the whole batch atomically.
    fn delete_and_release(&self, sent_ids: &[LocalId]) -> usize {
        let store = &self.ctx.store;
        let deleted = self
            .ctx
            .in_flight
            .complete(&self.attempt.ids, || match store.bulk_delete(sent_ids) {
                Ok(n) => n,
                Err(e) => {
                    error!("[Worker] batch #{}: delete failed, events will be resent: {}", self.batch.seq, e);
                    0
                }
            });
        if deleted > 0 {
            self.ctx.metrics.forget_malformed(sent_ids);
        }
        deleted
    }

    fn release_only(&self, outcome: TerminalOutcome) -> TerminalOutcome {
        self.ctx.in_flight.release(&self.attempt.ids);
        outcome
    }

    fn report(&self, outcome: &TerminalOutcome) {
        match outcome {
            TerminalOutcome::Delivered { deleted } => {
                debug!("[Worker] batch #{} delivered; deleted {}", self.batch.seq, deleted);
            }
            TerminalOutcome::Rejected { .. } | TerminalOutcome::NothingToSend => {}
            TerminalOutcome::Deferred => self.ctx.metrics.record_deferred(),
            TerminalOutcome::Exhausted { attempts } => {
                self.ctx.metrics.record_exhausted();
                error!(
                    "[Worker] batch #{} abandoned after {} failed attempts; {} event(s) left pending",
                    self.batch.seq,
                    attempts,
                    self.attempt.ids.len()
                );
            }
            TerminalOutcome::Cancelled => {
                self.ctx.metrics.record_cancelled();
                debug!("[Worker] batch #{} cancelled", self.batch.seq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically() {
        let r = RetryPolicy::default();
        assert_eq!(r.delay_for(0), Duration::from_secs(1));
        let d1 = r.delay_for(1).as_secs_f64();
        let d5 = r.delay_for(5).as_secs_f64();
        assert!((d1 - 2.7).abs() < 1e-9);
        assert!((d5 - 2.7f64.powi(5)).abs() < 1e-6);
    }

    #[test]
    fn outcome_classification() {
        assert!(TerminalOutcome::Delivered { deleted: 1 }.is_success());
        assert!(TerminalOutcome::Rejected { status: 422, deleted: 1 }.is_success());
        assert!(TerminalOutcome::NothingToSend.is_success());
        assert!(!TerminalOutcome::Deferred.is_success());
        assert!(!TerminalOutcome::Exhausted { attempts: 5 }.is_success());
        assert!(!TerminalOutcome::Cancelled.is_success());
    }

    #[test]
    fn batch_ids_keep_order() {
        use crate::pipeline::event::EventKind;
        let events: Vec<Event> = [7, 3, 9]
            .into_iter()
            .map(|id| {
                let mut e = Event::new(EventKind::ActionCompleted, "u", "s", "d");
                e.local_id = Some(id);
                e
            })
            .collect();
        let batch = Batch { seq: 1, events };
        assert_eq!(batch.ids(), vec![7, 3, 9]);
    }
}
