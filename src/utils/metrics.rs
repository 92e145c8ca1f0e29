//! Delivery metrics for the transmission pipeline.
//!
//! - Counters are plain atomics: workers and the scheduler bump them without locking.
//! - Rejections are bucketed per HTTP status in a `DashMap`.
//! - Malformed events are counted once per event id, however many ticks skip them.
//! - Request round-trip latency keeps the last `MAX_POINTS` samples (FIFO).
//!
//! Nothing here is surfaced to the end user; the host can log or export a snapshot.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;

use crate::pipeline::event::LocalId;

pub const MAX_POINTS: usize = 1_000;

#[derive(Debug, Default)]
pub struct TransmissionMetrics {
    ticks: AtomicU64,
    batches_dispatched: AtomicU64,
    events_dispatched: AtomicU64,
    events_delivered: AtomicU64,
    events_rejected: AtomicU64,
    events_skipped_malformed: AtomicU64,
    retries: AtomicU64,
    batches_exhausted: AtomicU64,
    batches_deferred: AtomicU64,
    batches_cancelled: AtomicU64,
    policy_changes: AtomicU64,
    rejections_by_status: DashMap<u16, AtomicU64>,
    malformed_ids: DashSet<LocalId>,
    latency_ms: Mutex<VecDeque<u64>>,
}

impl TransmissionMetrics {
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, events: usize) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.events_dispatched.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, events: usize, latency_ms: u64) {
        self.events_delivered.fetch_add(events as u64, Ordering::Relaxed);
        push_capped_u64(&mut self.latency_ms.lock(), latency_ms);
    }

    pub fn record_rejected(&self, events: usize, status: u16) {
        self.events_rejected.fetch_add(events as u64, Ordering::Relaxed);
        self.rejections_by_status
            .entry(status)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Returns how many of `ids` were not already counted.
    pub fn record_malformed(&self, ids: &[LocalId]) -> usize {
        let fresh = ids.iter().filter(|&&id| self.malformed_ids.insert(id)).count();
        self.events_skipped_malformed.fetch_add(fresh as u64, Ordering::Relaxed);
        fresh
    }

    /// Drops deleted ids from the malformed set.
    pub fn forget_malformed(&self, ids: &[LocalId]) {
        if self.malformed_ids.is_empty() {
            return;
        }
        for id in ids {
            self.malformed_ids.remove(id);
        }
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self) {
        self.batches_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.batches_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.batches_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_policy_change(&self) {
        self.policy_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejections_for(&self, status: u16) -> u64 {
        self.rejections_by_status
            .get(&status)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.latency_ms.lock();
        let stats = calculate_stats_u64(&latency);
        MetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            events_skipped_malformed: self.events_skipped_malformed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            batches_exhausted: self.batches_exhausted.load(Ordering::Relaxed),
            batches_deferred: self.batches_deferred.load(Ordering::Relaxed),
            batches_cancelled: self.batches_cancelled.load(Ordering::Relaxed),
            policy_changes: self.policy_changes.load(Ordering::Relaxed),
            latency_samples: stats.as_ref().map(|s| s.count).unwrap_or(0),
            latency_min_ms: stats.as_ref().map(|s| s.min).unwrap_or(0.0),
            latency_avg_ms: stats.as_ref().map(|s| s.mean).unwrap_or(0.0),
            latency_max_ms: stats.as_ref().map(|s| s.max).unwrap_or(0.0),
        }
    }
}

/// Point-in-time copy of the counters, one CSV row when exported.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub batches_dispatched: u64,
    pub events_dispatched: u64,
    pub events_delivered: u64,
    pub events_rejected: u64,
    pub events_skipped_malformed: u64,
    pub retries: u64,
    pub batches_exhausted: u64,
    pub batches_deferred: u64,
    pub batches_cancelled: u64,
    pub policy_changes: u64,
    pub latency_samples: usize,
    pub latency_min_ms: f64,
    pub latency_avg_ms: f64,
    pub latency_max_ms: f64,
}

/// Appends value to a bounded buffer; removes oldest if at capacity.
#[inline]
pub fn push_capped_u64(buf: &mut VecDeque<u64>, val: u64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

#[derive(Debug, Clone)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

/// Computes min, max, mean for u64 buffer (cast to f64).
pub fn calculate_stats_u64(data: &VecDeque<u64>) -> Option<Stats> {
    if data.is_empty() {
        return None;
    }

    let count = data.len();
    let min = data.iter().map(|&x| x as f64).fold(f64::INFINITY, f64::min);
    let max = data.iter().map(|&x| x as f64).fold(f64::NEG_INFINITY, f64::max);
    let mean = data.iter().map(|&x| x as f64).sum::<f64>() / count as f64;

    Some(Stats { min, max, mean, count })
}
