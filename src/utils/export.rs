//! CSV export of per-run delivery summaries.
//!
//! One row per run, appended to a persistent file; the header is written
//! only when the file is created. Rows carry the run label, its duration
//! and the final `MetricsSnapshot` counters.

use std::{
    fs::{OpenOptions, create_dir_all},
    path::Path,
};

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;

use crate::utils::metrics::{MetricsSnapshot, TransmissionMetrics};

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    run: &'a str,
    finished_at: DateTime<Utc>,
    duration_secs: u64,
    pending_left: usize,
    ticks: u64,
    batches_dispatched: u64,
    events_dispatched: u64,
    events_delivered: u64,
    events_rejected: u64,
    events_skipped_malformed: u64,
    retries: u64,
    batches_exhausted: u64,
    batches_deferred: u64,
    batches_cancelled: u64,
    policy_changes: u64,
    latency_samples: usize,
    latency_min_ms: f64,
    latency_avg_ms: f64,
    latency_max_ms: f64,
}

impl<'a> SummaryRow<'a> {
    fn new(run: &'a str, duration_secs: u64, pending_left: usize, m: MetricsSnapshot) -> Self {
        Self {
            run,
            finished_at: Utc::now(),
            duration_secs,
            pending_left,
            ticks: m.ticks,
            batches_dispatched: m.batches_dispatched,
            events_dispatched: m.events_dispatched,
            events_delivered: m.events_delivered,
            events_rejected: m.events_rejected,
            events_skipped_malformed: m.events_skipped_malformed,
            retries: m.retries,
            batches_exhausted: m.batches_exhausted,
            batches_deferred: m.batches_deferred,
            batches_cancelled: m.batches_cancelled,
            policy_changes: m.policy_changes,
            latency_samples: m.latency_samples,
            latency_min_ms: m.latency_min_ms,
            latency_avg_ms: m.latency_avg_ms,
            latency_max_ms: m.latency_max_ms,
        }
    }
}

/// Appends one summary row to `csv_path`. Creates parent dirs and the header on first write.
pub fn export_summary_csv(
    csv_path: &Path,
    run: &str,
    duration_secs: u64,
    pending_left: usize,
    metrics: &TransmissionMetrics,
) -> Result<(), csv::Error> {
    if let Some(parent) = csv_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent)?;
    }
    let file_exists = csv_path.exists();

    let file = OpenOptions::new().create(true).append(true).open(csv_path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    let row = SummaryRow::new(run, duration_secs, pending_left, metrics.snapshot());
    if let Err(e) = writer.serialize(&row) {
        error!("[Export] failed to write summary row: {}", e);
        return Err(e);
    }
    writer.flush()?;
    info!("[Export] summary appended to {}", csv_path.display());
    Ok(())
}
