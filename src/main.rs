//! # tracking-pipeline demo host
//!
//! Runs the transmission pipeline end to end against a real ingestion endpoint.
//!
//! ## Flow
//! - **Store:** SQLite file (`--store`), WAL mode; survives restarts.
//! - **Producer:** synthetic random-walk location fixes and periodic actions.
//! - **Device:** starts on battery; plugs in halfway through the run, which
//!   promotes the aggressive policy.
//! - **Lifecycle:** foreground at start, server controls pulled once,
//!   background + shutdown at the end.
//!
//! ## Outputs
//! - `data/logs/transmission_summary.csv` (configurable): one row per run.
//!
//! `RUST_LOG=tracking_pipeline=debug` shows per-batch activity.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use tracking_pipeline::{
    Pipeline, PipelineConfig, PipelineDeps,
    controls::device::{DeviceState, NetworkState, NetworkType, PowerState, SharedDeviceState},
    host::producer::{ProducerIdentity, run_producer},
    pipeline::{store::SqliteEventStore, transport::HttpTransport},
    utils::export::export_summary_csv,
};

const PRODUCER_PERIOD: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "tracking-pipeline")]
#[command(about = "Batches device events and delivers them under an adaptive control policy")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tracking-pipeline.toml")]
    config: PathBuf,

    /// SQLite store path (overrides config file)
    #[arg(short, long, env = "TRACKING_STORE")]
    store: Option<PathBuf>,

    /// How long to run the producer
    #[arg(short, long, default_value_t = 60)]
    duration_secs: u64,

    /// Ingestion endpoint base URL (overrides config file)
    #[arg(short, long, env = "TRACKING_ENDPOINT")]
    endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    info!("=== TRACKING PIPELINE START ===");
    info!("Config file: {}", cli.config.display());

    let mut config = PipelineConfig::load(&cli.config).context("loading configuration")?;
    if let Some(endpoint) = cli.endpoint {
        config.transport.endpoint = endpoint;
    }
    if let Some(store) = cli.store {
        config.store.path = store.to_string_lossy().into_owned();
    }

    let store_path = Path::new(&config.store.path);
    if let Some(parent) = store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(SqliteEventStore::open(store_path).context("opening event store")?);
    let transport = Arc::new(
        HttpTransport::new(config.transport.endpoint.clone(), config.request_timeout())
            .context("building HTTP client")?,
    );
    let device = Arc::new(SharedDeviceState::new(DeviceState {
        power: Some(PowerState { charging: false, full: false, battery_percent: 45.0 }),
        network: Some(NetworkState { connected: true, kind: NetworkType::Wifi }),
    }));

    info!("Endpoint: {}", config.transport.endpoint);
    info!("Store: {}", config.store.path);

    let pipeline = Pipeline::start(&config, PipelineDeps::new(store.clone(), transport, device.clone()))?;
    pipeline.on_foreground();
    let policy = pipeline.on_server_controls_refreshed().await;
    info!("[Main] policy after server refresh: {:?} every {}s", policy.origin, policy.batch_interval_secs);

    // ========================================================================
    // Producer
    // ========================================================================
    let running = Arc::new(AtomicBool::new(true));
    let producer = tokio::spawn(run_producer(
        store.clone(),
        ProducerIdentity {
            user_id: config.identity.user_id.clone(),
            session_id: format!("session-{}", chrono::Utc::now().timestamp()),
            device_id: config.identity.device_id.clone(),
        },
        pipeline.subscribe_policy(),
        policy.minimum_displacement_m,
        PRODUCER_PERIOD,
        running.clone(),
    ));

    let started = Instant::now();
    let half = Duration::from_secs(cli.duration_secs / 2);
    tokio::time::sleep(half).await;

    info!("[Main] device plugged in");
    device.set_power(PowerState { charging: true, full: false, battery_percent: 46.0 });
    pipeline.on_device_state_changed();

    tokio::time::sleep(Duration::from_secs(cli.duration_secs).saturating_sub(half)).await;
    info!("[Main] time's up; stopping producer");
    running.store(false, Ordering::Relaxed);
    let produced = producer.await.unwrap_or_else(|e| {
        error!("[Main] producer task failed: {}", e);
        0
    });

    let drained = pipeline.on_background().await;
    info!("[Main] background flush drained: {}", drained);
    pipeline.shutdown().await;

    let pending = pipeline.pending_count().unwrap_or_else(|e| {
        error!("[Main] counting pending events failed: {}", e);
        0
    });
    let snapshot = pipeline.metrics().snapshot();
    info!(
        "[Main] produced={} delivered={} rejected={} retries={} pending={}",
        produced, snapshot.events_delivered, snapshot.events_rejected, snapshot.retries, pending
    );

    if let Err(e) = export_summary_csv(
        Path::new(&config.store.summary_csv),
        &config.identity.device_id,
        started.elapsed().as_secs(),
        pending,
        pipeline.metrics(),
    ) {
        error!("[Main] summary export failed: {}", e);
    }

    info!("=== TRACKING PIPELINE FINISHED ===");
    Ok(())
}
