//! Shared fixtures for the integration tests: a scripted transport and
//! helpers to seed a memory store and wire a worker context.

#![allow(dead_code)]

use std::{collections::VecDeque, io::Read, sync::Arc};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use tokio::{
    sync::{Semaphore, watch},
    time::Instant,
};

use tracking_pipeline::{
    controls::device::{DeviceState, NetworkState, NetworkType, SharedDeviceState},
    error::TransportError,
    pipeline::{
        event::{Event, EventKind, LocalId, RelatedKind},
        in_flight::InFlightTracker,
        scheduler::partition,
        store::{EventStore, MemoryEventStore},
        transport::{RequestHeaders, Transport, TransportResponse},
        worker::{Batch, RetryPolicy, WorkerContext},
    },
    utils::metrics::TransmissionMetrics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Status(u16),
    Timeout,
}

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub at: Instant,
    pub path: String,
    pub ids: Vec<LocalId>,
    pub payload: serde_json::Value,
    pub headers: RequestHeaders,
}

/// Replies from a script, then from `fallback` once the script runs out.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    gate: Option<Semaphore>,
    pub posts: Mutex<Vec<RecordedPost>>,
    pub gets: Mutex<Vec<String>>,
    pub controls_body: Mutex<Option<(u16, String)>>,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = Scripted>, fallback: Scripted) -> Arc<Self> {
        Arc::new(Self::build(script, fallback, None))
    }

    pub fn always(reply: Scripted) -> Arc<Self> {
        Self::new([], reply)
    }

    /// Every post blocks until `open_gate` hands out a permit.
    pub fn gated(fallback: Scripted) -> Arc<Self> {
        Arc::new(Self::build([], fallback, Some(Semaphore::new(0))))
    }

    fn build(script: impl IntoIterator<Item = Scripted>, fallback: Scripted, gate: Option<Semaphore>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            gate,
            posts: Mutex::new(Vec::new()),
            gets: Mutex::new(Vec::new()),
            controls_body: Mutex::new(None),
        }
    }

    pub fn open_gate(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn set_controls(&self, status: u16, body: &str) {
        *self.controls_body.lock() = Some((status, body.to_string()));
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().len()
    }

    pub fn sent_ids(&self) -> Vec<Vec<LocalId>> {
        self.posts.lock().iter().map(|p| p.ids.clone()).collect()
    }
}

pub fn gunzip_json(body: &[u8]) -> serde_json::Value {
    let mut text = String::new();
    GzDecoder::new(body).read_to_string(&mut text).unwrap();
    serde_json::from_str(&text).unwrap()
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, path: &str, body: &[u8], headers: &RequestHeaders) -> Result<TransportResponse, TransportError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let payload = gunzip_json(body);
        let ids = payload
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_i64().unwrap())
            .collect();
        self.posts.lock().push(RecordedPost {
            at: Instant::now(),
            path: path.to_string(),
            ids,
            payload,
            headers: headers.clone(),
        });

        let reply = self.script.lock().pop_front().unwrap_or(self.fallback);
        match reply {
            Scripted::Status(status) => Ok(TransportResponse::new(status, "")),
            Scripted::Timeout => Err(TransportError::Timeout),
        }
    }

    async fn get(&self, path: &str, _headers: &RequestHeaders) -> Result<TransportResponse, TransportError> {
        self.gets.lock().push(path.to_string());
        match self.controls_body.lock().clone() {
            Some((status, body)) => Ok(TransportResponse::new(status, body)),
            None => Ok(TransportResponse::new(404, "")),
        }
    }
}

pub fn headers() -> RequestHeaders {
    RequestHeaders {
        auth_token: "sk_test".into(),
        device_id: "device-1".into(),
        app_id: "com.example.tracker".into(),
        sdk_version: "0.1.0".into(),
        os_version: "linux".into(),
        timezone: "Europe/Berlin".into(),
    }
}

pub fn online_device() -> Arc<SharedDeviceState> {
    Arc::new(SharedDeviceState::new(DeviceState {
        power: None,
        network: Some(NetworkState { connected: true, kind: NetworkType::Wifi }),
    }))
}

/// Persists `n` action events; returns their ids in order.
pub fn seed_actions(store: &MemoryEventStore, n: usize) -> Vec<LocalId> {
    (0..n)
        .map(|i| {
            let event = Event::new(EventKind::ActionCompleted, "user-1", "session-1", "device-1")
                .with_metadata(serde_json::json!({ "n": i }));
            store.persist_event(&event).unwrap()
        })
        .collect()
}

/// Persists a location event; with `record` false it points at a location
/// record that does not exist.
pub fn seed_location(store: &MemoryEventStore, record: bool) -> LocalId {
    let ref_id = if record {
        store
            .put_related_record(RelatedKind::Location, &serde_json::json!({ "lat": 1.0, "lon": 2.0 }))
            .unwrap()
    } else {
        -1
    };
    let event = Event::new(EventKind::LocationChanged, "user-1", "session-1", "device-1")
        .with_related(RelatedKind::Location, ref_id);
    store.persist_event(&event).unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryEventStore>,
    pub transport: Arc<ScriptedTransport>,
    pub device: Arc<SharedDeviceState>,
    pub in_flight: Arc<InFlightTracker>,
    pub metrics: Arc<TransmissionMetrics>,
    pub shutdown_tx: watch::Sender<bool>,
    pub ctx: WorkerContext,
}

impl Harness {
    pub fn new(transport: Arc<ScriptedTransport>) -> Self {
        let store = Arc::new(MemoryEventStore::new());
        let device = online_device();
        let in_flight = Arc::new(InFlightTracker::new());
        let metrics = Arc::new(TransmissionMetrics::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = WorkerContext {
            store: store.clone(),
            transport: transport.clone(),
            in_flight: in_flight.clone(),
            device: device.clone(),
            metrics: metrics.clone(),
            headers: headers(),
            events_path: "/v1/events".into(),
            retry: RetryPolicy::default(),
            shutdown: shutdown_rx,
        };
        Self {
            store,
            transport,
            device,
            in_flight,
            metrics,
            shutdown_tx,
            ctx,
        }
    }

    /// Claims every pending event the way a scheduler tick does.
    pub fn claim_batches(&self, size: usize) -> Vec<Batch> {
        let store = self.store.clone();
        self.in_flight
            .claim(|| store.read_all_pending(), |pending| partition(pending, size))
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, events)| Batch { seq: i as u64 + 1, events })
            .collect()
    }
}
