//! producer.rs
//! Synthetic sensor feed for the demo binary.
//!
//! Emits a random-walk location fix every period and persists it as a
//! related record plus a `LocationChanged` event, but only once the walk
//! has moved at least the current policy's minimum displacement. Policy
//! changes arrive over the bus. Every tenth fix also records an action.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crossbeam::channel::Receiver;
use log::{debug, warn};
use serde_json::json;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::controls::bus::PolicyEvent;
use crate::pipeline::{
    event::{Event, EventKind, RelatedKind},
    store::EventStore,
};

/// Metres per degree of latitude, close enough for a demo walk.
const METRES_PER_DEGREE: f64 = 111_320.0;

#[derive(Debug, Clone)]
pub struct ProducerIdentity {
    pub user_id: String,
    pub session_id: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Copy)]
struct Fix {
    lat: f64,
    lon: f64,
}

impl Fix {
    fn distance_m(&self, other: &Fix) -> f64 {
        let dlat = (self.lat - other.lat) * METRES_PER_DEGREE;
        let dlon = (self.lon - other.lon) * METRES_PER_DEGREE * self.lat.to_radians().cos();
        (dlat * dlat + dlon * dlon).sqrt()
    }
}

/// Runs until `running` is cleared. Returns the number of events persisted.
pub async fn run_producer(
    store: Arc<dyn EventStore>,
    identity: ProducerIdentity,
    policy_events: Receiver<PolicyEvent>,
    initial_displacement_m: f64,
    period: Duration,
    running: Arc<AtomicBool>,
) -> u64 {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut displacement_m = initial_displacement_m;
    let mut position = Fix { lat: 52.5200, lon: 13.4050 };
    let mut last_sent: Option<Fix> = None;
    let mut seq: i64 = 0;
    let mut persisted = 0u64;

    persist(&store, Event::new(EventKind::TrackingStarted, &identity.user_id, &identity.session_id, &identity.device_id), &mut persisted);

    while running.load(Ordering::Relaxed) {
        interval.tick().await;

        while let Ok(event) = policy_events.try_recv() {
            if let PolicyEvent::Changed { current, .. } = event {
                if current.minimum_displacement_m != displacement_m {
                    debug!("[Producer] displacement {}m → {}m", displacement_m, current.minimum_displacement_m);
                    displacement_m = current.minimum_displacement_m;
                }
            }
        }

        // ~0-40 m per step
        position.lat += rand::random_range(-0.0002..0.0002);
        position.lon += rand::random_range(-0.0002..0.0002);
        seq += 1;

        let moved_enough = last_sent.is_none_or(|prev| prev.distance_m(&position) >= displacement_m);
        if moved_enough {
            let record = json!({
                "latitude": position.lat,
                "longitude": position.lon,
                "accuracy": rand::random_range(3.0..25.0),
            });
            let record_id = match store.put_related_record(RelatedKind::Location, &record) {
                Ok(id) => id,
                Err(e) => {
                    warn!("[Producer] storing location record failed: {}", e);
                    continue;
                }
            };
            let event = Event::new(EventKind::LocationChanged, &identity.user_id, &identity.session_id, &identity.device_id)
                .with_related(RelatedKind::Location, record_id);
            persist(&store, event, &mut persisted);
            last_sent = Some(position);
        }

        if seq % 10 == 0 {
            let event = Event::new(EventKind::ActionCompleted, &identity.user_id, &identity.session_id, &identity.device_id)
                .with_metadata(json!({ "action": "checkpoint", "seq": seq }));
            persist(&store, event, &mut persisted);
        }
    }

    persist(&store, Event::new(EventKind::TrackingEnded, &identity.user_id, &identity.session_id, &identity.device_id), &mut persisted);
    persisted
}

fn persist(store: &Arc<dyn EventStore>, event: Event, persisted: &mut u64) {
    match store.persist_event(&event) {
        Ok(id) => {
            *persisted += 1;
            debug!("[Producer] persisted {} as {}", event.kind.name(), id);
        }
        Err(e) => warn!("[Producer] persisting {} failed: {}", event.kind.name(), e),
    }
}
