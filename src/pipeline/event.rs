//! event.rs
//! Observed facts produced by device sensors and queued for delivery.
//!
//! - An event gets its `local_id` exactly once, when the store persists it.
//! - Location/activity/health events point at a related record by lookup id;
//!   the worker resolves those references when it builds the wire payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned, monotonic identifier. Stable for the event's lifetime.
pub type LocalId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LocationChanged,
    ActivityChanged,
    HealthChanged,
    ActionCompleted,
    TrackingStarted,
    TrackingEnded,
}

/// Kind of record an event may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelatedKind {
    Location,
    Activity,
    Health,
}

impl RelatedKind {
    pub const ALL: [RelatedKind; 3] = [RelatedKind::Location, RelatedKind::Activity, RelatedKind::Health];

    pub fn name(&self) -> &'static str {
        match self {
            RelatedKind::Location => "location",
            RelatedKind::Activity => "activity",
            RelatedKind::Health => "health",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "location" => Some(RelatedKind::Location),
            "activity" => Some(RelatedKind::Activity),
            "health" => Some(RelatedKind::Health),
            _ => None,
        }
    }
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::LocationChanged => "location_changed",
            EventKind::ActivityChanged => "activity_changed",
            EventKind::HealthChanged => "health_changed",
            EventKind::ActionCompleted => "action_completed",
            EventKind::TrackingStarted => "tracking_started",
            EventKind::TrackingEnded => "tracking_ended",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "location_changed" => Some(EventKind::LocationChanged),
            "activity_changed" => Some(EventKind::ActivityChanged),
            "health_changed" => Some(EventKind::HealthChanged),
            "action_completed" => Some(EventKind::ActionCompleted),
            "tracking_started" => Some(EventKind::TrackingStarted),
            "tracking_ended" => Some(EventKind::TrackingEnded),
            _ => None,
        }
    }

    /// Related record the server needs alongside this event, if any.
    pub fn required_related(&self) -> Option<RelatedKind> {
        match self {
            EventKind::LocationChanged => Some(RelatedKind::Location),
            EventKind::ActivityChanged => Some(RelatedKind::Activity),
            EventKind::HealthChanged => Some(RelatedKind::Health),
            EventKind::ActionCompleted | EventKind::TrackingStarted | EventKind::TrackingEnded => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub local_id: Option<LocalId>,
    pub user_id: String,
    pub session_id: String,
    pub device_id: String,
    pub kind: EventKind,
    pub recorded_at: DateTime<Utc>,
    pub location_ref: Option<i64>,
    pub activity_ref: Option<i64>,
    pub health_ref: Option<i64>,
    pub metadata: serde_json::Value,
}

impl Event {
    /// Unpersisted event stamped with the current time.
    pub fn new(
        kind: EventKind,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            local_id: None,
            user_id: user_id.into(),
            session_id: session_id.into(),
            device_id: device_id.into(),
            kind,
            recorded_at: Utc::now(),
            location_ref: None,
            activity_ref: None,
            health_ref: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_related(mut self, kind: RelatedKind, ref_id: i64) -> Self {
        match kind {
            RelatedKind::Location => self.location_ref = Some(ref_id),
            RelatedKind::Activity => self.activity_ref = Some(ref_id),
            RelatedKind::Health => self.health_ref = Some(ref_id),
        }
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn related_ref(&self, kind: RelatedKind) -> Option<i64> {
        match kind {
            RelatedKind::Location => self.location_ref,
            RelatedKind::Activity => self.activity_ref,
            RelatedKind::Health => self.health_ref,
        }
    }

    #[inline]
    pub fn is_persisted(&self) -> bool {
        self.local_id.is_some()
    }
}

/// One entry of the JSON array posted to the events endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WireEvent {
    pub id: LocalId,
    pub user_id: String,
    pub session_id: String,
    pub device_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<serde_json::Value>,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_related_matches_kind() {
        assert_eq!(EventKind::LocationChanged.required_related(), Some(RelatedKind::Location));
        assert_eq!(EventKind::ActivityChanged.required_related(), Some(RelatedKind::Activity));
        assert_eq!(EventKind::HealthChanged.required_related(), Some(RelatedKind::Health));
        assert_eq!(EventKind::ActionCompleted.required_related(), None);
        assert_eq!(EventKind::TrackingEnded.required_related(), None);
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            EventKind::LocationChanged,
            EventKind::ActivityChanged,
            EventKind::HealthChanged,
            EventKind::ActionCompleted,
            EventKind::TrackingStarted,
            EventKind::TrackingEnded,
        ] {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(EventKind::from_name("bogus"), None);
    }

    #[test]
    fn new_event_is_unpersisted() {
        let e = Event::new(EventKind::ActivityChanged, "u", "s", "d").with_related(RelatedKind::Activity, 9);
        assert!(!e.is_persisted());
        assert_eq!(e.related_ref(RelatedKind::Activity), Some(9));
        assert_eq!(e.related_ref(RelatedKind::Location), None);
    }

    #[test]
    fn wire_event_uses_type_key_and_skips_missing_records() {
        let wire = WireEvent {
            id: 3,
            user_id: "u".into(),
            session_id: "s".into(),
            device_id: "d".into(),
            kind: EventKind::ActionCompleted,
            recorded_at: Utc::now(),
            location: None,
            activity: None,
            health: None,
            data: serde_json::json!({"action_id": "a1"}),
        };
        let v = serde_json::to_value(&wire).unwrap();
        assert_eq!(v["type"], "action_completed");
        assert!(v.get("location").is_none());
        assert_eq!(v["data"]["action_id"], "a1");
    }
}
