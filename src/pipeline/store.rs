//! store.rs
//! Durable record of pending events (and the related records they point at).
//!
//! The pipeline only needs four things from persistence: append, read all
//! pending in id order, bulk delete by id, and look up a related record.
//! `SqliteEventStore` is the on-device implementation; `MemoryEventStore`
//! backs tests and hosts that bring their own durability.
//!
//! - Related records get their own store-assigned ids and go away with the
//!   last event that references them.
//! - A SQLite row that no longer decodes is moved to `quarantined_events`
//!   so it cannot block the rows behind it.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

use chrono::{DateTime, Utc};
use log::{error, warn};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::controls::policy::{ControlPolicy, PolicyStore};
use crate::error::{StoreError, StoreResult};
use crate::pipeline::event::{Event, EventKind, LocalId, RelatedKind};

pub trait EventStore: Send + Sync {
    /// Persists an unpersisted event and returns its new local id.
    fn persist_event(&self, event: &Event) -> StoreResult<LocalId>;

    /// Every pending event, ascending by local id.
    fn read_all_pending(&self) -> StoreResult<Vec<Event>>;

    /// Removes the given ids, plus related records no remaining event
    /// references. Unknown ids are ignored. Returns the events removed.
    fn bulk_delete(&self, ids: &[LocalId]) -> StoreResult<usize>;

    /// Body of a related record, `None` if it does not (yet) exist.
    fn related_record(&self, kind: RelatedKind, ref_id: i64) -> StoreResult<Option<serde_json::Value>>;

    /// Stores a related record; events reference it by the returned id.
    fn put_related_record(&self, kind: RelatedKind, body: &serde_json::Value) -> StoreResult<i64>;
}

fn related_keys(event: &Event) -> impl Iterator<Item = (RelatedKind, i64)> + '_ {
    RelatedKind::ALL
        .into_iter()
        .filter_map(move |kind| event.related_ref(kind).map(|id| (kind, id)))
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    next_id: LocalId,
    next_related_id: i64,
    events: BTreeMap<LocalId, Event>,
    related: HashMap<(RelatedKind, i64), serde_json::Value>,
    policy: Option<ControlPolicy>,
}

/// Process-local store. Ids start at 1 and are never reused.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn contains(&self, id: LocalId) -> bool {
        self.inner.lock().events.contains_key(&id)
    }

    pub fn related_len(&self) -> usize {
        self.inner.lock().related.len()
    }
}

impl EventStore for MemoryEventStore {
    fn persist_event(&self, event: &Event) -> StoreResult<LocalId> {
        if let Some(id) = event.local_id {
            return Err(StoreError::AlreadyPersisted(id));
        }
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let mut stored = event.clone();
        stored.local_id = Some(id);
        inner.events.insert(id, stored);
        Ok(id)
    }

    fn read_all_pending(&self) -> StoreResult<Vec<Event>> {
        Ok(self.inner.lock().events.values().cloned().collect())
    }

    fn bulk_delete(&self, ids: &[LocalId]) -> StoreResult<usize> {
        let mut inner = self.inner.lock();
        let removed: Vec<Event> = ids.iter().filter_map(|id| inner.events.remove(id)).collect();
        let orphaned: Vec<(RelatedKind, i64)> = removed
            .iter()
            .flat_map(related_keys)
            .filter(|&(kind, id)| !inner.events.values().any(|e| e.related_ref(kind) == Some(id)))
            .collect();
        for key in orphaned {
            inner.related.remove(&key);
        }
        Ok(removed.len())
    }

    fn related_record(&self, kind: RelatedKind, ref_id: i64) -> StoreResult<Option<serde_json::Value>> {
        Ok(self.inner.lock().related.get(&(kind, ref_id)).cloned())
    }

    fn put_related_record(&self, kind: RelatedKind, body: &serde_json::Value) -> StoreResult<i64> {
        let mut inner = self.inner.lock();
        inner.next_related_id += 1;
        let id = inner.next_related_id;
        inner.related.insert((kind, id), body.clone());
        Ok(id)
    }
}

impl PolicyStore for MemoryEventStore {
    fn load_policy(&self) -> StoreResult<Option<ControlPolicy>> {
        Ok(self.inner.lock().policy.clone())
    }

    fn save_policy(&self, policy: &ControlPolicy) -> StoreResult<()> {
        self.inner.lock().policy = Some(policy.clone());
        Ok(())
    }
}

// ============================================================================
// SQLite store
// ============================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       TEXT NOT NULL,
    session_id    TEXT NOT NULL,
    device_id     TEXT NOT NULL,
    kind          TEXT NOT NULL,
    recorded_at   TEXT NOT NULL,
    location_ref  INTEGER,
    activity_ref  INTEGER,
    health_ref    INTEGER,
    metadata      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS related_records (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    kind  TEXT NOT NULL,
    body  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS quarantined_events (
    id              INTEGER PRIMARY KEY,
    user_id, session_id, device_id, kind, recorded_at,
    location_ref, activity_ref, health_ref, metadata,
    reason          TEXT NOT NULL,
    quarantined_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS controls (
    slot  INTEGER PRIMARY KEY CHECK (slot = 0),
    body  TEXT NOT NULL
);
";

/// SQLite caps bound parameters per statement; chunk well below it.
const ID_CHUNK: usize = 500;

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

/// SQLite-backed store. One connection, serialised behind a mutex;
/// bulk deletes from concurrent workers simply queue on it.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn quarantined_len(&self) -> StoreResult<usize> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM quarantined_events", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// Moves undecodable rows out of `events`, keeping their raw columns.
fn quarantine(conn: &mut Connection, rows: &[(LocalId, String)]) -> StoreResult<()> {
    let now = Utc::now().to_rfc3339();
    let tx = conn.transaction()?;
    for (id, reason) in rows {
        warn!("[SqliteEventStore] quarantining event {}: {}", id, reason);
        tx.execute(
            "INSERT OR REPLACE INTO quarantined_events
             SELECT id, user_id, session_id, device_id, kind, recorded_at,
                    location_ref, activity_ref, health_ref, metadata, ?2, ?3
             FROM events WHERE id = ?1",
            params![id, reason, now],
        )?;
        tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
    }
    tx.commit()?;
    Ok(())
}

struct EventRow {
    id: LocalId,
    user_id: String,
    session_id: String,
    device_id: String,
    kind: String,
    recorded_at: String,
    location_ref: Option<i64>,
    activity_ref: Option<i64>,
    health_ref: Option<i64>,
    metadata: String,
}

impl EventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            session_id: row.get(2)?,
            device_id: row.get(3)?,
            kind: row.get(4)?,
            recorded_at: row.get(5)?,
            location_ref: row.get(6)?,
            activity_ref: row.get(7)?,
            health_ref: row.get(8)?,
            metadata: row.get(9)?,
        })
    }

    /// The error names why the row cannot become an event.
    fn into_event(self) -> Result<Event, String> {
        let kind = EventKind::from_name(&self.kind).ok_or_else(|| format!("unknown kind {:?}", self.kind))?;
        let recorded_at = DateTime::parse_from_rfc3339(&self.recorded_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("bad recorded_at {:?}: {}", self.recorded_at, e))?;
        let metadata = serde_json::from_str(&self.metadata).map_err(|e| format!("bad metadata: {}", e))?;
        Ok(Event {
            local_id: Some(self.id),
            user_id: self.user_id,
            session_id: self.session_id,
            device_id: self.device_id,
            kind,
            recorded_at,
            location_ref: self.location_ref,
            activity_ref: self.activity_ref,
            health_ref: self.health_ref,
            metadata,
        })
    }
}

impl EventStore for SqliteEventStore {
    fn persist_event(&self, event: &Event) -> StoreResult<LocalId> {
        if let Some(id) = event.local_id {
            return Err(StoreError::AlreadyPersisted(id));
        }
        let metadata = serde_json::to_string(&event.metadata)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (user_id, session_id, device_id, kind, recorded_at,
                                 location_ref, activity_ref, health_ref, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.user_id,
                event.session_id,
                event.device_id,
                event.kind.name(),
                event.recorded_at.to_rfc3339(),
                event.location_ref,
                event.activity_ref,
                event.health_ref,
                metadata,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn read_all_pending(&self) -> StoreResult<Vec<Event>> {
        let mut conn = self.conn.lock();
        let mut out = Vec::new();
        let mut defective = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, session_id, device_id, kind, recorded_at,
                        location_ref, activity_ref, health_ref, metadata
                 FROM events ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, LocalId>(0)?, EventRow::from_row(row))))?;
            for row in rows {
                let (id, decoded) = row?;
                match decoded.map_err(|e| e.to_string()).and_then(EventRow::into_event) {
                    Ok(event) => out.push(event),
                    Err(reason) => defective.push((id, reason)),
                }
            }
        }

        if !defective.is_empty() {
            if let Err(e) = quarantine(&mut conn, &defective) {
                error!("[SqliteEventStore] quarantining {} row(s) failed: {}", defective.len(), e);
            }
        }
        Ok(out)
    }

    fn bulk_delete(&self, ids: &[LocalId]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        let mut refs: Vec<i64> = Vec::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let marks = placeholders(chunk.len());
            {
                let sql = format!(
                    "SELECT location_ref, activity_ref, health_ref FROM events WHERE id IN ({})",
                    marks
                );
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                    Ok([row.get::<_, Option<i64>>(0)?, row.get(1)?, row.get(2)?])
                })?;
                for row in rows {
                    refs.extend(row?.into_iter().flatten());
                }
            }
            let sql = format!("DELETE FROM events WHERE id IN ({})", marks);
            deleted += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }

        refs.sort_unstable();
        refs.dedup();
        for chunk in refs.chunks(ID_CHUNK) {
            let sql = format!(
                "DELETE FROM related_records WHERE id IN ({}) AND NOT EXISTS (
                     SELECT 1 FROM events e
                     WHERE e.location_ref = related_records.id
                        OR e.activity_ref = related_records.id
                        OR e.health_ref = related_records.id)",
                placeholders(chunk.len())
            );
            tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn related_record(&self, kind: RelatedKind, ref_id: i64) -> StoreResult<Option<serde_json::Value>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM related_records WHERE kind = ?1 AND id = ?2",
                params![kind.name(), ref_id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }

    fn put_related_record(&self, kind: RelatedKind, body: &serde_json::Value) -> StoreResult<i64> {
        let body = serde_json::to_string(body)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO related_records (kind, body) VALUES (?1, ?2)",
            params![kind.name(), body],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl PolicyStore for SqliteEventStore {
    fn load_policy(&self) -> StoreResult<Option<ControlPolicy>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row("SELECT body FROM controls WHERE slot = 0", [], |row| row.get(0))
            .optional()?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }

    fn save_policy(&self, policy: &ControlPolicy) -> StoreResult<()> {
        let body = serde_json::to_string(policy)?;
        self.conn.lock().execute(
            "INSERT INTO controls (slot, body) VALUES (0, ?1)
             ON CONFLICT(slot) DO UPDATE SET body = excluded.body",
            params![body],
        )?;
        Ok(())
    }
}
