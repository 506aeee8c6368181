//! Persistence gateways for detection events.
//!
//! Every save needs a reference id first (foreign-key prerequisite), resolved
//! fresh on each call. Delivery is at-most-once and best-effort: a failed save
//! is reported to the caller and then forgotten.

use anyhow::{anyhow, Context, Result};
use rand::seq::SliceRandom;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::lifecycle::{DetectionEvent, SightingState};
use crate::{from_unix_millis, open_db_connection, unix_millis};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistError {
    /// No reference id could be resolved; nothing was written.
    ReferenceUnavailable(String),
    /// The write failed and was rolled back.
    WriteFailed(String),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::ReferenceUnavailable(msg) => {
                write!(f, "reference id unavailable: {}", msg)
            }
            PersistError::WriteFailed(msg) => write!(f, "event write failed: {}", msg),
        }
    }
}

impl std::error::Error for PersistError {}

/// What the gateway stores for one forwarded event.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub device_id: String,
    pub reference_id: String,
    pub is_manual: bool,
    #[serde(flatten)]
    pub event: DetectionEvent,
}

impl EventRecord {
    pub fn new(event: DetectionEvent, device_id: &str, reference_id: String) -> Self {
        Self {
            event_id: crate::new_event_id(),
            device_id: device_id.to_string(),
            reference_id,
            is_manual: false,
            event,
        }
    }
}

pub trait PersistenceGateway: Send {
    fn resolve_reference_id(&mut self) -> Result<String, PersistError>;

    fn save_event(&mut self, record: &EventRecord) -> Result<(), PersistError>;
}

// -------------------- SQLite --------------------

pub struct SqliteGateway {
    conn: Connection,
}

impl SqliteGateway {
    pub fn open(db_path: &str, busy_timeout: Duration) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open detection store {}", db_path))?;
        conn.busy_timeout(busy_timeout)?;
        let mut gateway = Self { conn };
        gateway.ensure_schema()?;
        Ok(gateway)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS known_references (
              id TEXT PRIMARY KEY,
              label TEXT
            );

            CREATE TABLE IF NOT EXISTS detection_events (
              id TEXT PRIMARY KEY,
              recorded_at INTEGER NOT NULL,
              track_id INTEGER NOT NULL,
              sighting TEXT NOT NULL,
              direction REAL NOT NULL,
              first_detection INTEGER NOT NULL,
              second_detection INTEGER,
              is_manual INTEGER NOT NULL,
              active_tracks INTEGER NOT NULL,
              device_id TEXT NOT NULL,
              reference_id TEXT NOT NULL REFERENCES known_references(id)
            );

            CREATE INDEX IF NOT EXISTS idx_detection_events_recorded
              ON detection_events(recorded_at);
            "#,
        )?;
        Ok(())
    }

    /// Insert a known reference unless it is already present.
    pub fn seed_reference(&mut self, id: &str, label: Option<&str>) -> Result<()> {
        if id.trim().is_empty() {
            return Err(anyhow!("reference id must not be empty"));
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO known_references(id, label) VALUES (?1, ?2)",
            params![id, label],
        )?;
        Ok(())
    }

    pub fn reference_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM known_references", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn event_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM detection_events", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Stored events, oldest first.
    pub fn list_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, recorded_at, track_id, sighting, direction, first_detection,
                   second_detection, is_manual, active_tracks, device_id, reference_id
            FROM detection_events
            ORDER BY recorded_at ASC, rowid ASC
            LIMIT ?1
            "#,
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let sighting: String = row.get(3)?;
            let state = match sighting.as_str() {
                "FIRST_RECORDED" => SightingState::FirstRecorded,
                "REPEATED" => SightingState::Repeated,
                other => return Err(anyhow!("corrupt detection event: sighting {}", other)),
            };
            let track_id: i64 = row.get(2)?;
            let active_tracks: i64 = row.get(8)?;
            let second: Option<i64> = row.get(6)?;
            out.push(EventRecord {
                event_id: row.get(0)?,
                is_manual: row.get(7)?,
                device_id: row.get(9)?,
                reference_id: row.get(10)?,
                event: DetectionEvent {
                    track_id: u64::try_from(track_id)
                        .map_err(|_| anyhow!("corrupt detection event: track id"))?,
                    state,
                    timestamp: from_unix_millis(row.get(1)?)?,
                    first_detection: from_unix_millis(row.get(5)?)?,
                    second_detection: second.map(from_unix_millis).transpose()?,
                    direction: row.get(4)?,
                    active_tracks: active_tracks as usize,
                },
            });
        }
        Ok(out)
    }

    fn insert_event(&mut self, record: &EventRecord) -> Result<()> {
        let ev = &record.event;
        let recorded_at = unix_millis(ev.timestamp)?;
        let first = unix_millis(ev.first_detection)?;
        let second = ev.second_detection.map(unix_millis).transpose()?;
        let track_id =
            i64::try_from(ev.track_id).map_err(|_| anyhow!("track id exceeds i64 range"))?;
        let sighting = match ev.state {
            SightingState::FirstRecorded => "FIRST_RECORDED",
            SightingState::Repeated => "REPEATED",
        };

        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO detection_events(
              id, recorded_at, track_id, sighting, direction, first_detection,
              second_detection, is_manual, active_tracks, device_id, reference_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.event_id,
                recorded_at,
                track_id,
                sighting,
                ev.direction,
                first,
                second,
                record.is_manual,
                ev.active_tracks as i64,
                record.device_id,
                record.reference_id
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

impl PersistenceGateway for SqliteGateway {
    fn resolve_reference_id(&mut self) -> Result<String, PersistError> {
        self.conn
            .query_row(
                "SELECT id FROM known_references ORDER BY RANDOM() LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| PersistError::ReferenceUnavailable(e.to_string()))?
            .ok_or_else(|| {
                PersistError::ReferenceUnavailable("known_references is empty".to_string())
            })
    }

    fn save_event(&mut self, record: &EventRecord) -> Result<(), PersistError> {
        self.insert_event(record)
            .map_err(|e| PersistError::WriteFailed(format!("{:#}", e)))
    }
}

// -------------------- In-memory --------------------

#[derive(Debug, Default)]
struct InMemoryState {
    references: Vec<String>,
    events: Vec<EventRecord>,
    fail_resolution: bool,
    fail_writes: bool,
    resolutions: usize,
}

/// Gateway backed by process memory. Clones share the same store, so a test
/// can keep a handle while the engine owns another.
#[derive(Clone, Debug, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryGateway {
    pub fn with_references<I, S>(references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let gateway = Self::default();
        gateway.lock().references = references.into_iter().map(Into::into).collect();
        gateway
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_fail_resolution(&self, fail: bool) {
        self.lock().fail_resolution = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.lock().events.clone()
    }

    /// Number of `resolve_reference_id` calls so far, successful or not.
    pub fn resolutions(&self) -> usize {
        self.lock().resolutions
    }
}

impl PersistenceGateway for InMemoryGateway {
    fn resolve_reference_id(&mut self) -> Result<String, PersistError> {
        let mut state = self.lock();
        state.resolutions += 1;
        if state.fail_resolution {
            return Err(PersistError::ReferenceUnavailable(
                "reference lookup disabled".to_string(),
            ));
        }
        state
            .references
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| PersistError::ReferenceUnavailable("no known references".to_string()))
    }

    fn save_event(&mut self, record: &EventRecord) -> Result<(), PersistError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(PersistError::WriteFailed("writes disabled".to_string()));
        }
        if !state.references.contains(&record.reference_id) {
            return Err(PersistError::WriteFailed(format!(
                "unknown reference id {}",
                record.reference_id
            )));
        }
        state.events.push(record.clone());
        Ok(())
    }
}
