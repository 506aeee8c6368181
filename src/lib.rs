//! Hornet Sentinel
//!
//! On-device pipeline that turns per-frame detections into deduplicated
//! detection events.
//!
//! # Architecture
//!
//! Each frame flows through the same sequential path:
//!
//! 1. **Ingest**: a `FrameSource` yields frames until it reports end-of-stream.
//! 2. **Detect**: a `DetectorBackend` produces bounding boxes with confidence.
//! 3. **Track**: an `IdentityTracker` assigns stable ids across frames.
//! 4. **Lifecycle**: the `EventLifecycleManager` records first/repeat sightings
//!    and rate limits forwards per track id.
//! 5. **Persist**: a `PersistenceGateway` resolves a reference id and stores the
//!    event. Delivery is at-most-once and best-effort.
//!
//! A heartbeat task runs next to the frame loop; both are coordinated by a
//! `CancelToken` (see `orchestrator`).
//!
//! # Module Structure
//!
//! - `frame`: decoded RGB frames
//! - `ingest`: frame sources (synthetic, image directories)
//! - `detect`: detector backends (replay, tract)
//! - `track`: identity trackers (color signature, IoU motion)
//! - `lifecycle`, `direction`: event decisions
//! - `storage`: persistence gateways (SQLite, in-memory)
//! - `transport`: device registration / heartbeat protocol
//! - `pipeline`, `orchestrator`: wiring

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod cancel;
pub mod config;
pub mod detect;
pub mod direction;
pub mod frame;
pub mod ingest;
pub mod lifecycle;
pub mod orchestrator;
pub mod pipeline;
pub mod storage;
pub mod track;
pub mod transport;

pub use cancel::CancelToken;
pub use detect::{BBox, Detection, DetectorBackend, ReplayBackend};
pub use direction::estimate_direction;
pub use frame::{Frame, FrameSource};
pub use ingest::{file::FileConfig, FileSource};
pub use lifecycle::{
    Decision, DetectionEvent, EventLifecycleManager, EventPolicy, RateLimiter, SightingState,
};
pub use orchestrator::{Orchestrator, RunSummary};
pub use pipeline::{Engine, FrameReport, LoopStats};
pub use storage::{EventRecord, InMemoryGateway, PersistError, PersistenceGateway, SqliteGateway};
pub use track::{
    color::{ColorSignature, ColorSignatureTracker, SignatureMode},
    motion::{IouTracker, IouTrackerParams},
    IdentityTracker, TrackId, TrackedObject,
};
pub use transport::{DeviceClient, DeviceIdentity, HeartbeatError, MessageType, Registration};

/// SQLite URI for a private shared-cache in-memory database (tests, dry runs).
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:hornet_sentinel_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

// -------------------- Time --------------------

/// Milliseconds since the Unix epoch.
pub fn unix_millis(t: SystemTime) -> Result<i64> {
    let since = t
        .duration_since(UNIX_EPOCH)
        .map_err(|_| anyhow!("timestamp predates unix epoch"))?;
    i64::try_from(since.as_millis()).map_err(|_| anyhow!("timestamp exceeds i64 range"))
}

pub fn from_unix_millis(ms: i64) -> Result<SystemTime> {
    let ms = u64::try_from(ms).map_err(|_| anyhow!("negative unix timestamp {}", ms))?;
    Ok(UNIX_EPOCH + Duration::from_millis(ms))
}

/// Random RFC 4122 version-4 identifier for stored events.
pub fn new_event_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_millis_round_trips_through_system_time() {
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        let ms = unix_millis(t).unwrap();
        assert_eq!(ms, 1_700_000_000_123);
        assert_eq!(from_unix_millis(ms).unwrap(), t);
    }

    #[test]
    fn negative_millis_are_rejected() {
        assert!(from_unix_millis(-1).is_err());
    }

    #[test]
    fn event_ids_are_uuid_v4_shaped() {
        let id = new_event_id();
        assert_eq!(id.len(), 36);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(parts[2].starts_with('4'));
        assert_ne!(new_event_id(), id);
    }
}
