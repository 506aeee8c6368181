//! export_detections - dump stored detection events as JSON

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::time::Duration;

use hornet_sentinel::storage::DEFAULT_BUSY_TIMEOUT;
use hornet_sentinel::{unix_millis, EventRecord, SightingState, SqliteGateway};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the detection store.
    #[arg(long, env = "SENTINEL_DB_PATH", default_value = "sentinel.db")]
    db_path: String,
    /// Maximum events to export, oldest first.
    #[arg(long, default_value_t = 1000)]
    limit: usize,
    /// Output file (stdout when omitted).
    #[arg(long)]
    output: Option<String>,
    /// SQLite busy timeout in milliseconds.
    #[arg(long)]
    busy_timeout_ms: Option<u64>,
}

#[derive(Serialize)]
struct ExportRow {
    id: String,
    device_id: String,
    reference_id: String,
    is_manual: bool,
    track_id: u64,
    sighting: SightingState,
    timestamp_ms: i64,
    first_detection_ms: i64,
    second_detection_ms: Option<i64>,
    direction: f64,
    active_tracks: usize,
}

impl ExportRow {
    fn from_record(record: EventRecord) -> Result<Self> {
        let ev = record.event;
        Ok(Self {
            id: record.event_id,
            device_id: record.device_id,
            reference_id: record.reference_id,
            is_manual: record.is_manual,
            track_id: ev.track_id,
            sighting: ev.state,
            timestamp_ms: unix_millis(ev.timestamp)?,
            first_detection_ms: unix_millis(ev.first_detection)?,
            second_detection_ms: ev.second_detection.map(unix_millis).transpose()?,
            direction: ev.direction,
            active_tracks: ev.active_tracks,
        })
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let busy_timeout = args
        .busy_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_BUSY_TIMEOUT);
    let gateway = SqliteGateway::open(&args.db_path, busy_timeout)?;
    let rows = gateway
        .list_events(args.limit)?
        .into_iter()
        .map(ExportRow::from_record)
        .collect::<Result<Vec<_>>>()?;

    let json = serde_json::to_string_pretty(&rows)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("write export {}", path))?;
            log::info!("exported {} events to {}", rows.len(), path);
        }
        None => println!("{}", json),
    }
    Ok(())
}
