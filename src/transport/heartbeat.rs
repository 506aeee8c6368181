use std::time::Duration;

use super::device::{DeviceClient, HeartbeatError};
use crate::cancel::CancelToken;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub attempts: u64,
    pub pongs: u64,
    pub failures: u64,
    pub last_error: Option<HeartbeatError>,
}

/// Ping every `interval` until `cancel` fires. A failed attempt is logged and
/// counted; the loop keeps going.
pub fn run_heartbeat(
    client: &DeviceClient,
    interval: Duration,
    cancel: &CancelToken,
) -> HeartbeatStats {
    let mut stats = HeartbeatStats::default();
    while !cancel.is_cancelled() {
        stats.attempts += 1;
        match client.send_ping() {
            Ok(()) => {
                stats.pongs += 1;
                log::info!("pinged server");
            }
            Err(e) => {
                stats.failures += 1;
                log::warn!("heartbeat failed: {}", e);
                stats.last_error = Some(e);
            }
        }
        if cancel.wait_timeout(interval) {
            break;
        }
    }
    log::info!(
        "heartbeat stopped after {} attempts ({} pongs)",
        stats.attempts,
        stats.pongs
    );
    stats
}
