//! mock_device - emulated field device
//!
//! Registers (or reuses a cached id), pings the server and optionally sends a
//! few synthetic detection events. No camera, no local store.

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use hornet_sentinel::transport::run_heartbeat;
use hornet_sentinel::{CancelToken, DeviceClient, DeviceIdentity, Registration};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server base url.
    #[arg(long, env = "SENTINEL_SERVER_URL", default_value = "http://localhost:5089")]
    url: String,
    /// Where the assigned device id is cached.
    #[arg(long, env = "SENTINEL_DEVICE_ID_PATH", default_value = "./data/id")]
    id_path: PathBuf,
    /// Seconds between pings.
    #[arg(long, default_value_t = 10)]
    interval_secs: u64,
    /// Stop after this many pings (0 pings until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    pings: u64,
    /// Detection events to send after pinging.
    #[arg(long, default_value_t = 0)]
    events: u32,
    /// Random offset applied to the registered coordinates, in degrees.
    #[arg(long, default_value_t = 0.01)]
    jitter_deg: f64,
    /// Request timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || on_interrupt.cancel()).context("set Ctrl-C handler")?;

    let client = DeviceClient::new(&args.url, Duration::from_secs(args.timeout_secs))?;
    let mut rng = rand::thread_rng();
    let registration = Registration::default().jittered(args.jitter_deg, &mut rng);
    let identity = DeviceIdentity::load_or_register(&args.id_path, &client, &registration)?;
    let client = client.with_device_id(identity.id);

    let interval = Duration::from_secs(args.interval_secs.max(1));
    if args.pings == 0 {
        run_heartbeat(&client, interval, &cancel);
    } else {
        for i in 0..args.pings {
            match client.send_ping() {
                Ok(()) => log::info!("sent ping to server"),
                Err(e) => log::warn!("ping failed: {}", e),
            }
            if i + 1 < args.pings && cancel.wait_timeout(interval) {
                break;
            }
        }
    }

    for _ in 0..args.events {
        if cancel.is_cancelled() {
            break;
        }
        let direction = f64::from(5 + rng.gen_range(-3..3));
        if let Err(e) = client.send_detection_event(direction, SystemTime::now()) {
            log::warn!("{:#}", e);
        }
        cancel.wait_timeout(Duration::from_secs(1));
    }
    Ok(())
}
