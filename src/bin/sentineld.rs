//! sentineld - hornet detection daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by SENTINEL_CONFIG, then SENTINEL_* env)
//! 2. Registers the device once and caches its id
//! 3. Runs the frame loop: detect, track, dedup, save
//! 4. Pings the server on a fixed interval until the source ends or Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use hornet_sentinel::config::SentinelConfig;
use hornet_sentinel::{
    CancelToken, DeviceClient, DeviceIdentity, Engine, FrameSource, Orchestrator,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML by extension). Overrides SENTINEL_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run without registering or pinging the server.
    #[arg(long)]
    offline: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => SentinelConfig::load_from(Some(path.as_path()))?,
        None => SentinelConfig::load()?,
    };

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("shutdown signal received, stopping...");
        on_interrupt.cancel();
    })
    .context("set Ctrl-C handler")?;

    let online = cfg.server.enabled && !args.offline;
    let client = if online {
        let client = DeviceClient::new(&cfg.server.url, cfg.server.timeout)?;
        let registration = cfg
            .device
            .registration
            .jittered(cfg.device.jitter_deg, &mut rand::thread_rng());
        let identity =
            DeviceIdentity::load_or_register(&cfg.device.id_path, &client, &registration)
                .context("device registration failed")?;
        Some(client.with_device_id(identity.id))
    } else {
        None
    };
    let device_id = match &client {
        Some(c) => c.device_id().unwrap_or_default().to_string(),
        None => DeviceIdentity::load(&cfg.device.id_path)?.unwrap_or_else(|| "offline".into()),
    };

    let gateway = cfg.open_gateway()?;
    let source = cfg.build_source()?;
    let detector = cfg.build_detector()?;

    let mut engine = Engine::new(
        cfg.build_tracker(),
        cfg.events,
        Box::new(gateway),
        device_id.clone(),
    )
    .with_confidence_threshold(cfg.detector.confidence);
    if let (Some(c), true) = (&client, cfg.server.notify_events) {
        engine = engine.with_notifier(c.clone());
    }

    log::info!(
        "sentineld running. device={} source={} store={} tracker={:?}",
        device_id,
        source.describe(),
        cfg.storage.db_path,
        cfg.tracker.kind
    );

    let mut orchestrator = Orchestrator::new(cancel).with_pacing(cfg.source.frame_interval);
    if let Some(c) = client {
        orchestrator = orchestrator.with_heartbeat(c, cfg.server.heartbeat_interval);
    }
    let summary = orchestrator.run(Box::new(source), detector, engine)?;

    log::info!(
        "frames={} detections={} saved={} suppressed={} dropped={} detector_errors={}",
        summary.frames.frames,
        summary.frames.detections,
        summary.frames.persisted,
        summary.frames.suppressed,
        summary.frames.dropped,
        summary.frames.detector_errors
    );
    if let Some(hb) = summary.heartbeat {
        log::info!(
            "heartbeat attempts={} pongs={} failures={}",
            hb.attempts,
            hb.pongs,
            hb.failures
        );
    }
    Ok(())
}
