use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use hornet_sentinel::config::SentinelConfig;
use hornet_sentinel::track::TrackerKind;
use hornet_sentinel::SignatureMode;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SENTINEL_CONFIG",
        "SENTINEL_SERVER_URL",
        "SENTINEL_DB_PATH",
        "SENTINEL_SOURCE",
        "SENTINEL_DETECTIONS",
        "SENTINEL_CONFIDENCE",
        "SENTINEL_TRACKER",
        "SENTINEL_SAVE_DELAY_SECS",
        "SENTINEL_DEVICE_ID_PATH",
        "SENTINEL_MODEL_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = SentinelConfig::load().expect("load defaults");
    assert!(cfg.server.enabled);
    assert_eq!(cfg.server.url, "http://localhost:5089");
    assert_eq!(cfg.server.heartbeat_interval, Duration::from_secs(10));
    assert_eq!(cfg.server.timeout, Duration::from_secs(10));
    assert_eq!(cfg.detector.confidence, 0.25);
    assert_eq!(cfg.tracker.kind, TrackerKind::Motion);
    assert_eq!(cfg.tracker.motion.max_age, 40);
    assert_eq!(cfg.tracker.motion.min_hits, 3);
    assert_eq!(cfg.tracker.color.threshold, 20.0);
    assert_eq!(cfg.events.save_delay, Duration::from_secs(3));
    assert_eq!(cfg.events.reuse_gap, None);
    assert_eq!(cfg.storage.busy_timeout, Duration::from_millis(5000));
    assert_eq!(cfg.source.path, "stub://apiary");
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "server": {
            "url": "https://hive.example.org",
            "heartbeat_secs": 30,
            "notify_events": true
        },
        "device": { "id_path": "/var/lib/sentinel/id", "jitter_deg": 0.01 },
        "source": { "path": "stub://field?frames=5", "width": 1000, "height": 500 },
        "detector": { "confidence": 0.4 },
        "tracker": {
            "kind": "color",
            "color": { "preset": "live_camera", "max_tracks": 8 }
        },
        "events": { "save_delay_secs": 5, "reuse_gap_secs": 120 },
        "storage": {
            "db_path": "apiary.db",
            "seed_references": [" ref-a ", "", "ref-b"]
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SENTINEL_CONFIG", file.path());
    std::env::set_var("SENTINEL_DB_PATH", "override.db");
    std::env::set_var("SENTINEL_TRACKER", "motion");
    std::env::set_var("SENTINEL_SAVE_DELAY_SECS", "1.5");

    let cfg = SentinelConfig::load().expect("load config");

    assert_eq!(cfg.server.url, "https://hive.example.org");
    assert_eq!(cfg.server.heartbeat_interval, Duration::from_secs(30));
    assert!(cfg.server.notify_events);
    assert_eq!(cfg.device.id_path.to_str(), Some("/var/lib/sentinel/id"));
    assert_eq!(cfg.device.jitter_deg, 0.01);
    assert_eq!(cfg.source.width, 1000);
    assert_eq!(cfg.detector.confidence, 0.4);
    assert_eq!(cfg.tracker.kind, TrackerKind::Motion);
    assert_eq!(cfg.tracker.color.threshold, 30.0);
    assert_eq!(cfg.tracker.color.mode, SignatureMode::Mean);
    assert_eq!(cfg.tracker.color.max_tracks, 8);
    assert_eq!(cfg.events.save_delay, Duration::from_millis(1500));
    assert_eq!(cfg.events.reuse_gap, Some(Duration::from_secs(120)));
    assert_eq!(cfg.storage.db_path, "override.db");
    assert_eq!(cfg.storage.seed_references, vec!["ref-a", "ref-b"]);

    clear_env();
}

#[test]
fn toml_files_are_detected_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
[server]
enabled = false

[tracker]
kind = "color"

[tracker.color]
threshold = 25.0
mode = "histogram_peak"
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = SentinelConfig::load_from(Some(file.path())).expect("load toml");
    assert!(!cfg.server.enabled);
    assert_eq!(cfg.tracker.kind, TrackerKind::Color);
    assert_eq!(cfg.tracker.color.threshold, 25.0);
    assert_eq!(cfg.build_tracker().name(), "color");
    assert_eq!(cfg.detector.confidence, 0.25);

    clear_env();
}

#[test]
fn live_camera_preset_lowers_default_confidence() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
[tracker.color]
preset = "live_camera"
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = SentinelConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.detector.confidence, 0.1);
    assert_eq!(cfg.tracker.color.threshold, 30.0);

    std::env::set_var("SENTINEL_CONFIDENCE", "0.3");
    let cfg = SentinelConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.detector.confidence, 0.3);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("SENTINEL_CONFIDENCE", "1.5");
    assert!(SentinelConfig::load().is_err());
    clear_env();

    std::env::set_var("SENTINEL_SERVER_URL", "ftp://hive.example.org");
    assert!(SentinelConfig::load().is_err());
    clear_env();

    std::env::set_var("SENTINEL_TRACKER", "kalman");
    assert!(SentinelConfig::load().is_err());
    clear_env();

    std::env::set_var("SENTINEL_SAVE_DELAY_SECS", "-3");
    assert!(SentinelConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{"server": {"heartbeat_secs": 0}}"#)
        .expect("write config");
    assert!(SentinelConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

#[test]
fn builds_pipeline_parts_from_config() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let db = dir.path().join("sentinel.db");
    let detections = dir.path().join("detections.jsonl");
    std::fs::write(
        &detections,
        "{\"frame\":1,\"detections\":[[400,100,600,200,0.9]]}\n",
    )
    .expect("write detections");

    std::env::set_var("SENTINEL_DB_PATH", &db);
    std::env::set_var("SENTINEL_DETECTIONS", &detections);
    std::env::set_var("SENTINEL_SOURCE", "stub://bench?frames=2");

    let cfg = SentinelConfig::load().expect("load config");
    let gateway = cfg.open_gateway().expect("open store");
    assert_eq!(gateway.event_count().unwrap(), 0);
    assert_eq!(cfg.build_detector().unwrap().name(), "replay");
    assert_eq!(cfg.build_tracker().name(), "motion");
    assert!(cfg.build_source().is_ok());

    clear_env();
}
