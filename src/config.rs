use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::detect::{DetectorBackend, ReplayBackend};
use crate::ingest::{file::FileConfig, FileSource};
use crate::lifecycle::EventPolicy;
use crate::pipeline::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::storage::SqliteGateway;
use crate::track::color::{ColorSignatureTracker, ColorTrackerParams, SignatureMode};
use crate::track::motion::{IouTracker, IouTrackerParams};
use crate::track::{IdentityTracker, TrackerKind};
use crate::transport::Registration;

const DEFAULT_SERVER_URL: &str = "http://localhost:5089";
const DEFAULT_HEARTBEAT_SECS: u64 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DEVICE_ID_PATH: &str = "./data/id";
const DEFAULT_SOURCE: &str = "stub://apiary";
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_MODEL_INPUT: u32 = 640;
const LIVE_CAMERA_CONFIDENCE: f32 = 0.1;
const DEFAULT_SAVE_DELAY_SECS: f64 = 3.0;
const DEFAULT_DB_PATH: &str = "sentinel.db";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    server: Option<ServerConfigFile>,
    device: Option<DeviceConfigFile>,
    source: Option<SourceConfigFile>,
    detector: Option<DetectorConfigFile>,
    tracker: Option<TrackerConfigFile>,
    events: Option<EventsConfigFile>,
    storage: Option<StorageConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    enabled: Option<bool>,
    url: Option<String>,
    heartbeat_secs: Option<u64>,
    timeout_secs: Option<u64>,
    notify_events: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DeviceConfigFile {
    id_path: Option<PathBuf>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    direction: Option<f64>,
    jitter_deg: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    path: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    frame_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    detections: Option<PathBuf>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    kind: Option<TrackerKind>,
    color: Option<ColorConfigFile>,
    motion: Option<MotionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ColorConfigFile {
    preset: Option<String>,
    threshold: Option<f32>,
    mode: Option<SignatureMode>,
    max_tracks: Option<usize>,
    max_idle_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    max_age: Option<u32>,
    min_hits: Option<u32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsConfigFile {
    save_delay_secs: Option<f64>,
    reuse_gap_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    db_path: Option<String>,
    busy_timeout_ms: Option<u64>,
    seed_references: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub server: ServerSettings,
    pub device: DeviceSettings,
    pub source: SourceSettings,
    pub detector: DetectorSettings,
    pub tracker: TrackerSettings,
    pub events: EventPolicy,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// When false the daemon neither registers nor pings.
    pub enabled: bool,
    pub url: String,
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
    /// Mirror each saved event to `/Device/DetectionEvent`.
    pub notify_events: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub id_path: PathBuf,
    pub registration: Registration,
    pub jitter_deg: f64,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub frame_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Recorded detections (JSON lines) for the replay backend.
    pub detections: Option<PathBuf>,
    /// ONNX model; selects the tract backend when set.
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub kind: TrackerKind,
    pub color: ColorTrackerParams,
    pub motion: IouTrackerParams,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub db_path: String,
    pub busy_timeout: Duration,
    pub seed_references: Vec<String>,
}

impl SentinelConfig {
    /// Defaults, then the file named by `SENTINEL_CONFIG`, then `SENTINEL_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = env_nonempty("SENTINEL_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Same as `load`, with an explicit config file in place of `SENTINEL_CONFIG`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Result<Self> {
        let server = file.server.unwrap_or_default();
        let device = file.device.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let tracker = file.tracker.unwrap_or_default();
        let events = file.events.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();

        let defaults = Registration::default();
        let registration = Registration {
            latitude: device.latitude.unwrap_or(defaults.latitude),
            longitude: device.longitude.unwrap_or(defaults.longitude),
            direction: device.direction.unwrap_or(defaults.direction),
        };

        let color_file = tracker.color.unwrap_or_default();
        // The live camera preset also lowers the default detector threshold.
        let mut default_confidence = DEFAULT_CONFIDENCE_THRESHOLD;
        let mut color = match color_file.preset.as_deref() {
            None | Some("default") => ColorTrackerParams::default(),
            Some("live_camera") => {
                default_confidence = LIVE_CAMERA_CONFIDENCE;
                ColorTrackerParams::live_camera()
            }
            Some(other) => return Err(anyhow!("unknown color tracker preset '{}'", other)),
        };
        if let Some(threshold) = color_file.threshold {
            color.threshold = threshold;
        }
        if let Some(mode) = color_file.mode {
            color.mode = mode;
        }
        if let Some(max_tracks) = color_file.max_tracks {
            color.max_tracks = max_tracks;
        }
        if let Some(max_idle) = color_file.max_idle_frames {
            color.max_idle_frames = max_idle;
        }

        let motion_file = tracker.motion.unwrap_or_default();
        let motion_defaults = IouTrackerParams::default();
        let motion = IouTrackerParams {
            max_age: motion_file.max_age.unwrap_or(motion_defaults.max_age),
            min_hits: motion_file.min_hits.unwrap_or(motion_defaults.min_hits),
            iou_threshold: motion_file
                .iou_threshold
                .unwrap_or(motion_defaults.iou_threshold),
        };

        Ok(Self {
            server: ServerSettings {
                enabled: server.enabled.unwrap_or(true),
                url: server
                    .url
                    .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
                heartbeat_interval: Duration::from_secs(
                    server.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS),
                ),
                timeout: Duration::from_secs(server.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
                notify_events: server.notify_events.unwrap_or(false),
            },
            device: DeviceSettings {
                id_path: device
                    .id_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE_ID_PATH)),
                registration,
                jitter_deg: device.jitter_deg.unwrap_or(0.0),
            },
            source: SourceSettings {
                path: source.path.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
                frame_interval: source
                    .frame_interval_ms
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis),
            },
            detector: DetectorSettings {
                detections: detector.detections,
                model_path: detector.model_path,
                input_width: detector.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
                input_height: detector.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
                confidence: detector.confidence.unwrap_or(default_confidence),
            },
            tracker: TrackerSettings {
                kind: tracker.kind.unwrap_or(TrackerKind::Motion),
                color,
                motion,
            },
            events: EventPolicy {
                save_delay: secs_f64(
                    "events.save_delay_secs",
                    events.save_delay_secs.unwrap_or(DEFAULT_SAVE_DELAY_SECS),
                )?,
                reuse_gap: events
                    .reuse_gap_secs
                    .map(|s| secs_f64("events.reuse_gap_secs", s))
                    .transpose()?,
            },
            storage: StorageSettings {
                db_path: storage
                    .db_path
                    .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
                busy_timeout: Duration::from_millis(
                    storage.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS),
                ),
                seed_references: storage.seed_references.unwrap_or_default(),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_nonempty("SENTINEL_SERVER_URL") {
            self.server.url = url;
        }
        if let Some(path) = env_nonempty("SENTINEL_DB_PATH") {
            self.storage.db_path = path;
        }
        if let Some(path) = env_nonempty("SENTINEL_SOURCE") {
            self.source.path = path;
        }
        if let Some(path) = env_nonempty("SENTINEL_DETECTIONS") {
            self.detector.detections = Some(PathBuf::from(path));
        }
        if let Some(path) = env_nonempty("SENTINEL_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_nonempty("SENTINEL_DEVICE_ID_PATH") {
            self.device.id_path = PathBuf::from(path);
        }
        if let Some(conf) = env_nonempty("SENTINEL_CONFIDENCE") {
            self.detector.confidence = conf
                .parse()
                .map_err(|_| anyhow!("SENTINEL_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Some(kind) = env_nonempty("SENTINEL_TRACKER") {
            self.tracker.kind = kind.parse()?;
        }
        if let Some(delay) = env_nonempty("SENTINEL_SAVE_DELAY_SECS") {
            let secs: f64 = delay
                .parse()
                .map_err(|_| anyhow!("SENTINEL_SAVE_DELAY_SECS must be a number of seconds"))?;
            self.events.save_delay = secs_f64("SENTINEL_SAVE_DELAY_SECS", secs)?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.server.enabled {
            let url = Url::parse(&self.server.url)
                .with_context(|| format!("server.url is not a valid url: {}", self.server.url))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow!("server.url must use http or https"));
            }
        }
        if self.server.heartbeat_interval.is_zero() {
            return Err(anyhow!("server.heartbeat_secs must be greater than zero"));
        }
        if self.server.timeout.is_zero() {
            return Err(anyhow!("server.timeout_secs must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence) {
            return Err(anyhow!("detector.confidence must be within [0, 1]"));
        }
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(anyhow!("detector input size must be non-zero"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source width and height must be non-zero"));
        }
        if !(self.tracker.color.threshold > 0.0) {
            return Err(anyhow!("tracker.color.threshold must be positive"));
        }
        if !(0.0..=1.0).contains(&self.tracker.motion.iou_threshold) {
            return Err(anyhow!("tracker.motion.iou_threshold must be within [0, 1]"));
        }
        if !(self.device.jitter_deg >= 0.0) {
            return Err(anyhow!("device.jitter_deg must not be negative"));
        }
        self.storage.seed_references = self
            .storage
            .seed_references
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        Ok(())
    }

    pub fn build_tracker(&self) -> Box<dyn IdentityTracker> {
        match self.tracker.kind {
            TrackerKind::Motion => Box::new(IouTracker::new(self.tracker.motion)),
            TrackerKind::Color => Box::new(ColorSignatureTracker::new(self.tracker.color)),
        }
    }

    pub fn build_source(&self) -> Result<FileSource> {
        FileSource::new(FileConfig {
            path: self.source.path.clone(),
            width: self.source.width,
            height: self.source.height,
        })
    }

    /// Tract when a model is configured, otherwise replay of recorded
    /// detections (an empty replay when none are configured either).
    pub fn build_detector(&self) -> Result<Box<dyn DetectorBackend>> {
        if let Some(model) = &self.detector.model_path {
            return build_tract(
                model,
                self.detector.input_width,
                self.detector.input_height,
            );
        }
        match &self.detector.detections {
            Some(path) => Ok(Box::new(ReplayBackend::from_jsonl(path)?)),
            None => {
                log::warn!("no detector configured; frames will carry no detections");
                Ok(Box::new(ReplayBackend::new()))
            }
        }
    }

    /// Open the local store and insert any configured references.
    pub fn open_gateway(&self) -> Result<SqliteGateway> {
        let mut gateway = SqliteGateway::open(&self.storage.db_path, self.storage.busy_timeout)?;
        for reference in &self.storage.seed_references {
            gateway.seed_reference(reference, None)?;
        }
        Ok(gateway)
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract(model: &Path, width: u32, height: u32) -> Result<Box<dyn DetectorBackend>> {
    Ok(Box::new(crate::detect::TractBackend::new(
        model, width, height,
    )?))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(model: &Path, _width: u32, _height: u32) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow!(
        "model {} configured but the backend-tract feature is disabled",
        model.display()
    ))
}

fn secs_f64(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds", name))
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
