//! HTTP device protocol: registration, ping/pong heartbeat and detection-event
//! notification.
//!
//! All bodies are JSON. Message types travel as integers:
//! `PING = 0`, `PONG = 1`, `DETECTION_EVENT = 2`.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::{Duration, SystemTime};
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Ping,
    Pong,
    DetectionEvent,
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Ping => 0,
            MessageType::Pong => 1,
            MessageType::DetectionEvent => 2,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Ping),
            1 => Ok(MessageType::Pong),
            2 => Ok(MessageType::DetectionEvent),
            other => Err(format!("unknown message type {}", other)),
        }
    }
}

/// Why a single heartbeat attempt failed. None of these stop the loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatError {
    /// The client has no device id yet.
    NotRegistered,
    /// HTTP 403: the device is known but not approved.
    NotApproved,
    /// Any other non-200 status.
    Rejected(u16),
    /// A well-formed reply whose message type is not `PONG`.
    UnexpectedMessage(i64),
    Malformed(String),
    Transport(String),
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeartbeatError::NotRegistered => write!(f, "device is not registered"),
            HeartbeatError::NotApproved => write!(f, "this device has not been approved yet"),
            HeartbeatError::Rejected(status) => write!(f, "ping rejected with status {}", status),
            HeartbeatError::UnexpectedMessage(t) => {
                write!(f, "ping reply has message_type {}, expected PONG", t)
            }
            HeartbeatError::Malformed(msg) => write!(f, "malformed ping reply: {}", msg),
            HeartbeatError::Transport(msg) => write!(f, "ping transport error: {}", msg),
        }
    }
}

impl std::error::Error for HeartbeatError {}

/// Installation details sent once at registration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub latitude: f64,
    pub longitude: f64,
    /// Degrees the camera faces.
    pub direction: f64,
}

impl Registration {
    /// Spread emulated devices around the configured site: latitude moves by
    /// up to `jitter_deg`, longitude by up to twice that.
    pub fn jittered<R: Rng>(&self, jitter_deg: f64, rng: &mut R) -> Self {
        if jitter_deg <= 0.0 {
            return *self;
        }
        Self {
            latitude: self.latitude + rng.gen_range(-jitter_deg..=jitter_deg),
            longitude: self.longitude + rng.gen_range(-2.0 * jitter_deg..=2.0 * jitter_deg),
            direction: self.direction,
        }
    }
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            latitude: 51.163,
            longitude: 4.989118,
            direction: 25.0,
        }
    }
}

/// Blocking client for the device endpoints. Cheap to clone; clones share
/// the connection pool.
#[derive(Clone)]
pub struct DeviceClient {
    agent: ureq::Agent,
    base: String,
    device_id: Option<String>,
}

impl DeviceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(base_url).with_context(|| format!("parse server url {}", base_url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("server url must be http or https, got {}", base_url));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            base: base_url.trim_end_matches('/').to_string(),
            device_id: None,
        })
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/Device/{}", self.base, path)
    }

    /// Register this device and return the id the server assigned.
    pub fn register(&self, registration: &Registration) -> Result<String> {
        let response = self
            .agent
            .post(&self.endpoint("Register"))
            .send_json(registration)
            .map_err(|e| anyhow!("failed to register device: {}", e))?;
        if response.status() != 200 {
            return Err(anyhow!(
                "failed to register device: status {}",
                response.status()
            ));
        }
        let body: Value = response
            .into_json()
            .context("registration response is not json")?;
        let id = match body.get("id") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(anyhow!("expected id in registration response, not found")),
        };
        log::info!("registered device with id {}", id);
        Ok(id)
    }

    /// One heartbeat attempt: POST a ping and require a `PONG` back.
    pub fn send_ping(&self) -> Result<(), HeartbeatError> {
        let device = self.device_id.as_deref().ok_or(HeartbeatError::NotRegistered)?;
        let body = json!({
            "device": device,
            "message_type": MessageType::Ping,
        });
        let response = match self.agent.post(&self.endpoint("Ping")).send_json(body) {
            Ok(r) => r,
            Err(ureq::Error::Status(403, _)) => return Err(HeartbeatError::NotApproved),
            Err(ureq::Error::Status(status, _)) => return Err(HeartbeatError::Rejected(status)),
            Err(ureq::Error::Transport(t)) => {
                return Err(HeartbeatError::Transport(t.to_string()))
            }
        };
        if response.status() != 200 {
            return Err(HeartbeatError::Rejected(response.status()));
        }
        let text = response
            .into_string()
            .map_err(|e| HeartbeatError::Transport(e.to_string()))?;
        parse_pong(&text)
    }

    /// Mirror a detection to the server. `timestamp` is sent as Unix seconds.
    pub fn send_detection_event(&self, direction: f64, timestamp: SystemTime) -> Result<()> {
        let device = self
            .device_id
            .as_deref()
            .ok_or_else(|| anyhow!("device is not registered"))?;
        let seconds = crate::unix_millis(timestamp)? / 1000;
        let body = json!({
            "device": device,
            "message_type": MessageType::DetectionEvent,
            "data": {
                "hornet_direction": direction,
                "timestamp": seconds,
            },
        });
        let response = self
            .agent
            .post(&self.endpoint("DetectionEvent"))
            .send_json(body)
            .map_err(|e| anyhow!("failed to send detection event: {}", e))?;
        if response.status() != 200 {
            return Err(anyhow!(
                "failed to send detection event: status {}",
                response.status()
            ));
        }
        log::info!("sent detection event ({:.1} deg)", direction);
        Ok(())
    }
}

/// Accept a ping reply only if it is JSON carrying `message_type == PONG`.
pub fn parse_pong(body: &str) -> Result<(), HeartbeatError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| HeartbeatError::Malformed(e.to_string()))?;
    let raw = value
        .get("message_type")
        .and_then(Value::as_i64)
        .ok_or_else(|| HeartbeatError::Malformed("missing integer message_type".to_string()))?;
    if raw == i64::from(u8::from(MessageType::Pong)) {
        Ok(())
    } else {
        Err(HeartbeatError::UnexpectedMessage(raw))
    }
}
