//! Device-to-server transport.
//!
//! The daemon talks to the monitoring server over plain HTTP+JSON: it
//! registers once (caching the assigned id on disk), pings on a fixed
//! interval and may mirror each forwarded detection event.

pub mod device;
pub mod heartbeat;
pub mod identity;

pub use device::{parse_pong, DeviceClient, HeartbeatError, MessageType, Registration};
pub use heartbeat::{run_heartbeat, HeartbeatStats};
pub use identity::DeviceIdentity;
