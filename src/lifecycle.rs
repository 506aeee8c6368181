//! Detection event lifecycle and per-track rate limiting.
//!
//! Per track id: `UNSEEN -> FIRST_RECORDED -> REPEATED`, with REPEATED
//! looping on every further sighting. The first sighting fixes
//! `first_detection` for the life of the id; each later sighting overwrites
//! `second_detection`, so only the latest pair is kept.
//!
//! Forwarding is gated by `RateLimiter`: at most one persistence attempt per
//! track id per `save_delay`. A suppressed event is dropped (logged, never
//! queued). This trades completeness for backpressure on the store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::track::TrackId;

pub const DEFAULT_SAVE_DELAY: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SightingState {
    FirstRecorded,
    Repeated,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EventPolicy {
    pub save_delay: Duration,
    /// When set, a track id seen again after a gap longer than this is
    /// treated as a new identity.
    pub reuse_gap: Option<Duration>,
}

impl Default for EventPolicy {
    fn default() -> Self {
        Self {
            save_delay: DEFAULT_SAVE_DELAY,
            reuse_gap: None,
        }
    }
}

/// A reportable sighting, built only when the rate limiter allows it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub track_id: TrackId,
    pub state: SightingState,
    pub timestamp: SystemTime,
    pub first_detection: SystemTime,
    pub second_detection: Option<SystemTime>,
    /// Degrees in [0, 180].
    pub direction: f64,
    /// Tracks reported by the tracker in the same frame.
    pub active_tracks: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Forward(DetectionEvent),
    Suppressed {
        track_id: TrackId,
        state: SightingState,
        retry_in: Duration,
    },
}

#[derive(Clone, Copy, Debug)]
struct Sighting {
    state: SightingState,
    first_detection: SystemTime,
    second_detection: Option<SystemTime>,
    last_seen: SystemTime,
}

/// Last forwarded persistence attempt per track id.
#[derive(Clone, Debug, Default)]
pub struct RateLimiter {
    delay: Duration,
    last_attempt: HashMap<TrackId, SystemTime>,
}

impl RateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_attempt: HashMap::new(),
        }
    }

    /// `Err(remaining)` when the window for `track_id` is still open.
    ///
    /// A clock that stepped backwards counts as zero elapsed time.
    pub fn check(&self, track_id: TrackId, now: SystemTime) -> Result<(), Duration> {
        let Some(last) = self.last_attempt.get(&track_id) else {
            return Ok(());
        };
        let elapsed = now.duration_since(*last).unwrap_or(Duration::ZERO);
        if elapsed >= self.delay {
            Ok(())
        } else {
            Err(self.delay - elapsed)
        }
    }

    pub fn record(&mut self, track_id: TrackId, at: SystemTime) {
        self.last_attempt.insert(track_id, at);
    }

    pub fn forget(&mut self, track_id: TrackId) {
        self.last_attempt.remove(&track_id);
    }

    pub fn tracked_ids(&self) -> usize {
        self.last_attempt.len()
    }
}

pub struct EventLifecycleManager {
    policy: EventPolicy,
    sightings: HashMap<TrackId, Sighting>,
    limiter: RateLimiter,
}

impl EventLifecycleManager {
    pub fn new(policy: EventPolicy) -> Self {
        Self {
            policy,
            sightings: HashMap::new(),
            limiter: RateLimiter::new(policy.save_delay),
        }
    }

    /// Record a sighting and decide whether it should be forwarded.
    ///
    /// The sighting itself is recorded either way; only forwarding is rate
    /// limited. Call `record_attempt` once the event actually reaches the
    /// gateway's write step.
    pub fn observe(
        &mut self,
        track_id: TrackId,
        now: SystemTime,
        direction: f64,
        active_tracks: usize,
    ) -> Decision {
        if let Some(gap) = self.policy.reuse_gap {
            let stale = self
                .sightings
                .get(&track_id)
                .and_then(|s| now.duration_since(s.last_seen).ok())
                .is_some_and(|elapsed| elapsed > gap);
            if stale {
                log::warn!(
                    "track {} reappeared after more than {:?}; treating as a new identity",
                    track_id,
                    gap
                );
                self.forget(track_id);
            }
        }

        let sighting = match self.sightings.get_mut(&track_id) {
            Some(s) => {
                s.state = SightingState::Repeated;
                s.second_detection = Some(now);
                s.last_seen = now;
                log::info!("repeat detection for track {}", track_id);
                *s
            }
            None => {
                let s = Sighting {
                    state: SightingState::FirstRecorded,
                    first_detection: now,
                    second_detection: None,
                    last_seen: now,
                };
                self.sightings.insert(track_id, s);
                log::info!("first detection for track {}", track_id);
                s
            }
        };

        if let Err(retry_in) = self.limiter.check(track_id, now) {
            log::debug!(
                "skipping save for track {}, delay not met ({:?} left)",
                track_id,
                retry_in
            );
            return Decision::Suppressed {
                track_id,
                state: sighting.state,
                retry_in,
            };
        }

        Decision::Forward(DetectionEvent {
            track_id,
            state: sighting.state,
            timestamp: now,
            first_detection: sighting.first_detection,
            second_detection: sighting.second_detection,
            direction: direction.clamp(0.0, 180.0),
            active_tracks,
        })
    }

    /// Mark a forwarded event as attempted; opens the rate-limit window.
    pub fn record_attempt(&mut self, track_id: TrackId, at: SystemTime) {
        self.limiter.record(track_id, at);
    }

    /// Drop everything known about `track_id`. Called once the tracker has
    /// let the id go; a later sighting under the same id starts over.
    pub fn forget(&mut self, track_id: TrackId) {
        self.sightings.remove(&track_id);
        self.limiter.forget(track_id);
    }

    pub fn state(&self, track_id: TrackId) -> Option<SightingState> {
        self.sightings.get(&track_id).map(|s| s.state)
    }

    pub fn first_detection(&self, track_id: TrackId) -> Option<SystemTime> {
        self.sightings.get(&track_id).map(|s| s.first_detection)
    }

    pub fn second_detection(&self, track_id: TrackId) -> Option<SystemTime> {
        self.sightings.get(&track_id).and_then(|s| s.second_detection)
    }

    pub fn known_ids(&self) -> usize {
        self.sightings.len()
    }

    /// Ids with an open or expired rate-limit window.
    pub fn rate_limited_ids(&self) -> usize {
        self.limiter.tracked_ids()
    }
}
