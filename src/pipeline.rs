//! Per-frame processing.
//!
//! `Engine` owns every piece of mutable pipeline state (tracker, lifecycle,
//! gateway), so one engine is one independent pipeline. Frames are handled
//! strictly one at a time:
//!
//! detections -> confidence filter -> tracker -> (direction, lifecycle) per
//! tracked object -> gateway.

use anyhow::Result;
use std::time::{Duration, SystemTime};

use crate::cancel::CancelToken;
use crate::detect::{filter_by_confidence, Detection, DetectorBackend};
use crate::direction::estimate_direction;
use crate::frame::{Frame, FrameSource};
use crate::lifecycle::{Decision, DetectionEvent, EventLifecycleManager, EventPolicy};
use crate::storage::{EventRecord, PersistError, PersistenceGateway};
use crate::track::{IdentityTracker, TrackId, TrackedObject};
use crate::transport::DeviceClient;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;

#[derive(Clone, Debug, PartialEq)]
pub enum EventOutcome {
    Persisted(DetectionEvent),
    Suppressed { track_id: TrackId, retry_in: Duration },
    Dropped { track_id: TrackId, error: PersistError },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
    pub frame_index: u64,
    /// Detections left after the confidence filter.
    pub detections: usize,
    pub tracked: Vec<TrackedObject>,
    pub outcomes: Vec<EventOutcome>,
}

impl FrameReport {
    pub fn persisted(&self) -> impl Iterator<Item = &DetectionEvent> {
        self.outcomes.iter().filter_map(|o| match o {
            EventOutcome::Persisted(ev) => Some(ev),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames: u64,
    pub detections: u64,
    pub tracked: u64,
    pub persisted: u64,
    pub suppressed: u64,
    pub dropped: u64,
    pub detector_errors: u64,
    /// False when the source ran dry, true when the loop was cancelled.
    pub cancelled: bool,
}

impl LoopStats {
    fn absorb(&mut self, report: &FrameReport) {
        self.frames += 1;
        self.detections += report.detections as u64;
        self.tracked += report.tracked.len() as u64;
        for outcome in &report.outcomes {
            match outcome {
                EventOutcome::Persisted(_) => self.persisted += 1,
                EventOutcome::Suppressed { .. } => self.suppressed += 1,
                EventOutcome::Dropped { .. } => self.dropped += 1,
            }
        }
    }
}

pub struct Engine {
    tracker: Box<dyn IdentityTracker>,
    lifecycle: EventLifecycleManager,
    gateway: Box<dyn PersistenceGateway>,
    confidence_threshold: f32,
    device_id: String,
    notifier: Option<DeviceClient>,
}

impl Engine {
    pub fn new(
        tracker: Box<dyn IdentityTracker>,
        policy: EventPolicy,
        gateway: Box<dyn PersistenceGateway>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            tracker,
            lifecycle: EventLifecycleManager::new(policy),
            gateway,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            device_id: device_id.into(),
            notifier: None,
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Also report each persisted event to the device server.
    pub fn with_notifier(mut self, client: DeviceClient) -> Self {
        self.notifier = Some(client);
        self
    }

    pub fn tracker_name(&self) -> &'static str {
        self.tracker.name()
    }

    pub fn lifecycle(&self) -> &EventLifecycleManager {
        &self.lifecycle
    }

    pub fn process_frame(
        &mut self,
        frame: &Frame,
        detections: Vec<Detection>,
        now: SystemTime,
    ) -> FrameReport {
        let detections = filter_by_confidence(detections, self.confidence_threshold);
        let tracked = self.tracker.update(frame, &detections);
        let active = tracked.len();

        let mut outcomes = Vec::with_capacity(active);
        for obj in &tracked {
            let direction = match estimate_direction(&obj.bbox, frame.width) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("track {}: no direction: {}", obj.track_id, e);
                    continue;
                }
            };
            match self.lifecycle.observe(obj.track_id, now, direction, active) {
                Decision::Forward(event) => outcomes.push(self.persist(event, now)),
                Decision::Suppressed {
                    track_id, retry_in, ..
                } => outcomes.push(EventOutcome::Suppressed { track_id, retry_in }),
            }
        }

        for id in self.tracker.take_evicted() {
            self.lifecycle.forget(id);
        }

        FrameReport {
            frame_index: frame.index,
            detections: detections.len(),
            tracked,
            outcomes,
        }
    }

    fn persist(&mut self, event: DetectionEvent, now: SystemTime) -> EventOutcome {
        let track_id = event.track_id;
        let reference_id = match self.gateway.resolve_reference_id() {
            Ok(id) => id,
            Err(error) => {
                log::warn!("dropping event for track {}: {}", track_id, error);
                return EventOutcome::Dropped { track_id, error };
            }
        };

        // From here on the attempt counts, even if the write fails.
        self.lifecycle.record_attempt(track_id, now);
        let record = EventRecord::new(event, &self.device_id, reference_id);
        if let Err(error) = self.gateway.save_event(&record) {
            log::error!("dropping event for track {}: {}", track_id, error);
            return EventOutcome::Dropped { track_id, error };
        }
        log::info!(
            "saved event {} for track {} ({:?}, {:.1} deg, {} active)",
            record.event_id,
            track_id,
            record.event.state,
            record.event.direction,
            record.event.active_tracks
        );

        if let Some(client) = &self.notifier {
            if let Err(e) = client.send_detection_event(record.event.direction, record.event.timestamp)
            {
                log::warn!("detection event notification failed: {:#}", e);
            }
        }
        EventOutcome::Persisted(record.event)
    }
}

/// Pull frames until the source is exhausted or `cancel` fires.
///
/// Detector errors are logged and the frame is processed as empty, so the
/// tracker still ages its tracks. Source errors end the loop with an error.
pub fn run_frame_loop(
    source: &mut dyn FrameSource,
    detector: &mut dyn DetectorBackend,
    engine: &mut Engine,
    cancel: &CancelToken,
    pacing: Option<Duration>,
) -> Result<LoopStats> {
    detector.warm_up()?;
    log::info!(
        "frame loop: source={} detector={} tracker={}",
        source.describe(),
        detector.name(),
        engine.tracker_name()
    );

    let mut stats = LoopStats::default();
    loop {
        if cancel.is_cancelled() {
            stats.cancelled = true;
            break;
        }
        let Some(frame) = source.next_frame()? else {
            log::info!("source exhausted after {} frames", source.frames_produced());
            break;
        };
        let detections = match detector.detect(&frame) {
            Ok(d) => d,
            Err(e) => {
                stats.detector_errors += 1;
                log::warn!("detector failed on frame {}: {:#}", frame.index, e);
                Vec::new()
            }
        };
        let report = engine.process_frame(&frame, detections, frame.captured_at);
        stats.absorb(&report);

        if let Some(delay) = pacing {
            if cancel.wait_timeout(delay) {
                stats.cancelled = true;
                break;
            }
        }
    }
    Ok(stats)
}
