//! Color-signature identity tracker.
//!
//! Each detection is reduced to a (hue, saturation) signature computed from
//! the pixels inside its box in 8-bit HSV (hue in [0, 180), saturation in
//! [0, 256)). A detection joins the nearest known track whose signature lies
//! strictly within `threshold` (Euclidean distance); otherwise it opens a new
//! track with the next sequential id.
//!
//! Tracks are evicted once they go unmatched for `max_idle_frames` frames,
//! and the least recently matched track makes room when `max_tracks` is
//! reached. Ids are never reused.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{IdentityTracker, TrackId, TrackedObject};
use crate::detect::{BBox, Detection};
use crate::frame::Frame;

pub const HUE_BINS: usize = 180;
pub const SATURATION_BINS: usize = 256;

pub const DEFAULT_THRESHOLD: f32 = 20.0;
/// Looser matching used for live cameras, where lighting drifts.
pub const LIVE_CAMERA_THRESHOLD: f32 = 30.0;
const DEFAULT_MAX_TRACKS: usize = 256;
const DEFAULT_MAX_IDLE_FRAMES: u64 = 300;

/// Compact color descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColorSignature {
    pub hue: f32,
    pub saturation: f32,
}

impl ColorSignature {
    /// Used for zero-area or out-of-frame boxes so assignment stays deterministic.
    pub const DEFAULT: ColorSignature = ColorSignature {
        hue: 60.0,
        saturation: 255.0,
    };

    pub fn new(hue: f32, saturation: f32) -> Self {
        Self { hue, saturation }
    }

    pub fn distance(&self, other: &ColorSignature) -> f32 {
        let dh = self.hue - other.hue;
        let ds = self.saturation - other.saturation;
        (dh * dh + ds * ds).sqrt()
    }
}

/// How a box's pixels are summarized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    /// Most frequent (hue, saturation) bin of a 180x256 histogram.
    #[default]
    HistogramPeak,
    /// Per-channel mean hue and saturation.
    Mean,
}

impl std::str::FromStr for SignatureMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "histogram_peak" | "histogram" | "mode" => Ok(Self::HistogramPeak),
            "mean" => Ok(Self::Mean),
            other => Err(anyhow::anyhow!(
                "unknown signature mode '{}'; expected histogram_peak or mean",
                other
            )),
        }
    }
}

/// 8-bit RGB to (hue, saturation) in the 8-bit HSV convention.
pub fn rgb_to_hue_saturation(rgb: [u8; 3]) -> (u8, u8) {
    let [r, g, b] = rgb.map(|c| c as f32);
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = v - min;

    let s = if v == 0.0 { 0.0 } else { diff * 255.0 / v };

    let mut h = if diff == 0.0 {
        0.0
    } else if v == r {
        60.0 * (g - b) / diff
    } else if v == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }
    let hue = (h / 2.0).round() as u32 % HUE_BINS as u32;
    (hue as u8, s.round().min(255.0) as u8)
}

/// Signature of the pixels inside `bbox`, or `None` when the clipped box is empty.
///
/// Coordinates are truncated to whole pixels and clipped to the frame.
pub fn compute_signature(frame: &Frame, bbox: &BBox, mode: SignatureMode) -> Option<ColorSignature> {
    let clip = |v: f32, max: u32| -> u32 {
        if !v.is_finite() {
            return 0;
        }
        (v.trunc().max(0.0) as u32).min(max)
    };
    let (x1, x2) = (clip(bbox.x1, frame.width), clip(bbox.x2, frame.width));
    let (y1, y2) = (clip(bbox.y1, frame.height), clip(bbox.y2, frame.height));
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let pixels = (y1..y2).flat_map(|y| (x1..x2).map(move |x| (x, y)));
    match mode {
        SignatureMode::HistogramPeak => {
            let mut histogram = vec![0u32; HUE_BINS * SATURATION_BINS];
            for (x, y) in pixels {
                let (h, s) = rgb_to_hue_saturation(frame.rgb(x, y));
                histogram[h as usize * SATURATION_BINS + s as usize] += 1;
            }
            let mut peak = 0usize;
            for (bin, &count) in histogram.iter().enumerate() {
                if count > histogram[peak] {
                    peak = bin;
                }
            }
            Some(ColorSignature::new(
                (peak / SATURATION_BINS) as f32,
                (peak % SATURATION_BINS) as f32,
            ))
        }
        SignatureMode::Mean => {
            let (mut sum_h, mut sum_s, mut n) = (0u64, 0u64, 0u64);
            for (x, y) in pixels {
                let (h, s) = rgb_to_hue_saturation(frame.rgb(x, y));
                sum_h += h as u64;
                sum_s += s as u64;
                n += 1;
            }
            Some(ColorSignature::new(
                (sum_h / n) as f32,
                (sum_s / n) as f32,
            ))
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ColorTrackerParams {
    pub threshold: f32,
    pub mode: SignatureMode,
    pub max_tracks: usize,
    pub max_idle_frames: u64,
}

impl Default for ColorTrackerParams {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            mode: SignatureMode::HistogramPeak,
            max_tracks: DEFAULT_MAX_TRACKS,
            max_idle_frames: DEFAULT_MAX_IDLE_FRAMES,
        }
    }
}

impl ColorTrackerParams {
    pub fn live_camera() -> Self {
        Self {
            threshold: LIVE_CAMERA_THRESHOLD,
            mode: SignatureMode::Mean,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
struct ColorTrack {
    signature: ColorSignature,
    bbox: BBox,
    last_seen_frame: u64,
}

pub struct ColorSignatureTracker {
    params: ColorTrackerParams,
    tracks: BTreeMap<TrackId, ColorTrack>,
    next_id: TrackId,
    frame_count: u64,
    evicted: Vec<TrackId>,
}

impl ColorSignatureTracker {
    pub fn new(params: ColorTrackerParams) -> Self {
        Self {
            params,
            tracks: BTreeMap::new(),
            next_id: 0,
            frame_count: 0,
            evicted: Vec::new(),
        }
    }

    pub fn signature_of(&self, track_id: TrackId) -> Option<ColorSignature> {
        self.tracks.get(&track_id).map(|t| t.signature)
    }

    pub fn last_bbox(&self, track_id: TrackId) -> Option<BBox> {
        self.tracks.get(&track_id).map(|t| t.bbox)
    }

    /// Nearest track strictly within threshold; ties go to the lowest id.
    fn nearest(&self, signature: &ColorSignature) -> Option<TrackId> {
        let mut best: Option<(TrackId, f32)> = None;
        for (&id, track) in &self.tracks {
            let d = track.signature.distance(signature);
            if d >= self.params.threshold {
                continue;
            }
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((id, d));
            }
        }
        best.map(|(id, _)| id)
    }

    fn evict_idle(&mut self) {
        let now = self.frame_count;
        let max_idle = self.params.max_idle_frames;
        let idle: Vec<TrackId> = self
            .tracks
            .iter()
            .filter(|(_, t)| now.saturating_sub(t.last_seen_frame) > max_idle)
            .map(|(&id, _)| id)
            .collect();
        if idle.is_empty() {
            return;
        }
        for id in &idle {
            self.tracks.remove(id);
        }
        log::debug!("color tracker: evicted {} idle tracks", idle.len());
        self.evicted.extend(idle);
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .tracks
            .iter()
            .min_by_key(|(&id, t)| (t.last_seen_frame, id))
            .map(|(&id, _)| id);
        if let Some(id) = oldest {
            self.tracks.remove(&id);
            self.evicted.push(id);
            log::debug!("color tracker: at capacity, evicted track {}", id);
        }
    }

    fn open_track(&mut self, signature: ColorSignature, bbox: BBox) -> TrackId {
        while self.params.max_tracks > 0 && self.tracks.len() >= self.params.max_tracks {
            self.evict_least_recent();
        }
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.insert(
            id,
            ColorTrack {
                signature,
                bbox,
                last_seen_frame: self.frame_count,
            },
        );
        id
    }
}

impl IdentityTracker for ColorSignatureTracker {
    fn name(&self) -> &'static str {
        "color"
    }

    fn update(&mut self, frame: &Frame, detections: &[Detection]) -> Vec<TrackedObject> {
        self.frame_count += 1;
        self.evict_idle();

        let mut out = Vec::with_capacity(detections.len());
        for det in detections {
            let signature = compute_signature(frame, &det.bbox, self.params.mode)
                .unwrap_or(ColorSignature::DEFAULT);
            let track_id = match self.nearest(&signature) {
                Some(id) => {
                    if let Some(track) = self.tracks.get_mut(&id) {
                        track.bbox = det.bbox;
                        track.last_seen_frame = self.frame_count;
                    }
                    id
                }
                None => self.open_track(signature, det.bbox),
            };
            out.push(TrackedObject {
                bbox: det.bbox,
                track_id,
            });
        }
        out
    }

    fn known_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn take_evicted(&mut self) -> Vec<TrackId> {
        std::mem::take(&mut self.evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: [u8; 3] = [255, 0, 0];
    const ORANGE: [u8; 3] = [255, 128, 0];
    const AMBER: [u8; 3] = [255, 170, 0];
    const YELLOW: [u8; 3] = [255, 255, 0];

    fn frame_with(rgb: [u8; 3]) -> Frame {
        Frame::solid(100, 100, rgb)
    }

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(BBox::new(x1, y1, x2, y2), 0.9)
    }

    #[test]
    fn hsv_conversion_matches_8bit_convention() {
        assert_eq!(rgb_to_hue_saturation(RED), (0, 255));
        assert_eq!(rgb_to_hue_saturation([0, 255, 0]), (60, 255));
        assert_eq!(rgb_to_hue_saturation([0, 0, 255]), (120, 255));
        assert_eq!(rgb_to_hue_saturation(ORANGE), (15, 255));
        assert_eq!(rgb_to_hue_saturation(AMBER), (20, 255));
        assert_eq!(rgb_to_hue_saturation([40, 120, 40]), (60, 170));
        assert_eq!(rgb_to_hue_saturation([0, 0, 0]), (0, 0));
        assert_eq!(rgb_to_hue_saturation([128, 128, 128]), (0, 0));
    }

    #[test]
    fn histogram_peak_picks_dominant_color() {
        let mut frame = frame_with(RED);
        frame.fill_rect(0, 0, 10, 3, YELLOW);
        let sig = compute_signature(&frame, &BBox::new(0.0, 0.0, 10.0, 10.0), SignatureMode::HistogramPeak)
            .unwrap();
        assert_eq!(sig, ColorSignature::new(0.0, 255.0));
    }

    #[test]
    fn mean_mode_averages_hue() {
        let mut frame = frame_with(RED);
        frame.fill_rect(0, 0, 10, 5, YELLOW);
        let sig = compute_signature(&frame, &BBox::new(0.0, 0.0, 10.0, 10.0), SignatureMode::Mean)
            .unwrap();
        assert_eq!(sig, ColorSignature::new(15.0, 255.0));
    }

    #[test]
    fn degenerate_boxes_have_no_signature() {
        let frame = frame_with(RED);
        let mode = SignatureMode::HistogramPeak;
        assert!(compute_signature(&frame, &BBox::new(10.0, 10.0, 10.0, 20.0), mode).is_none());
        assert!(compute_signature(&frame, &BBox::new(200.0, 0.0, 300.0, 10.0), mode).is_none());
        assert!(compute_signature(&frame, &BBox::new(30.0, 30.0, 20.0, 20.0), mode).is_none());
    }

    #[test]
    fn signatures_within_threshold_share_a_track() {
        let mut tracker = ColorSignatureTracker::new(ColorTrackerParams::default());
        let a = tracker.update(&frame_with(RED), &[det(10.0, 10.0, 30.0, 30.0)]);
        let b = tracker.update(&frame_with(ORANGE), &[det(50.0, 50.0, 70.0, 70.0)]);
        assert_eq!(a[0].track_id, 0);
        assert_eq!(b[0].track_id, 0);
        assert_eq!(b[0].bbox, BBox::new(50.0, 50.0, 70.0, 70.0));
        assert_eq!(tracker.last_bbox(0), Some(BBox::new(50.0, 50.0, 70.0, 70.0)));
        assert_eq!(tracker.known_tracks(), 1);
    }

    #[test]
    fn distance_at_threshold_opens_new_track() {
        let mut tracker = ColorSignatureTracker::new(ColorTrackerParams::default());
        let a = tracker.update(&frame_with(RED), &[det(10.0, 10.0, 30.0, 30.0)]);
        let b = tracker.update(&frame_with(AMBER), &[det(10.0, 10.0, 30.0, 30.0)]);
        let c = tracker.update(&frame_with(YELLOW), &[det(10.0, 10.0, 30.0, 30.0)]);
        assert_eq!(a[0].track_id, 0);
        assert_eq!(b[0].track_id, 1);
        // yellow (30, 255) is 10 away from amber, 30 from red
        assert_eq!(c[0].track_id, 1);
    }

    #[test]
    fn nearest_match_wins_over_first_match() {
        let mut tracker = ColorSignatureTracker::new(ColorTrackerParams {
            threshold: 25.0,
            ..ColorTrackerParams::default()
        });
        tracker.update(&frame_with(RED), &[det(0.0, 0.0, 10.0, 10.0)]);
        tracker.update(&frame_with(YELLOW), &[det(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(tracker.known_tracks(), 2);
        // amber (20, 255): 20 from red, 10 from yellow
        let out = tracker.update(&frame_with(AMBER), &[det(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(out[0].track_id, 1);
    }

    #[test]
    fn degenerate_boxes_fall_back_to_default_signature() {
        let mut tracker = ColorSignatureTracker::new(ColorTrackerParams::default());
        let frame = frame_with(RED);
        let a = tracker.update(&frame, &[det(5.0, 5.0, 5.0, 50.0)]);
        let b = tracker.update(&frame, &[det(500.0, 500.0, 600.0, 600.0)]);
        assert_eq!(a[0].track_id, b[0].track_id);
        assert_eq!(tracker.signature_of(a[0].track_id), Some(ColorSignature::DEFAULT));
    }

    #[test]
    fn empty_frame_produces_no_tracks() {
        let mut tracker = ColorSignatureTracker::new(ColorTrackerParams::default());
        assert!(tracker.update(&frame_with(RED), &[]).is_empty());
        assert_eq!(tracker.known_tracks(), 0);
    }

    #[test]
    fn idle_tracks_are_evicted_and_ids_not_reused() {
        let mut tracker = ColorSignatureTracker::new(ColorTrackerParams {
            max_idle_frames: 2,
            ..ColorTrackerParams::default()
        });
        let red = frame_with(RED);
        tracker.update(&red, &[det(0.0, 0.0, 10.0, 10.0)]);
        tracker.update(&red, &[]);
        tracker.update(&red, &[]);
        assert_eq!(tracker.known_tracks(), 1);
        tracker.update(&red, &[]);
        assert_eq!(tracker.known_tracks(), 0);

        assert_eq!(tracker.take_evicted(), vec![0]);
        assert!(tracker.take_evicted().is_empty());

        let out = tracker.update(&red, &[det(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(out[0].track_id, 1);
    }

    #[test]
    fn capacity_evicts_least_recently_matched() {
        let mut tracker = ColorSignatureTracker::new(ColorTrackerParams {
            max_tracks: 2,
            ..ColorTrackerParams::default()
        });
        tracker.update(&frame_with(RED), &[det(0.0, 0.0, 10.0, 10.0)]);
        tracker.update(&frame_with([0, 0, 255]), &[det(0.0, 0.0, 10.0, 10.0)]);
        tracker.update(&frame_with(RED), &[det(0.0, 0.0, 10.0, 10.0)]);
        let out = tracker.update(&frame_with([0, 255, 0]), &[det(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(out[0].track_id, 2);
        assert_eq!(tracker.known_tracks(), 2);
        assert!(tracker.signature_of(0).is_some());
        assert!(tracker.signature_of(1).is_none());
        assert_eq!(tracker.take_evicted(), vec![1]);
    }
}
