//! SORT-style IoU tracker.
//!
//! The pipeline consumes this as an id-producing oracle with the classic
//! SORT contract: `[x1, y1, x2, y2, score]` rows in, `[x1, y1, x2, y2, id]`
//! rows out for confirmed tracks. Internally each track carries a
//! constant-velocity prediction; detections are assigned greedily by
//! descending IoU against the predicted boxes.
//!
//! A track is reported only on frames where it was matched, and only once
//! its hit streak reaches `min_hits` (every match counts during the first
//! `min_hits` frames). Tracks unmatched for more than `max_age` frames are
//! evicted.
//!
//! Id reuse: this implementation never hands out an id twice, but SORT
//! variants that restart their counter (or external trackers swapped in
//! behind `IdentityTracker`) can give an evicted id to a new object. The
//! lifecycle manager's `reuse_gap` guard exists for that case.

use super::{IdentityTracker, TrackId, TrackedObject};
use crate::detect::{BBox, Detection};
use crate::frame::Frame;

#[derive(Clone, Copy, Debug)]
pub struct IouTrackerParams {
    pub max_age: u32,
    pub min_hits: u32,
    pub iou_threshold: f32,
}

impl Default for IouTrackerParams {
    fn default() -> Self {
        Self {
            max_age: 40,
            min_hits: 3,
            iou_threshold: 0.25,
        }
    }
}

#[derive(Clone, Debug)]
struct MotionTrack {
    id: TrackId,
    bbox: BBox,
    velocity: [f32; 4],
    hit_streak: u32,
    time_since_update: u32,
}

impl MotionTrack {
    fn predicted(&self) -> BBox {
        let steps = self.time_since_update as f32;
        let [vx1, vy1, vx2, vy2] = self.velocity;
        BBox::new(
            self.bbox.x1 + vx1 * steps,
            self.bbox.y1 + vy1 * steps,
            self.bbox.x2 + vx2 * steps,
            self.bbox.y2 + vy2 * steps,
        )
    }

    fn predict(&mut self) {
        if self.time_since_update > 0 {
            self.hit_streak = 0;
        }
        self.time_since_update += 1;
    }

    fn apply(&mut self, bbox: BBox) {
        let steps = self.time_since_update.max(1) as f32;
        self.velocity = [
            (bbox.x1 - self.bbox.x1) / steps,
            (bbox.y1 - self.bbox.y1) / steps,
            (bbox.x2 - self.bbox.x2) / steps,
            (bbox.y2 - self.bbox.y2) / steps,
        ];
        self.bbox = bbox;
        self.time_since_update = 0;
        self.hit_streak += 1;
    }
}

pub struct IouTracker {
    params: IouTrackerParams,
    tracks: Vec<MotionTrack>,
    next_id: TrackId,
    frame_count: u64,
    evicted: Vec<TrackId>,
}

impl IouTracker {
    pub fn new(params: IouTrackerParams) -> Self {
        Self {
            params,
            tracks: Vec::new(),
            next_id: 1,
            frame_count: 0,
            evicted: Vec::new(),
        }
    }

    /// Advance one frame. `rows` may be empty.
    ///
    /// Ids above 2^24 lose precision in the float column; `update` reads
    /// them from the tracks directly.
    pub fn update_rows(&mut self, rows: &[[f32; 5]]) -> Vec<[f32; 5]> {
        let boxes: Vec<BBox> = rows
            .iter()
            .map(|r| BBox::new(r[0], r[1], r[2], r[3]))
            .collect();
        self.step(&boxes)
            .into_iter()
            .map(|o| [o.bbox.x1, o.bbox.y1, o.bbox.x2, o.bbox.y2, o.track_id as f32])
            .collect()
    }

    fn step(&mut self, boxes: &[BBox]) -> Vec<TrackedObject> {
        self.frame_count += 1;

        for track in &mut self.tracks {
            track.predict();
        }
        self.release(|t| {
            let p = t.predicted();
            p.to_bounds().iter().all(|v| v.is_finite()) && p.x2 > p.x1 && p.y2 > p.y1
        });

        let predicted: Vec<BBox> = self.tracks.iter().map(|t| t.predicted()).collect();
        let mut pairs = Vec::new();
        for (d, det_box) in boxes.iter().enumerate() {
            for (t, trk_box) in predicted.iter().enumerate() {
                let iou = det_box.iou(trk_box);
                if iou >= self.params.iou_threshold {
                    pairs.push((iou, d, t));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut det_used = vec![false; boxes.len()];
        let mut trk_used = vec![false; self.tracks.len()];
        for (_, d, t) in pairs {
            if det_used[d] || trk_used[t] {
                continue;
            }
            det_used[d] = true;
            trk_used[t] = true;
            self.tracks[t].apply(boxes[d]);
        }

        for (d, det_box) in boxes.iter().enumerate() {
            if det_used[d] {
                continue;
            }
            self.tracks.push(MotionTrack {
                id: self.next_id,
                bbox: *det_box,
                velocity: [0.0; 4],
                hit_streak: 0,
                time_since_update: 0,
            });
            self.next_id += 1;
        }

        let min_hits = self.params.min_hits;
        let warming_up = self.frame_count <= min_hits as u64;
        let out = self
            .tracks
            .iter()
            .filter(|t| t.time_since_update == 0 && (t.hit_streak >= min_hits || warming_up))
            .map(|t| TrackedObject {
                bbox: t.bbox,
                track_id: t.id,
            })
            .collect();

        let max_age = self.params.max_age;
        self.release(|t| t.time_since_update <= max_age);
        out
    }

    fn release(&mut self, keep: impl Fn(&MotionTrack) -> bool) {
        let evicted = &mut self.evicted;
        self.tracks.retain(|t| {
            let kept = keep(t);
            if !kept {
                evicted.push(t.id);
            }
            kept
        });
    }
}

impl IdentityTracker for IouTracker {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn update(&mut self, _frame: &Frame, detections: &[Detection]) -> Vec<TrackedObject> {
        let boxes: Vec<BBox> = detections.iter().map(|d| d.bbox).collect();
        self.step(&boxes)
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

    fn row(x1: f32, y1: f32, x2: f32, y2: f32) -> [f32; 5] {
        [x1, y1, x2, y2, 0.9]
    }

    #[test]
    fn reports_every_match_during_warm_up() {
        let mut tracker = IouTracker::new(IouTrackerParams::default());
        for _ in 0..3 {
            let out = tracker.update_rows(&[row(400.0, 100.0, 600.0, 200.0)]);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0][4], 1.0);
        }
    }

    #[test]
    fn new_tracks_after_warm_up_need_min_hits() {
        let mut tracker = IouTracker::new(IouTrackerParams::default());
        for _ in 0..3 {
            tracker.update_rows(&[]);
        }
        let b = row(10.0, 10.0, 50.0, 50.0);
        assert!(tracker.update_rows(&[b]).is_empty());
        assert!(tracker.update_rows(&[b]).is_empty());
        assert!(tracker.update_rows(&[b]).is_empty());
        let out = tracker.update_rows(&[b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][4], 1.0);
    }

    #[test]
    fn follows_moving_box_with_velocity() {
        let mut tracker = IouTracker::new(IouTrackerParams {
            iou_threshold: 0.5,
            ..IouTrackerParams::default()
        });
        let mut ids = Vec::new();
        for step in 0..6 {
            let x = step as f32 * 15.0;
            let out = tracker.update_rows(&[row(x, 0.0, x + 50.0, 50.0)]);
            if let Some(r) = out.first() {
                ids.push(r[4]);
            }
        }
        assert!(!ids.is_empty());
        assert!(ids.iter().all(|&id| id == 1.0));
    }

    #[test]
    fn evicts_after_max_age_and_allocates_fresh_id() {
        let mut tracker = IouTracker::new(IouTrackerParams {
            max_age: 2,
            min_hits: 0,
            ..IouTrackerParams::default()
        });
        let b = row(10.0, 10.0, 50.0, 50.0);
        assert_eq!(tracker.update_rows(&[b])[0][4], 1.0);
        tracker.update_rows(&[]);
        tracker.update_rows(&[]);
        assert_eq!(tracker.known_tracks(), 1);
        tracker.update_rows(&[]);
        assert_eq!(tracker.known_tracks(), 0);
        assert_eq!(tracker.take_evicted(), vec![1]);
        assert_eq!(tracker.update_rows(&[b])[0][4], 2.0);
    }

    #[test]
    fn disjoint_detections_get_distinct_ids() {
        let mut tracker = IouTracker::new(IouTrackerParams::default());
        let out = tracker.update_rows(&[row(0.0, 0.0, 10.0, 10.0), row(100.0, 100.0, 110.0, 110.0)]);
        let mut ids: Vec<f32> = out.iter().map(|r| r[4]).collect();
        ids.sort_by(f32::total_cmp);
        assert_eq!(ids, vec![1.0, 2.0]);
    }

    #[test]
    fn large_ids_stay_distinct() {
        let mut tracker = IouTracker::new(IouTrackerParams::default());
        tracker.next_id = 16_777_219;
        let frame = Frame::solid(200, 200, [0, 0, 0]);
        let out = tracker.update(
            &frame,
            &[
                Detection::new(BBox::new(0.0, 0.0, 10.0, 10.0), 0.9),
                Detection::new(BBox::new(100.0, 100.0, 110.0, 110.0), 0.9),
            ],
        );
        let ids: Vec<TrackId> = out.iter().map(|o| o.track_id).collect();
        assert_eq!(ids, vec![16_777_219, 16_777_220]);
    }

    #[test]
    fn empty_input_is_not_an_error() {
        let mut tracker = IouTracker::new(IouTrackerParams::default());
        let frame = Frame::solid(4, 4, [0, 0, 0]);
        assert!(tracker.update(&frame, &[]).is_empty());
    }
}
