//! Identity trackers.
//!
//! Two interchangeable strategies sit behind `IdentityTracker`:
//! - `color::ColorSignatureTracker`: re-identifies objects by a (hue,
//!   saturation) signature, no motion continuity needed.
//! - `motion::IouTracker`: SORT-style box association, consumed as an
//!   id-producing oracle.

use serde::{Deserialize, Serialize};

use crate::detect::{BBox, Detection};
use crate::frame::Frame;

pub mod color;
pub mod motion;

pub type TrackId = u64;

/// A detection bound to a track identity for the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub bbox: BBox,
    pub track_id: TrackId,
}

/// Assigns stable identities to each frame's detections.
///
/// An empty detection slice is valid input and yields whatever the
/// strategy reports without new matches (never an error).
pub trait IdentityTracker: Send {
    fn name(&self) -> &'static str;

    fn update(&mut self, frame: &Frame, detections: &[Detection]) -> Vec<TrackedObject>;

    /// Tracks currently held in memory.
    fn known_tracks(&self) -> usize;

    /// Ids dropped since the last call. An evicted id is never reported
    /// again by the strategies in this crate.
    fn take_evicted(&mut self) -> Vec<TrackId> {
        Vec::new()
    }
}

/// Which tracker the pipeline uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    Motion,
    Color,
}

impl std::str::FromStr for TrackerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "motion" | "sort" | "iou" => Ok(Self::Motion),
            "color" | "colour" | "signature" => Ok(Self::Color),
            other => Err(anyhow::anyhow!(
                "unknown tracker '{}'; expected motion or color",
                other
            )),
        }
    }
}
