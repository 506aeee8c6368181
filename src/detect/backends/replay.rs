use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BBox, Detection};
use crate::frame::Frame;

/// Replays recorded detector output keyed by frame index.
///
/// Lets the pipeline run (and be tested) without a model. Frames that have
/// no recorded entry produce an empty detection list.
#[derive(Clone, Debug, Default)]
pub struct ReplayBackend {
    script: HashMap<u64, Vec<Detection>>,
}

/// One line of a recording: `{"frame": 3, "detections": [[x1, y1, x2, y2, conf]]}`.
#[derive(Debug, Deserialize)]
struct RecordedFrame {
    frame: u64,
    #[serde(default)]
    detections: Vec<[f32; 5]>,
}

impl ReplayBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script indexed by position: entry `i` is returned for frame `i + 1`.
    pub fn from_frames(frames: Vec<Vec<Detection>>) -> Self {
        let script = frames
            .into_iter()
            .enumerate()
            .map(|(i, dets)| (i as u64 + 1, dets))
            .collect();
        Self { script }
    }

    /// Load a JSON-lines recording. Blank lines are skipped.
    pub fn from_jsonl<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detections file {}", path.display()))?;
        Self::parse_jsonl(&raw)
            .with_context(|| format!("invalid detections file {}", path.display()))
    }

    pub fn parse_jsonl(raw: &str) -> Result<Self> {
        let mut script: HashMap<u64, Vec<Detection>> = HashMap::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let recorded: RecordedFrame = serde_json::from_str(line)
                .map_err(|e| anyhow!("line {}: {}", lineno + 1, e))?;
            let dets = script.entry(recorded.frame).or_default();
            for [x1, y1, x2, y2, conf] in recorded.detections {
                if !(0.0..=1.0).contains(&conf) {
                    return Err(anyhow!(
                        "line {}: confidence {} out of bounds",
                        lineno + 1,
                        conf
                    ));
                }
                dets.push(Detection::new(BBox::new(x1, y1, x2, y2), conf));
            }
        }
        Ok(Self { script })
    }

    pub fn recorded_frames(&self) -> usize {
        self.script.len()
    }
}

impl DetectorBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self.script.get(&frame.index).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(index: u64) -> Frame {
        let mut f = Frame::solid(4, 4, [0, 0, 0]);
        f.index = index;
        f
    }

    #[test]
    fn parses_recording_and_replays_by_index() {
        let raw = r#"
            {"frame": 1, "detections": [[400, 100, 600, 200, 0.9]]}
            {"frame": 3, "detections": []}
        "#;
        let mut backend = ReplayBackend::parse_jsonl(raw).unwrap();
        assert_eq!(backend.recorded_frames(), 2);

        let dets = backend.detect(&frame(1)).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox, BBox::new(400.0, 100.0, 600.0, 200.0));

        assert!(backend.detect(&frame(2)).unwrap().is_empty());
        assert!(backend.detect(&frame(3)).unwrap().is_empty());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let raw = r#"{"frame": 1, "detections": [[0, 0, 1, 1, 1.5]]}"#;
        assert!(ReplayBackend::parse_jsonl(raw).is_err());
    }

    #[test]
    fn positional_script_starts_at_frame_one() {
        let det = Detection::new(BBox::new(0.0, 0.0, 2.0, 2.0), 0.5);
        let mut backend = ReplayBackend::from_frames(vec![vec![det], vec![]]);
        assert_eq!(backend.detect(&frame(1)).unwrap(), vec![det]);
        assert!(backend.detect(&frame(2)).unwrap().is_empty());
    }
}
