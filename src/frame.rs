//! Decoded frames and the source trait that produces them.
//!
//! - `Frame`: packed RGB8 pixels plus capture metadata.
//! - `FrameSource`: sequential producer; `Ok(None)` signals end-of-stream.

use anyhow::{anyhow, Result};
use std::time::SystemTime;

/// A decoded RGB8 frame. Row-major, 3 bytes per pixel.
#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Position in the source's sequence, starting at 1.
    pub index: u64,
    pub captured_at: SystemTime,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        Self::with_capture_time(pixels, width, height, index, SystemTime::now())
    }

    pub fn with_capture_time(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        index: u64,
        captured_at: SystemTime,
    ) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            index,
            captured_at,
        })
    }

    /// Frame filled with one color.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            pixels,
            width,
            height,
            index: 0,
            captured_at: SystemTime::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// RGB triple at (x, y). Caller guarantees bounds.
    pub fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        [self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2]]
    }

    /// Paint an axis-aligned rectangle, clipped to the frame.
    pub fn fill_rect(&mut self, x1: u32, y1: u32, x2: u32, y2: u32, rgb: [u8; 3]) {
        let x2 = x2.min(self.width);
        let y2 = y2.min(self.height);
        for y in y1..y2 {
            for x in x1..x2 {
                let idx = (y as usize * self.width as usize + x as usize) * 3;
                self.pixels[idx..idx + 3].copy_from_slice(&rgb);
            }
        }
    }
}

/// Sequential frame producer.
pub trait FrameSource: Send {
    /// Source identifier for logs.
    fn describe(&self) -> String;

    /// Next frame, or `Ok(None)` when the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Frames produced so far.
    fn frames_produced(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_pixel_buffer() {
        assert!(Frame::new(vec![0u8; 10], 2, 2, 1).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2, 1).is_ok());
    }

    #[test]
    fn fill_rect_is_clipped_to_frame() {
        let mut frame = Frame::solid(4, 4, [0, 0, 0]);
        frame.fill_rect(2, 2, 10, 10, [255, 0, 0]);
        assert_eq!(frame.rgb(3, 3), [255, 0, 0]);
        assert_eq!(frame.rgb(1, 1), [0, 0, 0]);
    }
}
