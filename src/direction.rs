//! Heading estimate from horizontal position.
//!
//! `direction = (x_center / frame_width) * 180`. This is a linear proxy under
//! an assumed 180° field of view across the frame width, not a calibrated
//! compass bearing: the left edge maps to 0°, the right edge to 180°.

use anyhow::{anyhow, Result};

use crate::detect::BBox;

pub const FIELD_OF_VIEW_DEG: f64 = 180.0;

/// Direction in degrees, always within `[0, 180]`.
///
/// Box centers outside the frame (trackers may extrapolate past the edge)
/// are clamped.
pub fn estimate_direction(bbox: &BBox, frame_width: u32) -> Result<f64> {
    if frame_width == 0 {
        return Err(anyhow!("frame width must be non-zero"));
    }
    let x_center = bbox.center_x() as f64;
    if !x_center.is_finite() {
        return Err(anyhow!("bounding box center is not finite"));
    }
    let normalized = x_center / frame_width as f64;
    Ok((normalized * FIELD_OF_VIEW_DEG).clamp(0.0, FIELD_OF_VIEW_DEG))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn centered_at(x: f32) -> BBox {
        BBox::new(x - 10.0, 0.0, x + 10.0, 10.0)
    }

    #[test]
    fn maps_edges_and_center() {
        assert_eq!(estimate_direction(&centered_at(0.0), 1000).unwrap(), 0.0);
        assert_eq!(estimate_direction(&centered_at(500.0), 1000).unwrap(), 90.0);
        assert_eq!(estimate_direction(&centered_at(1000.0), 1000).unwrap(), 180.0);
    }

    #[test]
    fn uses_horizontal_midpoint() {
        let bbox = BBox::new(400.0, 100.0, 600.0, 200.0);
        assert_eq!(estimate_direction(&bbox, 1000).unwrap(), 90.0);
    }

    #[test]
    fn clamps_out_of_frame_centers() {
        assert_eq!(estimate_direction(&centered_at(-50.0), 1000).unwrap(), 0.0);
        assert_eq!(estimate_direction(&centered_at(1200.0), 1000).unwrap(), 180.0);
    }

    #[test]
    fn rejects_zero_width_frame() {
        assert!(estimate_direction(&centered_at(5.0), 0).is_err());
    }
}
