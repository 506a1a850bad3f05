use anyhow::{anyhow, Result};

use crate::pose::POSE_LANDMARK_IDS;

/// A labeled object detection. Coordinates are normalized to 0..1.
#[derive(Clone, Debug)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
    pub label: String,
}

/// A detected face bounding box. Coordinates are normalized to 0..1.
#[derive(Clone, Copy, Debug, Default)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
}

impl FaceBox {
    /// Normalized box center.
    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.x) + f64::from(self.w) / 2.0,
            f64::from(self.y) + f64::from(self.h) / 2.0,
        )
    }
}

/// Dense facial landmarks, normalized to 0..1 in frame coordinates.
#[derive(Clone, Debug, Default)]
pub struct FaceLandmarks {
    pub points: Vec<(f32, f32)>,
}

impl FaceLandmarks {
    /// The six pose landmarks (nose, chin, eye corners, mouth corners),
    /// scaled to pixel coordinates for the PnP solve.
    pub fn pose_points(&self, width: u32, height: u32) -> Result<[(f64, f64); 6]> {
        let mut out = [(0.0, 0.0); 6];
        for (slot, &idx) in POSE_LANDMARK_IDS.iter().enumerate() {
            let (x, y) = self
                .points
                .get(idx)
                .copied()
                .ok_or_else(|| anyhow!("landmark set missing index {}", idx))?;
            out[slot] = (
                f64::from(x) * f64::from(width),
                f64::from(y) * f64::from(height),
            );
        }
        Ok(out)
    }
}
