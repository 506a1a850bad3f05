use anyhow::{anyhow, Result};

use crate::detect::result::{Detection, FaceBox, FaceLandmarks};

/// Detection capabilities a backend may serve.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    FaceDetection,
    FaceLandmarks,
    ObjectDetection,
}

/// Detector backend trait.
///
/// Backends own pretrained models (or scripted fixtures) and must treat the
/// pixel slice as read-only and ephemeral: no raw frame may be retained
/// beyond the call, written to disk, or sent over the network.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Labeled object detection over an RGB frame.
    fn detect_objects(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let _ = (pixels, width, height);
        Err(anyhow!("backend '{}' does not detect objects", self.name()))
    }

    /// Face bounding boxes over an RGB frame.
    fn detect_faces(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<FaceBox>> {
        let _ = (pixels, width, height);
        Err(anyhow!("backend '{}' does not detect faces", self.name()))
    }

    /// Dense landmarks for the most prominent face, if any.
    fn face_landmarks(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FaceLandmarks>> {
        let _ = (pixels, width, height);
        Err(anyhow!(
            "backend '{}' does not extract landmarks",
            self.name()
        ))
    }

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
