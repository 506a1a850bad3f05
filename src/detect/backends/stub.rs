use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{Detection, FaceBox, FaceLandmarks};

/// Scripted backend for tests and model-less deployments.
///
/// Returns whatever scene it was constructed with; an empty stub reports no
/// faces, no landmarks and no objects, so endpoints degrade to "no face" /
/// "clear" instead of failing.
#[derive(Default)]
pub struct StubBackend {
    faces: Vec<FaceBox>,
    objects: Vec<Detection>,
    landmarks: Option<FaceLandmarks>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faces(mut self, faces: Vec<FaceBox>) -> Self {
        self.faces = faces;
        self
    }

    pub fn with_objects(mut self, objects: Vec<Detection>) -> Self {
        self.objects = objects;
        self
    }

    pub fn with_landmarks(mut self, landmarks: FaceLandmarks) -> Self {
        self.landmarks = Some(landmarks);
        self
    }

    fn check_frame(&self, pixels: &[u8], width: u32, height: u32) -> Result<()> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected,
                pixels.len()
            ));
        }
        Ok(())
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(
            capability,
            DetectionCapability::FaceDetection
                | DetectionCapability::FaceLandmarks
                | DetectionCapability::ObjectDetection
        )
    }

    fn detect_objects(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        self.check_frame(pixels, width, height)?;
        Ok(self.objects.clone())
    }

    fn detect_faces(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<FaceBox>> {
        self.check_frame(pixels, width, height)?;
        Ok(self.faces.clone())
    }

    fn face_landmarks(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FaceLandmarks>> {
        self.check_frame(pixels, width, height)?;
        Ok(self.landmarks.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stub_reports_empty_scene() {
        let mut backend = StubBackend::new();
        let frame = vec![0u8; 4 * 4 * 3];
        assert!(backend.detect_faces(&frame, 4, 4).unwrap().is_empty());
        assert!(backend.detect_objects(&frame, 4, 4).unwrap().is_empty());
        assert!(backend.face_landmarks(&frame, 4, 4).unwrap().is_none());
    }

    #[test]
    fn scripted_scene_is_returned() {
        let mut backend = StubBackend::new()
            .with_faces(vec![FaceBox {
                x: 0.4,
                y: 0.4,
                w: 0.2,
                h: 0.2,
                confidence: 0.9,
            }])
            .with_objects(vec![Detection {
                x: 0.1,
                y: 0.1,
                w: 0.2,
                h: 0.2,
                confidence: 0.8,
                label: "cell phone".to_string(),
            }]);
        let frame = vec![0u8; 4 * 4 * 3];
        assert_eq!(backend.detect_faces(&frame, 4, 4).unwrap().len(), 1);
        assert_eq!(
            backend.detect_objects(&frame, 4, 4).unwrap()[0].label,
            "cell phone"
        );
    }

    #[test]
    fn frame_length_is_validated() {
        let mut backend = StubBackend::new();
        assert!(backend.detect_faces(&[0u8; 5], 4, 4).is_err());
    }
}
