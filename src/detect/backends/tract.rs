#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{Detection, FaceBox, FaceLandmarks};
use crate::frame::RgbFrame;

type Plan = TypedSimplePlan<TypedModel>;

// Model input layouts. These match the publicly distributed pretrained
// weights (YOLO-family object detector, UltraFace-320 face detector,
// 468-point face mesh); only the file paths are configurable.
const OBJECT_INPUT: (u32, u32) = (640, 640);
const FACE_INPUT: (u32, u32) = (320, 240);
const MESH_INPUT: (u32, u32) = (192, 192);
const MESH_POINTS: usize = 468;
const NMS_IOU_THRESHOLD: f32 = 0.45;
const FACE_CROP_MARGIN: f32 = 0.25;

/// Tract-based backend for ONNX inference.
///
/// Loads local model files only; no network I/O, no disk writes after model
/// loading, no raw frame retained beyond a call.
pub struct TractBackend {
    object_plan: Option<Plan>,
    face_plan: Option<Plan>,
    mesh_plan: Option<Plan>,
    confidence_threshold: f32,
}

impl TractBackend {
    pub fn new() -> Self {
        Self {
            object_plan: None,
            face_plan: None,
            mesh_plan: None,
            confidence_threshold: 0.5,
        }
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_object_model<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.object_plan = Some(load_plan(path.as_ref(), OBJECT_INPUT)?);
        Ok(self)
    }

    pub fn with_face_model<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.face_plan = Some(load_plan(path.as_ref(), FACE_INPUT)?);
        Ok(self)
    }

    pub fn with_landmark_model<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.mesh_plan = Some(load_plan(path.as_ref(), MESH_INPUT)?);
        Ok(self)
    }

    fn run_objects(&self, frame: &RgbFrame) -> Result<Vec<Detection>> {
        let plan = self
            .object_plan
            .as_ref()
            .ok_or_else(|| anyhow!("object model not loaded"))?;
        let input = build_input(frame, OBJECT_INPUT, Normalization::ZeroToOne)?;
        let outputs = plan
            .run(tvec!(input.into()))
            .context("object detection inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("object model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("object model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[2] < 6 {
            return Err(anyhow!("unexpected object model output shape {:?}", shape));
        }
        let data = view
            .as_slice()
            .ok_or_else(|| anyhow!("object model output not contiguous"))?;

        let stride = shape[2];
        let num_classes = stride - 5;
        let (input_w, input_h) = (OBJECT_INPUT.0 as f32, OBJECT_INPUT.1 as f32);
        let mut candidates = Vec::new();
        for row in data.chunks_exact(stride).take(shape[1]) {
            let objectness = row[4];
            if objectness < self.confidence_threshold {
                continue;
            }
            let (mut best_class, mut best_score) = (0usize, f32::NEG_INFINITY);
            for (class, &score) in row[5..5 + num_classes].iter().enumerate() {
                if score > best_score {
                    best_class = class;
                    best_score = score;
                }
            }
            let confidence = objectness * best_score;
            if confidence < self.confidence_threshold {
                continue;
            }
            let label = COCO_LABELS
                .get(best_class)
                .copied()
                .unwrap_or("unknown")
                .to_string();
            // row is (cx, cy, w, h) in model-input pixels
            candidates.push(Detection {
                x: (row[0] - row[2] / 2.0) / input_w,
                y: (row[1] - row[3] / 2.0) / input_h,
                w: row[2] / input_w,
                h: row[3] / input_h,
                confidence,
                label,
            });
        }
        Ok(non_max_suppress(candidates, NMS_IOU_THRESHOLD))
    }

    fn run_faces(&self, frame: &RgbFrame) -> Result<Vec<FaceBox>> {
        let plan = self
            .face_plan
            .as_ref()
            .ok_or_else(|| anyhow!("face model not loaded"))?;
        let input = build_input(frame, FACE_INPUT, Normalization::Centered)?;
        let outputs = plan
            .run(tvec!(input.into()))
            .context("face detection inference failed")?;
        if outputs.len() < 2 {
            return Err(anyhow!("face model produced {} outputs", outputs.len()));
        }
        let scores = outputs[0]
            .to_array_view::<f32>()
            .context("face score tensor was not f32")?;
        let boxes = outputs[1]
            .to_array_view::<f32>()
            .context("face box tensor was not f32")?;
        let scores = scores
            .as_slice()
            .ok_or_else(|| anyhow!("face score output not contiguous"))?;
        let boxes = boxes
            .as_slice()
            .ok_or_else(|| anyhow!("face box output not contiguous"))?;
        if scores.len() / 2 != boxes.len() / 4 {
            return Err(anyhow!("face model score/box count mismatch"));
        }

        let mut candidates = Vec::new();
        for (i, score_pair) in scores.chunks_exact(2).enumerate() {
            let confidence = score_pair[1];
            if confidence < self.confidence_threshold {
                continue;
            }
            // boxes are (x1, y1, x2, y2), already normalized
            let b = &boxes[i * 4..i * 4 + 4];
            candidates.push(Detection {
                x: b[0],
                y: b[1],
                w: (b[2] - b[0]).max(0.0),
                h: (b[3] - b[1]).max(0.0),
                confidence,
                label: String::new(),
            });
        }
        Ok(non_max_suppress(candidates, NMS_IOU_THRESHOLD)
            .into_iter()
            .map(|d| FaceBox {
                x: d.x,
                y: d.y,
                w: d.w,
                h: d.h,
                confidence: d.confidence,
            })
            .collect())
    }

    fn run_landmarks(&self, frame: &RgbFrame) -> Result<Option<FaceLandmarks>> {
        let plan = self
            .mesh_plan
            .as_ref()
            .ok_or_else(|| anyhow!("landmark model not loaded"))?;
        let faces = self.run_faces(frame)?;
        let Some(face) = faces
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        else {
            return Ok(None);
        };

        let (crop_x, crop_y, crop_w, crop_h) = expand_face_box(&face, frame.width, frame.height);
        let crop = frame.crop(crop_x, crop_y, crop_w, crop_h)?;
        let input = build_input(&crop, MESH_INPUT, Normalization::ZeroToOne)?;
        let outputs = plan
            .run(tvec!(input.into()))
            .context("landmark inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("landmark model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("landmark tensor was not f32")?;
        let data = view
            .as_slice()
            .ok_or_else(|| anyhow!("landmark output not contiguous"))?;
        if data.len() < MESH_POINTS * 3 {
            return Err(anyhow!(
                "landmark output too short: {} values",
                data.len()
            ));
        }

        // Mesh coordinates are in model-input pixels over the crop; map back
        // to normalized full-frame coordinates.
        let mut points = Vec::with_capacity(MESH_POINTS);
        for triple in data.chunks_exact(3).take(MESH_POINTS) {
            let crop_rel_x = triple[0] / MESH_INPUT.0 as f32;
            let crop_rel_y = triple[1] / MESH_INPUT.1 as f32;
            points.push((
                (crop_x as f32 + crop_rel_x * crop.width as f32) / frame.width as f32,
                (crop_y as f32 + crop_rel_y * crop.height as f32) / frame.height as f32,
            ));
        }
        Ok(Some(FaceLandmarks { points }))
    }
}

impl Default for TractBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        match capability {
            DetectionCapability::ObjectDetection => self.object_plan.is_some(),
            DetectionCapability::FaceDetection => self.face_plan.is_some(),
            DetectionCapability::FaceLandmarks => {
                self.face_plan.is_some() && self.mesh_plan.is_some()
            }
        }
    }

    fn detect_objects(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let frame = RgbFrame::from_rgb(pixels.to_vec(), width, height)?;
        self.run_objects(&frame)
    }

    fn detect_faces(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<FaceBox>> {
        let frame = RgbFrame::from_rgb(pixels.to_vec(), width, height)?;
        self.run_faces(&frame)
    }

    fn face_landmarks(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FaceLandmarks>> {
        let frame = RgbFrame::from_rgb(pixels.to_vec(), width, height)?;
        self.run_landmarks(&frame)
    }
}

enum Normalization {
    /// x / 255
    ZeroToOne,
    /// (x - 127) / 128
    Centered,
}

fn load_plan(path: &Path, (width, height): (u32, u32)) -> Result<Plan> {
    tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to load ONNX model from {}", path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(
                f32::datum_type(),
                tvec!(1, 3, height as usize, width as usize),
            ),
        )
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")
}

fn build_input(
    frame: &RgbFrame,
    (width, height): (u32, u32),
    normalization: Normalization,
) -> Result<Tensor> {
    let resized = frame.resize(width, height)?;
    let pixels = resized.pixels();
    let width = width as usize;
    let input = tract_ndarray::Array4::from_shape_fn(
        (1, 3, height as usize, width),
        |(_, channel, y, x)| {
            let value = pixels[(y * width + x) * 3 + channel] as f32;
            match normalization {
                Normalization::ZeroToOne => value / 255.0,
                Normalization::Centered => (value - 127.0) / 128.0,
            }
        },
    );
    Ok(input.into_tensor())
}

fn expand_face_box(face: &FaceBox, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let margin_x = face.w * FACE_CROP_MARGIN;
    let margin_y = face.h * FACE_CROP_MARGIN;
    let x = ((face.x - margin_x).max(0.0) * width as f32) as u32;
    let y = ((face.y - margin_y).max(0.0) * height as f32) as u32;
    let w = (((face.w + 2.0 * margin_x) * width as f32) as u32).max(1);
    let h = (((face.h + 2.0 * margin_y) * height as f32) as u32).max(1);
    (x, y, w, h)
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.w).min(b.x + b.w);
    let y2 = (a.y + a.h).min(b.y + b.h);
    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.w * a.h + b.w * b.h - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy per-label non-maximum suppression.
fn non_max_suppress(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.label == candidate.label && iou(k, &candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

const COCO_LABELS: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];
