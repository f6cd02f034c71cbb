//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB frame into the 640×640 model input, decodes the
//! three anchor-free stride heads and suppresses overlapping boxes.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting a frame into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    fn resized_dims(&self, width: u32, height: u32) -> (u32, u32) {
        (
            ((width as f32 * self.scale).round() as u32).max(1),
            ((height as f32 * self.scale).round() as u32).max(1),
        )
    }

    /// Map a point from model-input space back to source-frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions of one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [HeadOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let heads = map_head_outputs(&output_names);
        tracing::debug!(?heads, "SCRFD output tensor mapping");

        Ok(Self { session, heads })
    }

    /// Detect faces in an RGB frame, highest confidence first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in self.heads.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(head.score, "scores")?;
            let bboxes = extract(head.bbox, "bboxes")?;
            let kps = extract(head.kps, "kps")?;

            candidates.extend(decode_head(scores, bboxes, kps, stride, &letterbox));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox an RGB frame into a normalized NCHW tensor.
///
/// Padding is filled with the mean so it normalizes to 0.0.
fn preprocess(frame: &RgbImage) -> (Array4<f32>, Letterbox) {
    let size = SCRFD_INPUT_SIZE as usize;
    let letterbox = Letterbox::fit(frame.width(), frame.height(), SCRFD_INPUT_SIZE);
    let (new_w, new_h) = letterbox.resized_dims(frame.width(), frame.height());
    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (off_x, off_y) = (letterbox.pad_x as u32, letterbox.pad_y as u32);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + off_x) as usize, (y + off_y) as usize);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Locate the score/bbox/kps outputs of each stride.
///
/// Exports either name them `score_8`, `bbox_16`, `kps_32`, ... or use
/// generic names in the standard order `[scores×3, bboxes×3, kps×3]`.
fn map_head_outputs(names: &[String]) -> [HeadOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<HeadOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(HeadOutputs {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride)?,
            })
        })
        .collect();

    match named.as_deref() {
        Some(&[s8, s16, s32]) => [s8, s16, s32],
        _ => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            std::array::from_fn(|i| HeadOutputs { score: i, bbox: i + 3, kps: i + 6 })
        }
    }
}

/// Decode one stride head into candidate boxes in source-frame coordinates.
fn decode_head(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut out = Vec::new();
    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }
        let Some(dist) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let cx = (cell % grid) as f32 * step;
        let cy = (cell / grid) as f32 * step;

        let (x1, y1) = letterbox.unmap(cx - dist[0] * step, cy - dist[1] * step);
        let (x2, y2) = letterbox.unmap(cx + dist[2] * step, cy + dist[3] * step);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap(cx + k[i * 2] * step, cy + k[i * 2 + 1] * step))
        });

        out.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    out
}

/// Non-maximum suppression; output is sorted by descending confidence.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
