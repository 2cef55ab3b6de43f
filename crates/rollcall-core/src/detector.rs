//! Face detection: the [`Detector`] seam and an SCRFD implementation on ONNX Runtime.
//!
//! SCRFD decodes three anchor-free strides, then NMS, a minimum-size filter,
//! and a confidence sort.

use crate::types::BoundingBox;
use ndarray::{s, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download it from insightface into the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Tune-once detection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// Minimum score for a candidate to survive decoding.
    pub confidence_threshold: f32,
    /// IoU above which the lower-scored of two overlapping boxes is dropped.
    pub nms_threshold: f32,
    /// Boxes narrower or shorter than this (in frame pixels) are discarded.
    pub min_face_size: f32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            min_face_size: 30.0,
        }
    }
}

/// Finds faces in a grayscale frame.
///
/// A frame without faces yields an empty vector, not an error.
pub trait Detector {
    fn detect(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Aspect-preserving fit of a frame into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    /// Size of the resized frame inside the padded input.
    inner_w: usize,
    inner_h: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize, input: usize) -> Self {
        let scale = (input as f32 / width as f32).min(input as f32 / height as f32);
        let inner_w = ((width as f32 * scale).round() as usize).min(input);
        let inner_h = ((height as f32 * scale).round() as usize).min(input);
        Self {
            scale,
            pad_x: (input - inner_w) as f32 / 2.0,
            pad_y: (input - inner_h) as f32 / 2.0,
            inner_w,
            inner_h,
        }
    }

    /// Model-input coordinates back to frame coordinates.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw SCRFD tensors for one stride level.
struct StrideTensors<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    params: DetectorParams,
    input_size: usize,
    /// Per-stride outputs for strides 8, 16 and 32.
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, params: DetectorParams) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), got {}",
                output_names.len()
            )));
        }
        let outputs = map_outputs(&output_names);

        Ok(Self {
            session,
            params,
            input_size: SCRFD_INPUT_SIZE,
            outputs,
        })
    }

    pub fn params(&self) -> DetectorParams {
        self.params
    }

    /// Letterboxed, normalized NCHW input. Padding normalizes to zero.
    fn input_tensor(&self, frame: &[u8], width: usize, height: usize) -> (Array4<f32>, Letterbox) {
        let letterbox = Letterbox::fit(width, height, self.input_size);
        let resized = resize_bilinear(frame, width, height, letterbox.inner_w, letterbox.inner_h);

        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_size, self.input_size));
        let top = letterbox.pad_y.floor() as usize;
        let left = letterbox.pad_x.floor() as usize;
        for (row, line) in resized.chunks_exact(letterbox.inner_w.max(1)).enumerate() {
            for (col, &px) in line.iter().enumerate() {
                let v = (px as f32 - SCRFD_MEAN) / SCRFD_STD;
                // Gray replicated into all three channels.
                tensor
                    .slice_mut(s![0, .., top + row, left + col])
                    .fill(v);
            }
        }
        (tensor, letterbox)
    }
}

impl Detector for FaceDetector {
    fn detect(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        let expected = width as usize * height as usize;
        if frame.len() < expected {
            return Err(DetectorError::FrameTooShort {
                expected,
                actual: frame.len(),
            });
        }
        if expected == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = self.input_tensor(frame, width as usize, height as usize);
        let results = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let extract = |idx: usize, what: &str, stride: usize| {
            results[idx]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
        };

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let out = self.outputs[slot];
            let tensors = StrideTensors {
                stride,
                scores: extract(out.score, "scores", stride)?,
                bboxes: extract(out.bbox, "bboxes", stride)?,
                kps: extract(out.kps, "kps", stride)?,
            };
            candidates.extend(decode_stride(
                &tensors,
                self.input_size,
                &letterbox,
                self.params.confidence_threshold,
            ));
        }

        let min = self.params.min_face_size;
        let mut faces = nms(candidates, self.params.nms_threshold);
        faces.retain(|b| b.width >= min && b.height >= min);
        faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        tracing::trace!(count = faces.len(), "faces detected");
        Ok(faces)
    }
}

/// Bilinear resize of a grayscale buffer (`width × height`) to `new_w × new_h`.
pub(crate) fn resize_bilinear(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let mut out = vec![0u8; new_w * new_h];
    if width == 0 || height == 0 || new_w == 0 || new_h == 0 {
        return out;
    }

    // Source coordinate, lower neighbour, upper neighbour and blend weight.
    let sample = |i: usize, src_len: usize, dst_len: usize| {
        let pos = ((i as f32 + 0.5) * (src_len as f32 / dst_len as f32) - 0.5).clamp(0.0, (src_len - 1) as f32);
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(src_len - 1);
        (lo, hi, pos - lo as f32)
    };

    let cols: Vec<_> = (0..new_w).map(|x| sample(x, width, new_w)).collect();
    for (y, row) in out.chunks_exact_mut(new_w).enumerate() {
        let (y0, y1, fy) = sample(y, height, new_h);
        for (px, &(x0, x1, fx)) in row.iter_mut().zip(&cols) {
            let at = |yy: usize, xx: usize| src[yy * width + xx] as f32;
            let top = at(y0, x0) + (at(y0, x1) - at(y0, x0)) * fx;
            let bottom = at(y1, x0) + (at(y1, x1) - at(y1, x0)) * fx;
            *px = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Locate each stride's tensors by name (`score_8`, `bbox_16`, `kps_32`, ...).
///
/// Exports with anonymous numeric names use the standard positional layout:
/// scores at 0..3, boxes at 3..6, keypoints at 6..9.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match named.as_deref() {
        Some(&[a, b, c]) => {
            tracing::debug!("SCRFD outputs mapped by name");
            [a, b, c]
        }
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized; using positional layout");
            [0, 1, 2].map(|i| StrideOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Turn one stride's anchor grid into frame-space boxes above `threshold`.
fn decode_stride(t: &StrideTensors<'_>, input_size: usize, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
    let grid_w = input_size / t.stride;
    let anchors = (input_size / t.stride) * grid_w * SCRFD_ANCHORS_PER_CELL;
    let step = t.stride as f32;

    t.scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * step;
            let cy = (cell / grid_w) as f32 * step;

            // Distances from the anchor centre to each edge, in stride units.
            let d = t.bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.to_frame(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_frame(cx + d[2] * step, cy + d[3] * step);

            let landmarks = t.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                let mut points = [(0.0f32, 0.0f32); 5];
                for (point, offset) in points.iter_mut().zip(k.chunks_exact(2)) {
                    *point = letterbox.to_frame(cx + offset[0] * step, cy + offset[1] * step);
                }
                points
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, highest confidence first.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = overlap_w * overlap_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
