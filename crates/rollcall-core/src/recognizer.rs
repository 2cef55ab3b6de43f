//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional, L2-normalized face embeddings from 112×112
//! face crops, either landmark-aligned or plainly resized.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::detector::resize_bilinear;
use crate::types::{BoundingBox, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // ArcFace normalizes symmetrically, unlike SCRFD
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download it from insightface into the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; alignment needs all five points")]
    NoLandmarks,
    #[error("empty image")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
    model_version: String,
}

impl FaceRecognizer {
    /// Load an ArcFace ONNX model. The file stem becomes the embedding's model version.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        let path = Path::new(model_path);
        if !path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let model_version = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        tracing::info!(
            path = model_path,
            model = %model_version,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session,
            model_version,
        })
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    /// Embed a detected face, aligning it on its five landmarks first.
    pub fn extract(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(frame, width, height, landmarks);
        self.embed(&aligned)
    }

    /// Embed a whole image as if it were already a face crop.
    ///
    /// Used when detection finds nothing on an image known to contain a face.
    pub fn extract_unaligned(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Embedding, RecognizerError> {
        if width == 0 || height == 0 || frame.len() < (width * height) as usize {
            return Err(RecognizerError::EmptyImage);
        }
        let resized = resize_bilinear(
            frame,
            width as usize,
            height as usize,
            ALIGNED_SIZE,
            ALIGNED_SIZE,
        );
        self.embed(&resized)
    }

    fn embed(&mut self, face_112: &[u8]) -> Result<Embedding, RecognizerError> {
        let input = Self::preprocess(face_112);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(Embedding {
            values: raw_data.to_vec(),
            model_version: Some(self.model_version.clone()),
        }
        .l2_normalized())
    }

    /// 112×112 grayscale crop → NCHW float tensor, gray replicated to three channels.
    fn preprocess(face_112: &[u8]) -> Array4<f32> {
        let size = ALIGNED_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let pixel = face_112.get(y * size + x).copied().unwrap_or(0) as f32;
                let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                for c in 0..3 {
                    tensor[[0, c, y, x]] = normalized;
                }
            }
        }

        tensor
    }
}
