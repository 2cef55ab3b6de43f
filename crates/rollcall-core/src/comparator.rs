//! Pairwise face verification: reference photo vs. captured crop.

use crate::detector::{Detector, DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{DistanceMetric, Embedding, Verification};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComparatorError {
    #[error("failed to load image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("embedding model mismatch: {0} vs {1}")]
    ModelMismatch(String, String),
}

/// Judges whether two face images show the same person.
pub trait Comparator {
    fn verify(&mut self, reference: &Path, captured: &Path) -> Result<Verification, ComparatorError>;

    /// Forget any per-path state. Called before every match run, since
    /// capture file names repeat from one session to the next.
    fn reset(&mut self) {}
}

/// Turns an image file into a face embedding.
pub trait Embedder {
    fn embed_file(&mut self, path: &Path) -> Result<Embedding, ComparatorError>;
}

/// SCRFD + ArcFace embedder.
///
/// Takes the most confident detected face; when nothing is detected the
/// whole image is embedded as-is.
pub struct FaceEmbedder<D: Detector = FaceDetector> {
    detector: D,
    recognizer: FaceRecognizer,
}

impl<D: Detector> FaceEmbedder<D> {
    pub fn new(detector: D, recognizer: FaceRecognizer) -> Self {
        Self {
            detector,
            recognizer,
        }
    }
}

impl<D: Detector> Embedder for FaceEmbedder<D> {
    fn embed_file(&mut self, path: &Path) -> Result<Embedding, ComparatorError> {
        let gray = image::open(path)
            .map_err(|source| ComparatorError::Image {
                path: path.to_path_buf(),
                source,
            })?
            .to_luma8();
        let (width, height) = gray.dimensions();
        let pixels = gray.as_raw();

        let faces = self.detector.detect(pixels, width, height)?;
        match faces.iter().find(|f| f.landmarks.is_some()) {
            Some(face) => Ok(self.recognizer.extract(pixels, width, height, face)?),
            None => {
                tracing::debug!(path = %path.display(), "no face detected, embedding whole image");
                Ok(self.recognizer.extract_unaligned(pixels, width, height)?)
            }
        }
    }
}

/// Embedding-distance comparator with a fixed metric and verification threshold.
///
/// Embeddings are cached by path until [`Comparator::reset`].
pub struct EmbeddingComparator<E: Embedder> {
    embedder: E,
    metric: DistanceMetric,
    verify_threshold: f32,
    cache: HashMap<PathBuf, Embedding>,
}

impl<E: Embedder> EmbeddingComparator<E> {
    /// Comparator using the metric's default verification threshold.
    pub fn new(embedder: E, metric: DistanceMetric) -> Self {
        Self::with_threshold(embedder, metric, metric.default_threshold())
    }

    pub fn with_threshold(embedder: E, metric: DistanceMetric, verify_threshold: f32) -> Self {
        Self {
            embedder,
            metric,
            verify_threshold,
            cache: HashMap::new(),
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn embedding(&mut self, path: &Path) -> Result<Embedding, ComparatorError> {
        if let Some(hit) = self.cache.get(path) {
            return Ok(hit.clone());
        }
        let embedding = self.embedder.embed_file(path)?;
        self.cache.insert(path.to_path_buf(), embedding.clone());
        Ok(embedding)
    }
}

impl<E: Embedder> Comparator for EmbeddingComparator<E> {
    fn verify(&mut self, reference: &Path, captured: &Path) -> Result<Verification, ComparatorError> {
        let a = self.embedding(reference)?;
        let b = self.embedding(captured)?;

        if let (Some(va), Some(vb)) = (&a.model_version, &b.model_version) {
            if va != vb {
                return Err(ComparatorError::ModelMismatch(va.clone(), vb.clone()));
            }
        }

        let distance = self.metric.distance(&a, &b);
        Ok(Verification {
            verified: distance <= self.verify_threshold,
            distance,
        })
    }

    fn reset(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Embeds a file by looking its name up in a fixed table; counts calls.
    struct TableEmbedder {
        table: HashMap<String, Vec<f32>>,
        calls: usize,
    }

    impl TableEmbedder {
        fn new(entries: &[(&str, &[f32])]) -> Self {
            Self {
                table: entries.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect(),
                calls: 0,
            }
        }
    }

    impl Embedder for TableEmbedder {
        fn embed_file(&mut self, path: &Path) -> Result<Embedding, ComparatorError> {
            self.calls += 1;
            let key = path.file_name().unwrap().to_string_lossy().into_owned();
            match self.table.get(&key) {
                Some(values) => Ok(Embedding { values: values.clone(), model_version: None }),
                None => Err(ComparatorError::Recognizer(RecognizerError::EmptyImage)),
            }
        }
    }

    #[test]
    fn test_verify_same_direction_is_verified() {
        let embedder = TableEmbedder::new(&[("ref.jpg", &[1.0, 0.0]), ("cap.jpg", &[2.0, 0.0])]);
        let mut cmp = EmbeddingComparator::new(embedder, DistanceMetric::Cosine);
        let v = cmp.verify(Path::new("ref.jpg"), Path::new("cap.jpg")).unwrap();
        assert!(v.verified);
        assert!(v.distance.abs() < 1e-6);
    }

    #[test]
    fn test_verify_orthogonal_is_rejected() {
        let embedder = TableEmbedder::new(&[("ref.jpg", &[1.0, 0.0]), ("cap.jpg", &[0.0, 1.0])]);
        let mut cmp = EmbeddingComparator::new(embedder, DistanceMetric::Cosine);
        let v = cmp.verify(Path::new("ref.jpg"), Path::new("cap.jpg")).unwrap();
        assert!(!v.verified);
        assert!((v.distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_embeddings_cached_until_reset() {
        let embedder = TableEmbedder::new(&[("ref.jpg", &[1.0, 0.0]), ("cap.jpg", &[1.0, 1.0])]);
        let mut cmp = EmbeddingComparator::new(embedder, DistanceMetric::Cosine);
        for _ in 0..3 {
            cmp.verify(Path::new("ref.jpg"), Path::new("cap.jpg")).unwrap();
        }
        assert_eq!(cmp.embedder.calls, 2);

        cmp.reset();
        cmp.verify(Path::new("ref.jpg"), Path::new("cap.jpg")).unwrap();
        assert_eq!(cmp.embedder.calls, 4);
    }

    #[test]
    fn test_embed_failure_propagates() {
        let embedder = TableEmbedder::new(&[("ref.jpg", &[1.0, 0.0])]);
        let mut cmp = EmbeddingComparator::new(embedder, DistanceMetric::Cosine);
        assert!(cmp.verify(Path::new("ref.jpg"), Path::new("missing.jpg")).is_err());
    }

    #[test]
    fn test_model_mismatch_rejected() {
        struct Versioned;
        impl Embedder for Versioned {
            fn embed_file(&mut self, path: &Path) -> Result<Embedding, ComparatorError> {
                Ok(Embedding {
                    values: vec![1.0],
                    model_version: Some(path.to_string_lossy().into_owned()),
                })
            }
        }
        let mut cmp = EmbeddingComparator::new(Versioned, DistanceMetric::Cosine);
        let err = cmp.verify(Path::new("a"), Path::new("b")).unwrap_err();
        assert!(matches!(err, ComparatorError::ModelMismatch(_, _)));
    }
}
