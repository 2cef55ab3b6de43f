use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Integer pixel rectangle `(x, y, width, height)` clamped to a
    /// `frame_width × frame_height` frame. `None` if nothing is left.
    pub fn pixel_rect(&self, frame_width: u32, frame_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor();
        let y0 = self.y.max(0.0).floor();
        let x1 = (self.x + self.width).min(frame_width as f32).ceil();
        let y1 = (self.y + self.height).min(frame_height as f32).ceil();
        if !(x1 > x0 && y1 > y0) {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Unit-length copy of this embedding. A zero vector is returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// Distance metric used to compare two embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, in [0, 2].
    Cosine,
    Euclidean,
    /// Euclidean distance between L2-normalized embeddings.
    EuclideanL2,
}

impl DistanceMetric {
    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - a.similarity(b),
            DistanceMetric::Euclidean => a.euclidean_distance(b),
            DistanceMetric::EuclideanL2 => a.l2_normalized().euclidean_distance(&b.l2_normalized()),
        }
    }

    /// Verification cut-off for ArcFace embeddings under this metric.
    pub fn default_threshold(&self) -> f32 {
        match self {
            DistanceMetric::Cosine => 0.68,
            DistanceMetric::Euclidean => 4.15,
            DistanceMetric::EuclideanL2 => 1.13,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean_l2",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "euclidean_l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// A comparator's judgment on one (reference, captured) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub verified: bool,
    pub distance: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_cosine_distance_range() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!(DistanceMetric::Cosine.distance(&a, &a).abs() < 1e-6);
        assert!((DistanceMetric::Cosine.distance(&a, &b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_l2_ignores_magnitude() {
        let a = emb(&[3.0, 0.0]);
        let b = emb(&[0.0, 5.0]);
        let d = DistanceMetric::EuclideanL2.distance(&a, &b);
        assert!((d - 2f32.sqrt()).abs() < 1e-5, "d = {d}");
        assert!((DistanceMetric::Euclidean.distance(&a, &b) - 34f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("Cosine".parse::<DistanceMetric>(), Ok(DistanceMetric::Cosine));
        assert_eq!("euclidean_l2".parse::<DistanceMetric>(), Ok(DistanceMetric::EuclideanL2));
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn test_pixel_rect_clamps() {
        let b = BoundingBox {
            x: -5.0, y: 10.2, width: 30.0, height: 500.0,
            confidence: 0.9, landmarks: None,
        };
        assert_eq!(b.pixel_rect(100, 100), Some((0, 10, 25, 90)));
    }

    #[test]
    fn test_pixel_rect_outside() {
        let b = BoundingBox {
            x: 120.0, y: 0.0, width: 30.0, height: 30.0,
            confidence: 0.9, landmarks: None,
        };
        assert_eq!(b.pixel_rect(100, 100), None);
    }
}
