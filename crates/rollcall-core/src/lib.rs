//! rollcall-core: face matching and attendance resolution.
//!
//! Detection (SCRFD) and embedding (ArcFace) run through ONNX Runtime behind
//! the [`Detector`] and [`Comparator`] seams. The reference store, capture
//! buffer, match engine and attendance resolver build on top.

pub mod alignment;
pub mod attendance;
pub mod buffer;
pub mod comparator;
pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod types;

pub use attendance::{normalize_name, resolve, resolve_group, AttendanceReport, PresentEntry};
pub use buffer::{BufferError, CaptureBuffer};
pub use comparator::{Comparator, ComparatorError, Embedder, EmbeddingComparator, FaceEmbedder};
pub use detector::{Detector, DetectorError, DetectorParams, FaceDetector};
pub use matcher::{confidence_from_distance, MatchEngine, MatchError, MatchOutcome, MatchResult};
pub use recognizer::{FaceRecognizer, RecognizerError};
pub use store::{Divergence, ReferenceStore, StoreError, Student, SUPPORTED_EXTENSIONS};
pub use types::{BoundingBox, DistanceMetric, Embedding, Verification};
