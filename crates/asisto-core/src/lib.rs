//! asisto-core — Face descriptor extraction and matching.
//!
//! Uses SCRFD for face detection and ArcFace for descriptors, both running
//! via ONNX Runtime, and matches descriptors against enrolled identities by
//! Euclidean distance.

pub mod alignment;
pub mod detector;
pub mod matcher;
pub mod model;
pub mod recognizer;
pub mod service;
pub mod shortcode;
pub mod types;

pub use matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_THRESHOLD};
pub use model::{FaceAnalyzer, LoadProgress, ModelLoader, ModelSource, OnnxModelLoader};
pub use recognizer::ARCFACE_EMBEDDING_DIM;
pub use service::{DetectionError, FaceService, ModelLoadError, ModelStatus};
pub use types::{
    AttendanceRecord, BoundingBox, Detection, Embedding, EnrolledIdentity, QualityIssue, Snapshot,
};
