use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

const MIN_FACE_SIDE_PX: f32 = 100.0;
const MIN_FACE_CONFIDENCE: f32 = 0.7;
const FACE_ASPECT_RANGE: (f32, f32) = (0.7, 1.3);

/// Bounding box for a detected face in source-image pixel space, with optional landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1].
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Reasons a detected face makes a poor enrollment sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    TooSmall,
    LowConfidence,
    UnusualAspect,
}

impl BoundingBox {
    /// Check the box against the minimum size, confidence and aspect ratio
    /// expected of a usable enrollment sample. Empty means the face is fine.
    pub fn quality_issues(&self) -> Vec<QualityIssue> {
        let mut issues = Vec::new();

        if self.width < MIN_FACE_SIDE_PX || self.height < MIN_FACE_SIDE_PX {
            issues.push(QualityIssue::TooSmall);
        }
        if self.confidence < MIN_FACE_CONFIDENCE {
            issues.push(QualityIssue::LowConfidence);
        }
        let aspect = if self.height > 0.0 { self.width / self.height } else { 0.0 };
        if aspect < FACE_ASPECT_RANGE.0 || aspect > FACE_ASPECT_RANGE.1 {
            issues.push(QualityIssue::UnusualAspect);
        }

        issues
    }
}

/// Face descriptor vector (512-dimensional for ArcFace).
///
/// Serialized as a bare JSON array of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two embeddings of the same length.
    ///
    /// Callers are responsible for checking that the lengths agree; extra
    /// trailing dimensions of the longer vector are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// One face found in a frame. `descriptor` is absent when the detector
/// produced no landmarks to align the face with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub descriptor: Option<Embedding>,
}

impl Detection {
    pub fn confidence(&self) -> f32 {
        self.bbox.confidence
    }
}

/// A person registered for recognition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrolledIdentity {
    pub id: String,
    pub display_name: String,
    pub short_code: String,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// One day's attendance mark for an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: i64,
    pub identity_id: String,
    pub timestamp: DateTime<Utc>,
    /// Calendar day of `timestamp` (UTC); at most one record per identity per day.
    pub date: NaiveDate,
    pub confidence: f32,
    pub method: String,
}

/// Full dump of the store, used for export and destructive import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub identities: Vec<EnrolledIdentity>,
    pub attendance: Vec<AttendanceRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x: 10.0, y: 20.0, width: w, height: h, confidence, landmarks: None }
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_quality_good_face() {
        assert!(bbox(150.0, 160.0, 0.95).quality_issues().is_empty());
    }

    #[test]
    fn test_quality_reports_every_issue() {
        let issues = bbox(40.0, 90.0, 0.5).quality_issues();
        assert_eq!(
            issues,
            vec![QualityIssue::TooSmall, QualityIssue::LowConfidence, QualityIssue::UnusualAspect]
        );
    }

    #[test]
    fn test_quality_zero_height_is_unusual() {
        let issues = bbox(120.0, 0.0, 0.9).quality_issues();
        assert!(issues.contains(&QualityIssue::UnusualAspect));
    }

    #[test]
    fn test_identity_serializes_camel_case() {
        let identity = EnrolledIdentity {
            id: "abc".into(),
            display_name: "Ana".into(),
            short_code: "ANA2024".into(),
            embedding: Embedding::new(vec![0.5, 0.25]),
            created_at: DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            last_seen_at: None,
        };
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["displayName"], "Ana");
        assert_eq!(json["shortCode"], "ANA2024");
        assert_eq!(json["embedding"], serde_json::json!([0.5, 0.25]));
        assert!(json["lastSeenAt"].is_null());
    }

    #[test]
    fn test_attendance_date_format() {
        let record = AttendanceRecord {
            id: 1,
            identity_id: "abc".into(),
            timestamp: DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            confidence: 0.8,
            method: "facial_recognition".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["date"], "2024-03-01");
        assert_eq!(json["identityId"], "abc");
    }
}
