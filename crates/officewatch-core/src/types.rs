use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a known person. Matches the employee primary key of the attendance store.
pub type IdentityId = i64;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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
    /// Smaller of the two box sides, in pixels.
    pub fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }

    /// Box corners clamped to a `width`×`height` frame, as integer pixel coordinates
    /// `(left, top, right, bottom)`. Returns `None` when nothing of the box is inside the frame.
    pub fn clamped(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if width == 0 || height == 0 {
            return None;
        }
        let max_x = (width - 1) as f32;
        let max_y = (height - 1) as f32;
        let left = self.x.max(0.0);
        let top = self.y.max(0.0);
        let right = (self.x + self.width).min(max_x);
        let bottom = (self.y + self.height).min(max_y);
        if right <= left || bottom <= top {
            return None;
        }
        Some((left as u32, top as u32, right as u32, bottom as u32))
    }
}

/// Face embedding vector (512-dimensional for ArcFace). Immutable once computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to `other`, or `None` if the dimensions differ.
    pub fn distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }
}

/// A known person, as resolved from the identity directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub department: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Inside,
    Exited,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Inside => "inside",
            SessionStatus::Exited => "exited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inside" => Some(SessionStatus::Inside),
            "exited" => Some(SessionStatus::Exited),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry-to-exit interval for an identity on a date, as persisted by the attendance store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: i64,
    pub identity_id: IdentityId,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub date: NaiveDate,
    /// Last-known action label ("Unknown" unless something classified the person's activity).
    pub action: String,
}

impl AttendanceSession {
    /// Time spent inside, once the session is closed.
    pub fn duration(&self) -> Option<chrono::TimeDelta> {
        self.exit_time.map(|exit| exit - self.entry_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9, landmarks: None }
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = Embedding::new(vec![0.3, -0.2, 0.9]);
        assert_eq!(a.distance(&a.clone()), Some(0.0));
    }

    #[test]
    fn test_distance_known_value() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.distance(&b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.distance(&b), None);
    }

    #[test]
    fn test_clamped_inside_frame() {
        let b = bbox(10.0, 20.0, 30.0, 40.0);
        assert_eq!(b.clamped(640, 480), Some((10, 20, 40, 60)));
    }

    #[test]
    fn test_clamped_partially_outside() {
        let b = bbox(-5.0, -5.0, 20.0, 20.0);
        assert_eq!(b.clamped(100, 100), Some((0, 0, 15, 15)));
    }

    #[test]
    fn test_clamped_fully_outside() {
        let b = bbox(200.0, 200.0, 20.0, 20.0);
        assert_eq!(b.clamped(100, 100), None);
    }

    #[test]
    fn test_session_status_roundtrip_str() {
        assert_eq!(SessionStatus::parse("inside"), Some(SessionStatus::Inside));
        assert_eq!(SessionStatus::parse(SessionStatus::Exited.as_str()), Some(SessionStatus::Exited));
        assert_eq!(SessionStatus::parse("gone"), None);
    }
}
