use serde::{Deserialize, Serialize};

use crate::descriptor;

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
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// Face descriptor vector (512-d for the bundled ArcFace model).
///
/// Immutable once produced; all embeddings compared against each other must
/// come from the same model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
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

    /// Euclidean distance to another embedding.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        descriptor::euclidean_distance(&self.values, &other.values)
    }
}

/// One face found by a detector backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Present when the backend also extracts descriptors.
    pub embedding: Option<Embedding>,
}

impl Detection {
    pub fn confidence(&self) -> f32 {
        self.bbox.confidence
    }
}

/// A detected face that resolved to an enrolled identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub label: String,
    pub distance: f32,
    /// Threshold the distance was compared against.
    pub threshold: f32,
    pub face_index: usize,
}

impl FaceMatch {
    pub fn is_blocking(&self) -> bool {
        self.distance <= self.threshold
    }
}

/// Block/allow decision for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub blocked: bool,
    pub faces_detected: usize,
    /// Every face that resolved to a known identity, including near misses
    /// that stayed above their threshold.
    pub matches: Vec<FaceMatch>,
}

impl Verdict {
    /// The default outcome: nothing found, nothing blocked.
    pub fn allow() -> Self {
        Self {
            blocked: false,
            faces_detected: 0,
            matches: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x, y, width: w, height: h, confidence: conf, landmarks: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate_box() {
        let a = make_bbox(0.0, 0.0, 0.0, 0.0, 1.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_verdict_serializes_snake_case_fields() {
        let verdict = Verdict {
            blocked: true,
            faces_detected: 1,
            matches: vec![FaceMatch {
                label: "alice".into(),
                distance: 0.25,
                threshold: 0.6,
                face_index: 0,
            }],
        };
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["faces_detected"], 1);
        assert_eq!(json["matches"][0]["label"], "alice");
    }
}
