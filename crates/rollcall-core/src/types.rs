use serde::{Deserialize, Serialize};

/// Dimension of every embedding produced by the ArcFace recognizer.
pub const EMBEDDING_DIM: usize = 512;

/// Tolerance used when checking that an embedding is unit-norm.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-3;

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
    /// Integer pixel corners `(x1, y1, x2, y2)`, truncated toward zero.
    pub fn corners(&self) -> (i32, i32, i32, i32) {
        (
            self.x as i32,
            self.y as i32,
            (self.x + self.width) as i32,
            (self.y + self.height) as i32,
        )
    }
}

/// Face embedding vector (512-dimensional, L2-normalized for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    /// Build an embedding scaled to unit L2 norm. A zero vector is kept as-is.
    pub fn normalized(values: Vec<f32>) -> Self {
        let norm = l2_norm(&values);
        let values = if norm > 0.0 {
            values.iter().map(|v| v / norm).collect()
        } else {
            values
        };
        Self::new(values)
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    pub fn is_unit_norm(&self) -> bool {
        (self.norm() - 1.0).abs() <= UNIT_NORM_TOLERANCE
    }

    /// Dot product. Equals cosine similarity when both vectors are unit-norm.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// One face found by the detector together with its embedding.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    pub detection_score: f32,
}
