//! In-memory gallery: a dense embedding matrix with a parallel label list.

use crate::types::{Embedding, EMBEDDING_DIM};
use ndarray::{Array2, ArrayView1, Axis};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery has {rows} matrix rows but {labels} labels")]
    RowCountMismatch { rows: usize, labels: usize },
    #[error("embedding for {label:?} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
    #[error("corrupt gallery file {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("cannot lock gallery directory {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("gallery labels: {0}")]
    Json(#[from] serde_json::Error),
}

/// Known embeddings and their identity labels.
///
/// Row `i` of the matrix belongs to `labels[i]`. The two are only ever
/// constructed together, so `labels.len() == matrix.nrows()` always holds.
#[derive(Debug, Clone)]
pub struct Gallery {
    matrix: Array2<f32>,
    labels: Vec<String>,
}

impl Gallery {
    /// An empty gallery with the standard ArcFace dimension.
    pub fn empty() -> Self {
        Self::empty_with_dim(EMBEDDING_DIM)
    }

    pub fn empty_with_dim(dim: usize) -> Self {
        Self {
            matrix: Array2::zeros((0, dim)),
            labels: Vec::new(),
        }
    }

    pub fn new(matrix: Array2<f32>, labels: Vec<String>) -> Result<Self, GalleryError> {
        if matrix.nrows() != labels.len() {
            return Err(GalleryError::RowCountMismatch {
                rows: matrix.nrows(),
                labels: labels.len(),
            });
        }
        Ok(Self { matrix, labels })
    }

    /// Stack `(label, embedding)` rows into a gallery of dimension `dim`.
    pub fn from_rows(dim: usize, rows: Vec<(String, Embedding)>) -> Result<Self, GalleryError> {
        let mut data = Vec::with_capacity(rows.len() * dim);
        let mut labels = Vec::with_capacity(rows.len());
        for (label, embedding) in rows {
            if embedding.dim() != dim {
                return Err(GalleryError::DimensionMismatch {
                    label,
                    expected: dim,
                    actual: embedding.dim(),
                });
            }
            data.extend_from_slice(&embedding.values);
            labels.push(label);
        }
        let matrix = Array2::from_shape_vec((labels.len(), dim), data)
            .map_err(|e| GalleryError::Corrupt {
                path: "<memory>".into(),
                reason: e.to_string(),
            })?;
        Ok(Self { matrix, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn matrix(&self) -> &Array2<f32> {
        &self.matrix
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label(&self, row: usize) -> Option<&str> {
        self.labels.get(row).map(String::as_str)
    }

    pub fn row(&self, row: usize) -> Option<ArrayView1<'_, f32>> {
        (row < self.len()).then(|| self.matrix.index_axis(Axis(0), row))
    }

    /// Distinct identity names present in the gallery.
    pub fn identities(&self) -> BTreeSet<&str> {
        self.labels.iter().map(String::as_str).collect()
    }

    /// Equal labels and element-wise equal matrices within `tolerance`.
    pub fn approx_eq(&self, other: &Gallery, tolerance: f32) -> bool {
        self.labels == other.labels
            && self.matrix.dim() == other.matrix.dim()
            && self
                .matrix
                .iter()
                .zip(other.matrix.iter())
                .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}
