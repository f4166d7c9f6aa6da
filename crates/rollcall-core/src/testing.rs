//! Test doubles shared by unit tests.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::types::{BoundingBox, Embedding, FaceObservation, EMBEDDING_DIM};
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;

/// One-hot unit embedding along `axis`.
pub fn unit_embedding(axis: usize) -> Embedding {
    let mut values = vec![0.0; EMBEDDING_DIM];
    values[axis] = 1.0;
    Embedding::new(values)
}

/// Solid-color 8×8 image encoded as PNG.
pub fn png_bytes(color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(8, 8, Rgb(color));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn frame(color: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(64, 48, Rgb(color))
}

/// Analyzer keyed on the color of the top-left pixel: each registered color
/// yields the listed faces, unregistered colors yield none.
#[derive(Default)]
pub struct ColorKeyedAnalyzer {
    faces: HashMap<[u8; 3], Vec<Embedding>>,
    pub calls: usize,
    pub fail: bool,
}

impl ColorKeyedAnalyzer {
    pub fn with_face(mut self, color: [u8; 3], embedding: Embedding) -> Self {
        self.faces.entry(color).or_default().push(embedding);
        self
    }
}

impl FaceAnalyzer for ColorKeyedAnalyzer {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
        self.calls += 1;
        if self.fail {
            return Err(AnalyzerError::Unavailable("scripted failure".into()));
        }
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let key = image.get_pixel(0, 0).0;
        let faces = self.faces.get(&key).cloned().unwrap_or_default();
        Ok(faces
            .into_iter()
            .enumerate()
            .map(|(i, embedding)| {
                let score = 0.9 - i as f32 * 0.1;
                FaceObservation {
                    bbox: BoundingBox {
                        x: 4.0 + i as f32 * 20.0,
                        y: 4.0,
                        width: 16.0,
                        height: 16.0,
                        confidence: score,
                        landmarks: None,
                    },
                    embedding,
                    detection_score: score,
                }
            })
            .collect())
    }
}
