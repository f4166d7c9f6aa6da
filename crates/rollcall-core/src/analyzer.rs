//! Face analysis seam: image in, detected faces with embeddings out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::FaceObservation;
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("face analyzer unavailable: {0}")]
    Unavailable(String),
}

/// Detector + embedder.
///
/// Implementations return faces in descending detection confidence, each with
/// a unit-norm embedding.
pub trait FaceAnalyzer {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError>;
}

impl<A: FaceAnalyzer + ?Sized> FaceAnalyzer for &mut A {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
        (**self).detect_and_embed(image)
    }
}

/// SCRFD detection followed by ArcFace embedding of every detected face.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path, detection_threshold: f32) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE), detection_threshold)?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }

    /// Analyzer that loads the models on first use.
    pub fn lazy(model_dir: impl Into<PathBuf>, detection_threshold: f32) -> LazyFaceAnalyzer<Self> {
        let model_dir = model_dir.into();
        LazyFaceAnalyzer::new(move || Self::load(&model_dir, detection_threshold))
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
        let faces = self.detector.detect(image)?;
        let mut observations = Vec::with_capacity(faces.len());
        for face in faces {
            if face.landmarks.is_none() {
                tracing::debug!(confidence = face.confidence, "skipping face without landmarks");
                continue;
            }
            let embedding = self.recognizer.extract(image, &face)?;
            observations.push(FaceObservation {
                detection_score: face.confidence,
                bbox: face,
                embedding,
            });
        }
        Ok(observations)
    }
}

type Loader<A> = Box<dyn FnMut() -> Result<A, AnalyzerError> + Send>;

/// Loads the wrapped analyzer on first use and keeps it for the process lifetime.
///
/// A failed load is returned to the caller; the next call tries again.
pub struct LazyFaceAnalyzer<A> {
    loader: Loader<A>,
    loaded: Option<A>,
}

impl<A: FaceAnalyzer> LazyFaceAnalyzer<A> {
    pub fn new(loader: impl FnMut() -> Result<A, AnalyzerError> + Send + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            loaded: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// The loaded analyzer, loading it now if needed.
    pub fn get(&mut self) -> Result<&mut A, AnalyzerError> {
        if self.loaded.is_none() {
            let analyzer = (self.loader)()?;
            tracing::info!("face analyzer loaded");
            self.loaded = Some(analyzer);
        }
        self.loaded
            .as_mut()
            .ok_or_else(|| AnalyzerError::Unavailable("analyzer not loaded".into()))
    }
}

impl<A: FaceAnalyzer> FaceAnalyzer for LazyFaceAnalyzer<A> {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
        self.get()?.detect_and_embed(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ColorKeyedAnalyzer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lazy_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let mut lazy = LazyFaceAnalyzer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ColorKeyedAnalyzer::default())
        });
        assert!(!lazy.is_loaded());

        let frame = RgbImage::new(4, 4);
        lazy.detect_and_embed(&frame).unwrap();
        lazy.detect_and_embed(&frame).unwrap();
        assert!(lazy.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_surfaces_load_failure() {
        let mut lazy: LazyFaceAnalyzer<ColorKeyedAnalyzer> =
            LazyFaceAnalyzer::new(|| Err(AnalyzerError::Unavailable("no models".into())));
        let err = lazy.detect_and_embed(&RgbImage::new(2, 2)).unwrap_err();
        assert!(matches!(err, AnalyzerError::Unavailable(_)));
        assert!(!lazy.is_loaded());
    }

    #[test]
    fn test_onnx_load_missing_models() {
        let dir = tempfile::tempdir().unwrap();
        let mut lazy = OnnxFaceAnalyzer::lazy(dir.path(), 0.5);
        let err = lazy.detect_and_embed(&RgbImage::new(2, 2)).unwrap_err();
        assert!(matches!(err, AnalyzerError::Detector(DetectorError::ModelNotFound(_))));
    }
}
