//! rollcall-core — face-recognition attendance engine.
//!
//! Faces are detected with SCRFD and embedded with ArcFace (ONNX Runtime,
//! CPU). Enrollment images live in an on-disk corpus from which the gallery
//! of known embeddings is rebuilt; recognized faces are recorded once per
//! session in a SQLite attendance ledger.

pub mod alignment;
pub mod analyzer;
pub mod annotate;
pub mod corpus;
pub mod detector;
pub mod enrollment;
pub mod gallery;
pub mod gallery_store;
pub mod ledger;
pub mod matcher;
pub mod recognition;
pub mod recognizer;
pub mod types;

#[cfg(test)]
mod testing;

pub use analyzer::{AnalyzerError, FaceAnalyzer, LazyFaceAnalyzer, OnnxFaceAnalyzer};
pub use annotate::{Annotator, DisplayConfig};
pub use corpus::ImageCorpus;
pub use enrollment::{EnrollError, EnrollOutcome, Enroller};
pub use gallery::Gallery;
pub use gallery_store::{GalleryLoad, GalleryStore};
pub use ledger::{AttendanceReport, Ledger, LedgerError, MarkOutcome, SessionId};
pub use matcher::{CosineMatcher, MatchResult, Matcher};
pub use recognition::{FrameReport, RecognitionError, SessionRecognizer};
pub use types::{BoundingBox, Embedding, FaceObservation};
