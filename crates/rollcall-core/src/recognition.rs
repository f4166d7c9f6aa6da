//! Session recognition loop state machine.
//!
//! Each frame is analyzed, every face is matched against the gallery and
//! boxed and labeled on a copy of the frame. While a session is capturing, identities
//! not yet seen in that session are sent to the ledger. The local
//! "recognized" set only saves ledger round-trips; uniqueness of attendance
//! is enforced by the ledger itself.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::annotate::Annotator;
use crate::gallery::Gallery;
use crate::ledger::{Ledger, LedgerError, MarkOutcome, SessionId};
use crate::matcher::{CosineMatcher, Matcher};
use chrono::NaiveDate;
use image::RgbImage;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("session label must not be empty")]
    EmptyLabel,
    #[error("already capturing session {0}")]
    AlreadyCapturing(SessionId),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
}

/// Session name for a label started on `date`, e.g. `"Mar 04, 2025 - CS101"`.
pub fn session_name(label: &str, date: NaiveDate) -> String {
    format!("{} - {}", date.format("%b %d, %Y"), label)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum CaptureState {
    /// Faces are recognized and displayed but never persisted.
    #[default]
    Idle,
    Capturing {
        session: SessionId,
        recognized: BTreeSet<String>,
    },
}

/// Everything produced by one pass of the loop.
#[derive(Debug)]
pub struct FrameReport {
    pub annotated: RgbImage,
    /// Matched identities in detection order; unknown faces are omitted.
    pub identities: Vec<String>,
    /// Identities newly recorded by the ledger on this frame.
    pub marked: Vec<String>,
    /// Identities whose mark failed; they are retried on a later frame.
    pub failed: Vec<(String, LedgerError)>,
}

pub struct SessionRecognizer<M = CosineMatcher> {
    matcher: M,
    threshold: f32,
    annotator: Annotator,
    state: CaptureState,
}

impl SessionRecognizer<CosineMatcher> {
    pub fn new(threshold: f32, annotator: Annotator) -> Self {
        Self::with_matcher(CosineMatcher, threshold, annotator)
    }
}

impl<M: Matcher> SessionRecognizer<M> {
    pub fn with_matcher(matcher: M, threshold: f32, annotator: Annotator) -> Self {
        Self {
            matcher,
            threshold,
            annotator,
            state: CaptureState::Idle,
        }
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.state, CaptureState::Capturing { .. })
    }

    /// Session being captured, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self.state {
            CaptureState::Capturing { session, .. } => Some(session),
            CaptureState::Idle => None,
        }
    }

    /// Identities already marked (or confirmed marked) in the active session.
    pub fn recognized(&self) -> Option<&BTreeSet<String>> {
        match &self.state {
            CaptureState::Capturing { recognized, .. } => Some(recognized),
            CaptureState::Idle => None,
        }
    }

    /// Create (or reuse) today's session for `label` and start capturing.
    pub fn start_session(&mut self, ledger: &Ledger, label: &str) -> Result<SessionId, RecognitionError> {
        let today = chrono::Local::now().date_naive();
        self.start_session_on(ledger, label, today)
    }

    pub fn start_session_on(
        &mut self,
        ledger: &Ledger,
        label: &str,
        date: NaiveDate,
    ) -> Result<SessionId, RecognitionError> {
        if let CaptureState::Capturing { session, .. } = self.state {
            return Err(RecognitionError::AlreadyCapturing(session));
        }
        let label = label.trim();
        if label.is_empty() {
            return Err(RecognitionError::EmptyLabel);
        }
        let session = ledger.create_session(&session_name(label, date))?;
        self.state = CaptureState::Capturing {
            session,
            recognized: BTreeSet::new(),
        };
        tracing::info!(%session, label, "capture started");
        Ok(session)
    }

    /// Return to idle, forgetting the session's recognized set.
    pub fn stop_session(&mut self) -> Option<SessionId> {
        match std::mem::take(&mut self.state) {
            CaptureState::Capturing { session, recognized } => {
                tracing::info!(%session, recognized = recognized.len(), "capture stopped");
                Some(session)
            }
            CaptureState::Idle => None,
        }
    }

    /// Detect, match and annotate one frame without touching the ledger.
    ///
    /// Every face is boxed; names are written above the boxes only when the
    /// annotator was built with a label font.
    pub fn process_frame(
        &self,
        analyzer: &mut dyn FaceAnalyzer,
        gallery: &Gallery,
        frame: &RgbImage,
    ) -> Result<(RgbImage, Vec<String>), RecognitionError> {
        let mut annotated = frame.clone();
        let mut identities = Vec::new();

        for face in analyzer.detect_and_embed(frame)? {
            let result = self.matcher.compare(&face.embedding, gallery, self.threshold);
            tracing::trace!(
                identity = result.name(),
                similarity = result.similarity,
                detection_score = face.detection_score,
                "face matched"
            );
            let label = if result.matched { result.label } else { None };
            self.annotator.annotate(&mut annotated, &face.bbox, label.as_deref());
            if let Some(name) = label {
                identities.push(name);
            }
        }
        Ok((annotated, identities))
    }

    /// One iteration of the loop: process the frame, then record attendance
    /// for newly recognized identities if a session is capturing.
    pub fn handle_frame(
        &mut self,
        ledger: &Ledger,
        analyzer: &mut dyn FaceAnalyzer,
        gallery: &Gallery,
        frame: &RgbImage,
    ) -> Result<FrameReport, RecognitionError> {
        let (annotated, identities) = self.process_frame(analyzer, gallery, frame)?;
        let mut marked = Vec::new();
        let mut failed = Vec::new();

        if let CaptureState::Capturing { session, recognized } = &mut self.state {
            for name in &identities {
                if recognized.contains(name) {
                    continue;
                }
                match ledger.mark(*session, name) {
                    Ok(outcome) => {
                        if outcome == MarkOutcome::Marked {
                            marked.push(name.clone());
                        }
                        recognized.insert(name.clone());
                    }
                    Err(e) => {
                        tracing::warn!(%session, identity = %name, error = %e, "attendance mark failed");
                        failed.push((name.clone(), e));
                    }
                }
            }
        }

        Ok(FrameReport {
            annotated,
            identities,
            marked,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::DisplayConfig;
    use crate::testing::{frame, unit_embedding, ColorKeyedAnalyzer};
    use crate::types::{Embedding, EMBEDDING_DIM};
    use image::Rgb;

    const ALICE: [u8; 3] = [200, 10, 10];
    const CROWD: [u8; 3] = [10, 200, 10];
    const STRANGER: [u8; 3] = [10, 10, 200];

    fn gallery() -> Gallery {
        Gallery::from_rows(
            EMBEDDING_DIM,
            vec![("alice".into(), unit_embedding(0)), ("bob".into(), unit_embedding(1))],
        )
        .unwrap()
    }

    fn analyzer() -> ColorKeyedAnalyzer {
        let mut halfway = vec![0.0; EMBEDDING_DIM];
        halfway[0] = 0.5;
        halfway[2] = 0.75f32.sqrt();
        ColorKeyedAnalyzer::default()
            .with_face(ALICE, unit_embedding(0))
            .with_face(CROWD, unit_embedding(0))
            .with_face(CROWD, unit_embedding(1))
            .with_face(CROWD, unit_embedding(3))
            .with_face(STRANGER, Embedding::new(halfway))
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 4).unwrap()
    }

    #[test]
    fn test_session_name_format() {
        assert_eq!(session_name("CS101", date()), "Mar 04, 2025 - CS101");
    }

    #[test]
    fn test_process_frame_identities_and_boxes() {
        let recognizer = SessionRecognizer::new(0.5, Annotator::default());
        let mut analyzer = analyzer();

        let (annotated, identities) = recognizer
            .process_frame(&mut analyzer, &gallery(), &frame(CROWD))
            .unwrap();
        assert_eq!(identities, vec!["alice".to_string(), "bob".to_string()]);

        let display = DisplayConfig::default();
        // Boxes at x = 4, 24, 44; the third face is unknown.
        assert_eq!(*annotated.get_pixel(4, 4), display.color_for(Some("alice")));
        assert_eq!(*annotated.get_pixel(24, 4), display.color_for(Some("bob")));
        assert_eq!(*annotated.get_pixel(44, 4), display.color_for(None));
        assert_eq!(*annotated.get_pixel(0, 0), Rgb(CROWD));
    }

    #[test]
    fn test_similarity_at_threshold_is_unknown() {
        let recognizer = SessionRecognizer::new(0.5, Annotator::default());
        let mut analyzer = analyzer();
        let (_, identities) = recognizer
            .process_frame(&mut analyzer, &gallery(), &frame(STRANGER))
            .unwrap();
        assert!(identities.is_empty());
    }

    #[test]
    fn test_idle_never_persists() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut recognizer = SessionRecognizer::new(0.5, Annotator::default());
        let mut analyzer = analyzer();

        let report = recognizer
            .handle_frame(&ledger, &mut analyzer, &gallery(), &frame(ALICE))
            .unwrap();
        assert_eq!(report.identities, vec!["alice".to_string()]);
        assert!(report.marked.is_empty());
        assert!(ledger.identities().unwrap().is_empty());
    }

    #[test]
    fn test_capturing_marks_once_per_session() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut recognizer = SessionRecognizer::new(0.5, Annotator::default());
        let mut analyzer = analyzer();
        let session = recognizer.start_session_on(&ledger, " CS101 ", date()).unwrap();
        assert_eq!(ledger.session(session).unwrap().unwrap().name, "Mar 04, 2025 - CS101");

        let first = recognizer
            .handle_frame(&ledger, &mut analyzer, &gallery(), &frame(CROWD))
            .unwrap();
        assert_eq!(first.marked, vec!["alice".to_string(), "bob".to_string()]);

        for _ in 0..3 {
            let again = recognizer
                .handle_frame(&ledger, &mut analyzer, &gallery(), &frame(ALICE))
                .unwrap();
            assert!(again.marked.is_empty());
        }
        assert_eq!(ledger.attendance_count(session, "alice").unwrap(), 1);
        assert_eq!(ledger.attendees(session).unwrap(), vec!["alice", "bob"]);
        let recognized: Vec<_> = recognizer.recognized().unwrap().iter().cloned().collect();
        assert_eq!(recognized, vec!["alice", "bob"]);
    }

    #[test]
    fn test_already_marked_joins_recognized_set() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut recognizer = SessionRecognizer::new(0.5, Annotator::default());
        let mut analyzer = analyzer();
        let session = recognizer.start_session_on(&ledger, "CS101", date()).unwrap();
        ledger.mark(session, "alice").unwrap();

        let report = recognizer
            .handle_frame(&ledger, &mut analyzer, &gallery(), &frame(ALICE))
            .unwrap();
        assert!(report.marked.is_empty());
        assert!(report.failed.is_empty());
        assert!(recognizer.recognized().unwrap().contains("alice"));
    }

    #[test]
    fn test_failed_mark_is_retried() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut recognizer = SessionRecognizer::new(0.5, Annotator::default());
        let mut analyzer = analyzer();
        recognizer.start_session_on(&ledger, "CS101", date()).unwrap();

        // A ledger that has never seen the session rejects the mark.
        let other = Ledger::open_in_memory().unwrap();
        let report = recognizer
            .handle_frame(&other, &mut analyzer, &gallery(), &frame(ALICE))
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, LedgerError::UnknownSession(_)));
        assert!(recognizer.recognized().unwrap().is_empty());

        let report = recognizer
            .handle_frame(&ledger, &mut analyzer, &gallery(), &frame(ALICE))
            .unwrap();
        assert_eq!(report.marked, vec!["alice".to_string()]);
    }

    #[test]
    fn test_start_requires_label_and_idle() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut recognizer = SessionRecognizer::new(0.5, Annotator::default());
        assert!(matches!(
            recognizer.start_session_on(&ledger, "   ", date()),
            Err(RecognitionError::EmptyLabel)
        ));
        assert!(!recognizer.is_capturing());

        let session = recognizer.start_session_on(&ledger, "CS101", date()).unwrap();
        assert!(matches!(
            recognizer.start_session_on(&ledger, "CS102", date()),
            Err(RecognitionError::AlreadyCapturing(s)) if s == session
        ));
    }

    #[test]
    fn test_stop_clears_state_and_restart_reuses_session() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut recognizer = SessionRecognizer::new(0.5, Annotator::default());
        let mut analyzer = analyzer();
        let session = recognizer.start_session_on(&ledger, "CS101", date()).unwrap();
        recognizer
            .handle_frame(&ledger, &mut analyzer, &gallery(), &frame(ALICE))
            .unwrap();

        assert_eq!(recognizer.stop_session(), Some(session));
        assert_eq!(recognizer.state(), &CaptureState::Idle);
        assert_eq!(recognizer.stop_session(), None);

        // Same label on the same day resumes the same session; the ledger
        // still refuses a second record.
        let resumed = recognizer.start_session_on(&ledger, "CS101", date()).unwrap();
        assert_eq!(resumed, session);
        assert!(recognizer.recognized().unwrap().is_empty());
        let report = recognizer
            .handle_frame(&ledger, &mut analyzer, &gallery(), &frame(ALICE))
            .unwrap();
        assert!(report.marked.is_empty());
        assert_eq!(ledger.attendance_count(session, "alice").unwrap(), 1);
    }

    #[test]
    fn test_analyzer_failure_propagates() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut recognizer = SessionRecognizer::new(0.5, Annotator::default());
        let mut analyzer = analyzer();
        analyzer.fail = true;
        let err = recognizer
            .handle_frame(&ledger, &mut analyzer, &gallery(), &frame(ALICE))
            .unwrap_err();
        assert!(matches!(err, RecognitionError::Analyzer(_)));
    }
}
