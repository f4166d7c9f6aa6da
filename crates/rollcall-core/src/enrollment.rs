//! Enrollment pipeline and full gallery re-extraction.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::corpus::{self, CorpusError, ImageCorpus};
use crate::gallery::{Gallery, GalleryError};
use crate::gallery_store::{GalleryLoad, GalleryLock, GalleryStore};
use crate::ledger::{Ledger, LedgerError};
use crate::types::EMBEDDING_DIM;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
}

/// Result of an enrollment request that did not fail.
#[derive(Debug)]
pub enum EnrollOutcome {
    Enrolled {
        identity: String,
        images_stored: usize,
        /// Gallery rebuilt from the corpus, including the new identity.
        gallery: Gallery,
    },
    /// The identity already exists; nothing was written.
    Rejected { identity: String },
}

/// Counters from one re-extraction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub images: usize,
    pub unreadable: usize,
    pub no_face: usize,
}

impl ExtractionStats {
    pub fn embedded(&self) -> usize {
        self.images - self.unreadable - self.no_face
    }
}

/// Owns writes to the image corpus and the persisted gallery.
///
/// Enrollment and re-extraction hold the gallery directory lock for their
/// whole duration, so two rebuilds never overwrite each other's output, even
/// from separate processes.
pub struct Enroller {
    corpus: ImageCorpus,
    store: GalleryStore,
}

impl Enroller {
    pub fn new(corpus: ImageCorpus, store: GalleryStore) -> Self {
        Self { corpus, store }
    }

    pub fn corpus(&self) -> &ImageCorpus {
        &self.corpus
    }

    pub fn store(&self) -> &GalleryStore {
        &self.store
    }

    fn lock(&self) -> Result<GalleryLock, EnrollError> {
        Ok(self.store.lock()?)
    }

    /// Enroll a new identity from one or more images.
    ///
    /// Rejects names that already exist in the ledger before touching the
    /// corpus or gallery. Otherwise stores the images, rebuilds and persists
    /// the gallery, then commits the identity. If storing, rebuilding or the
    /// commit fails, the identity is rolled back and the stored images removed;
    /// after a failed commit the gallery is rebuilt without them.
    pub fn enroll(
        &self,
        ledger: &Ledger,
        analyzer: &mut dyn FaceAnalyzer,
        name: &str,
        images: &[Vec<u8>],
    ) -> Result<EnrollOutcome, EnrollError> {
        let name = corpus::validate_name(name)?;
        if images.is_empty() {
            return Err(CorpusError::NoImages.into());
        }
        let _guard = self.lock()?;

        // Set only once the new gallery has been persisted.
        let mut persisted = Vec::new();
        let registered = ledger.register_identity(name, || -> Result<_, EnrollError> {
            let written = self.corpus.store_images(name, images)?;
            match self.rebuild(&mut *analyzer) {
                Ok((gallery, _)) => {
                    persisted = written;
                    Ok((persisted.len(), gallery))
                }
                Err(e) => {
                    self.corpus.remove(&written);
                    Err(e)
                }
            }
        });
        let enrolled = match registered {
            Ok(enrolled) => enrolled,
            Err(e) => {
                if !persisted.is_empty() {
                    tracing::warn!(identity = name, error = %e, "identity commit failed; reverting enrollment");
                    self.corpus.remove(&persisted);
                    if let Err(revert) = self.rebuild(analyzer) {
                        tracing::error!(
                            identity = name,
                            error = %revert,
                            "gallery still lists the reverted identity; run reindex"
                        );
                    }
                }
                return Err(e);
            }
        };

        match enrolled {
            Some((images_stored, gallery)) => {
                let rows = gallery.labels().iter().filter(|l| *l == name).count();
                if rows == 0 {
                    tracing::warn!(identity = name, images_stored, "no face found in any enrollment image");
                }
                tracing::info!(identity = name, images_stored, rows, "identity enrolled");
                Ok(EnrollOutcome::Enrolled {
                    identity: name.to_string(),
                    images_stored,
                    gallery,
                })
            }
            None => {
                tracing::info!(identity = name, "enrollment rejected: identity exists");
                Ok(EnrollOutcome::Rejected {
                    identity: name.to_string(),
                })
            }
        }
    }

    /// Rebuild the gallery from every image in the corpus and persist it.
    pub fn extract_all(&self, analyzer: &mut dyn FaceAnalyzer) -> Result<Gallery, EnrollError> {
        let _guard = self.lock()?;
        self.rebuild(analyzer).map(|(gallery, _)| gallery)
    }

    /// The persisted gallery, re-extracted from the corpus when it is missing
    /// or unreadable.
    pub fn load_embeddings(&self, analyzer: &mut dyn FaceAnalyzer) -> Result<Gallery, EnrollError> {
        let _guard = self.lock()?;
        match self.store.load() {
            GalleryLoad::Loaded(gallery) => Ok(gallery),
            GalleryLoad::Absent => {
                tracing::info!(dir = %self.store.dir().display(), "no persisted gallery; extracting from corpus");
                self.rebuild(analyzer).map(|(gallery, _)| gallery)
            }
            GalleryLoad::Corrupt(e) => {
                tracing::warn!(error = %e, "persisted gallery unusable; extracting from corpus");
                self.rebuild(analyzer).map(|(gallery, _)| gallery)
            }
        }
    }

    /// Caller must hold the gallery lock.
    fn rebuild(&self, analyzer: &mut dyn FaceAnalyzer) -> Result<(Gallery, ExtractionStats), EnrollError> {
        let mut stats = ExtractionStats::default();
        let mut rows = Vec::new();

        for identity in self.corpus.identities()? {
            for path in &identity.images {
                stats.images += 1;
                let image = match image::open(path) {
                    Ok(img) => img.to_rgb8(),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image");
                        stats.unreadable += 1;
                        continue;
                    }
                };
                // One face per enrollment image: keep the most confident.
                let Some(face) = analyzer.detect_and_embed(&image)?.into_iter().next() else {
                    tracing::debug!(path = %path.display(), "no face detected");
                    stats.no_face += 1;
                    continue;
                };
                rows.push((identity.name.clone(), face.embedding));
            }
        }

        let gallery = Gallery::from_rows(EMBEDDING_DIM, rows)?;
        self.store.persist(&gallery)?;
        tracing::info!(
            images = stats.images,
            embedded = stats.embedded(),
            unreadable = stats.unreadable,
            no_face = stats.no_face,
            identities = gallery.identities().len(),
            "gallery rebuilt"
        );
        Ok((gallery, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{png_bytes, unit_embedding, ColorKeyedAnalyzer};
    use crate::types::{Embedding, FaceObservation};
    use image::RgbImage;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    const RED: [u8; 3] = [200, 10, 10];
    const BLUE: [u8; 3] = [10, 10, 200];
    const GRAY: [u8; 3] = [90, 90, 90];

    fn enroller_in(dir: &Path) -> Enroller {
        Enroller::new(
            ImageCorpus::new(dir.join("dataset")),
            GalleryStore::new(dir.join("gallery")),
        )
    }

    fn setup() -> (TempDir, Enroller, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let enroller = enroller_in(dir.path());
        (dir, enroller, Ledger::open_in_memory().unwrap())
    }

    /// Pauses inside its first call until released.
    struct GatedAnalyzer {
        inner: ColorKeyedAnalyzer,
        entered: Option<mpsc::Sender<()>>,
        release: mpsc::Receiver<()>,
    }

    impl FaceAnalyzer for GatedAnalyzer {
        fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
            if let Some(entered) = self.entered.take() {
                entered.send(()).unwrap();
                self.release.recv().unwrap();
            }
            self.inner.detect_and_embed(image)
        }
    }

    fn analyzer() -> ColorKeyedAnalyzer {
        ColorKeyedAnalyzer::default()
            .with_face(RED, unit_embedding(0))
            .with_face(BLUE, unit_embedding(1))
            .with_face(BLUE, unit_embedding(2))
    }

    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut files = BTreeMap::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else { continue };
            for entry in entries {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.insert(path.clone(), fs::read(&path).unwrap());
                }
            }
        }
        files
    }

    #[test]
    fn test_enroll_new_identity() {
        let (_dir, enroller, ledger) = setup();
        let mut analyzer = analyzer();

        let outcome = enroller
            .enroll(&ledger, &mut analyzer, " alice ", &[png_bytes(RED), png_bytes(RED)])
            .unwrap();
        let EnrollOutcome::Enrolled { identity, images_stored, gallery } = outcome else {
            panic!("expected enrollment");
        };
        assert_eq!(identity, "alice");
        assert_eq!(images_stored, 2);
        assert_eq!(gallery.labels(), &["alice".to_string(), "alice".to_string()]);
        assert!(ledger.identity_exists("alice").unwrap());

        match enroller.store().load() {
            GalleryLoad::Loaded(persisted) => assert!(persisted.approx_eq(&gallery, 1e-6)),
            other => panic!("expected persisted gallery, got {other:?}"),
        }
    }

    #[test]
    fn test_enroll_existing_identity_is_rejected_without_changes() {
        let (dir, enroller, ledger) = setup();
        let mut analyzer = analyzer();
        enroller.enroll(&ledger, &mut analyzer, "alice", &[png_bytes(RED)]).unwrap();

        let before = snapshot(dir.path());
        let calls_before = analyzer.calls;

        let outcome = enroller.enroll(&ledger, &mut analyzer, "alice", &[png_bytes(BLUE)]).unwrap();
        assert!(matches!(outcome, EnrollOutcome::Rejected { ref identity } if identity == "alice"));
        assert_eq!(analyzer.calls, calls_before, "re-extraction must not run");
        assert_eq!(snapshot(dir.path()), before);
    }

    #[test]
    fn test_enroll_rejects_identity_created_by_attendance() {
        let (_dir, enroller, ledger) = setup();
        let session = ledger.create_session("s").unwrap();
        ledger.mark(session, "bob").unwrap();

        let mut analyzer = analyzer();
        let outcome = enroller.enroll(&ledger, &mut analyzer, "bob", &[png_bytes(BLUE)]).unwrap();
        assert!(matches!(outcome, EnrollOutcome::Rejected { .. }));
        assert!(!enroller.corpus().identity_dir("bob").exists());
    }

    #[test]
    fn test_rebuild_covers_whole_corpus() {
        let (_dir, enroller, ledger) = setup();
        let mut analyzer = analyzer();
        enroller.enroll(&ledger, &mut analyzer, "bob", &[png_bytes(BLUE)]).unwrap();
        let outcome = enroller.enroll(&ledger, &mut analyzer, "alice", &[png_bytes(RED)]).unwrap();

        let EnrollOutcome::Enrolled { gallery, .. } = outcome else {
            panic!("expected enrollment");
        };
        // Identities in name order; first (most confident) face per image.
        assert_eq!(gallery.labels(), &["alice".to_string(), "bob".to_string()]);
        assert_eq!(gallery.row(1).unwrap()[1], 1.0);
    }

    #[test]
    fn test_rebuild_skips_faceless_and_unreadable_images() {
        let (_dir, enroller, ledger) = setup();
        let mut analyzer = analyzer();
        enroller
            .enroll(&ledger, &mut analyzer, "carol", &[png_bytes(GRAY), png_bytes(RED)])
            .unwrap();
        // Corrupt file with an image extension.
        fs::write(enroller.corpus().identity_dir("carol").join("broken.jpg"), b"garbage").unwrap();

        let gallery = enroller.extract_all(&mut analyzer).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.label(0), Some("carol"));
    }

    #[test]
    fn test_enroll_analyzer_failure_rolls_back() {
        let (_dir, enroller, ledger) = setup();
        let mut analyzer = analyzer();
        analyzer.fail = true;

        let err = enroller.enroll(&ledger, &mut analyzer, "dave", &[png_bytes(RED)]).unwrap_err();
        assert!(matches!(err, EnrollError::Analyzer(_)));
        assert!(!ledger.identity_exists("dave").unwrap());
        assert!(!enroller.corpus().identity_dir("dave").exists());

        analyzer.fail = false;
        let outcome = enroller.enroll(&ledger, &mut analyzer, "dave", &[png_bytes(RED)]).unwrap();
        assert!(matches!(outcome, EnrollOutcome::Enrolled { .. }));
    }

    #[test]
    fn test_enroll_validates_input() {
        let (_dir, enroller, ledger) = setup();
        let mut analyzer = analyzer();
        assert!(matches!(
            enroller.enroll(&ledger, &mut analyzer, "  ", &[png_bytes(RED)]),
            Err(EnrollError::Corpus(CorpusError::InvalidName(_)))
        ));
        assert!(matches!(
            enroller.enroll(&ledger, &mut analyzer, "erin", &[]),
            Err(EnrollError::Corpus(CorpusError::NoImages))
        ));
        assert!(matches!(
            enroller.enroll(&ledger, &mut analyzer, "erin", &[b"text".to_vec()]),
            Err(EnrollError::Corpus(CorpusError::UnsupportedImage { index: 0 }))
        ));
        assert!(!ledger.identity_exists("erin").unwrap());
    }

    #[test]
    fn test_load_embeddings_recovers_from_absent_and_corrupt() {
        let (_dir, enroller, ledger) = setup();
        let mut analyzer = analyzer();
        enroller.enroll(&ledger, &mut analyzer, "alice", &[png_bytes(RED)]).unwrap();

        fs::remove_file(enroller.store().matrix_path()).unwrap();
        fs::remove_file(enroller.store().labels_path()).unwrap();
        let calls = analyzer.calls;
        let gallery = enroller.load_embeddings(&mut analyzer).unwrap();
        assert_eq!(gallery.labels(), &["alice".to_string()]);
        assert!(analyzer.calls > calls);

        fs::write(enroller.store().labels_path(), b"{").unwrap();
        let gallery = enroller.load_embeddings(&mut analyzer).unwrap();
        assert_eq!(gallery.labels(), &["alice".to_string()]);

        let calls = analyzer.calls;
        let gallery = enroller.load_embeddings(&mut analyzer).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(analyzer.calls, calls, "intact gallery must not trigger extraction");
    }

    #[test]
    fn test_load_embeddings_empty_corpus() {
        let (_dir, enroller, _ledger) = setup();
        let mut analyzer = analyzer();
        let gallery = enroller.load_embeddings(&mut analyzer).unwrap();
        assert!(gallery.is_empty());
        assert!(matches!(enroller.store().load(), GalleryLoad::Loaded(_)));
    }

    #[test]
    fn test_enrollers_sharing_directories_serialize_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let reindexer = enroller_in(dir.path());
        let enroller = enroller_in(dir.path());
        reindexer.corpus().store_images("bob", &[png_bytes(BLUE)]).unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let mut gated = GatedAnalyzer {
            inner: analyzer(),
            entered: Some(entered_tx),
            release: release_rx,
        };
        // Paused mid-rebuild after listing a corpus that only holds bob.
        let reindex = std::thread::spawn(move || reindexer.extract_all(&mut gated).unwrap());
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let ledger = Ledger::open_in_memory().unwrap();
        let enroll = std::thread::spawn(move || {
            let outcome = enroller
                .enroll(&ledger, &mut analyzer(), "alice", &[png_bytes(RED)])
                .unwrap();
            (enroller, outcome)
        });
        std::thread::sleep(Duration::from_millis(200));
        assert!(!enroll.is_finished(), "enrollment must wait for the running rebuild");

        release_tx.send(()).unwrap();
        let reindexed = reindex.join().unwrap();
        assert_eq!(reindexed.labels(), &["bob".to_string()]);

        let (enroller, outcome) = enroll.join().unwrap();
        let EnrollOutcome::Enrolled { gallery, .. } = outcome else {
            panic!("expected enrollment");
        };
        assert_eq!(gallery.labels(), &["alice".to_string(), "bob".to_string()]);
        match enroller.store().load() {
            GalleryLoad::Loaded(persisted) => {
                assert_eq!(persisted.labels(), &["alice".to_string(), "bob".to_string()]);
            }
            other => panic!("expected persisted gallery, got {other:?}"),
        }
    }

    #[test]
    fn test_load_embeddings_replaces_foreign_dimension_gallery() {
        let (_dir, enroller, ledger) = setup();
        let mut analyzer = analyzer();
        enroller.enroll(&ledger, &mut analyzer, "alice", &[png_bytes(RED)]).unwrap();

        let small = Gallery::from_rows(
            3,
            vec![("alice".into(), Embedding::normalized(vec![1.0, 0.0, 0.0]))],
        )
        .unwrap();
        enroller.store().persist(&small).unwrap();

        let gallery = enroller.load_embeddings(&mut analyzer).unwrap();
        assert_eq!(gallery.dim(), EMBEDDING_DIM);
        assert_eq!(gallery.labels(), &["alice".to_string()]);
        assert!(matches!(enroller.store().load(), GalleryLoad::Loaded(ref g) if g.dim() == EMBEDDING_DIM));
    }

    #[test]
    fn test_enroll_commit_failure_reverts_images_and_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("attendance.db");
        let ledger = Ledger::open(&db).unwrap();
        // A deferred foreign-key violation lets the insert succeed and fails
        // only at COMMIT, after the gallery has been persisted.
        rusqlite::Connection::open(&db)
            .unwrap()
            .execute_batch(
                "CREATE TABLE commit_gate (
                     identity_id INTEGER REFERENCES identities(id) DEFERRABLE INITIALLY DEFERRED
                 );
                 CREATE TRIGGER gate_mallory AFTER INSERT ON identities
                 WHEN NEW.name = 'mallory'
                 BEGIN
                     INSERT INTO commit_gate (identity_id) VALUES (-1);
                 END;",
            )
            .unwrap();

        let enroller = enroller_in(dir.path());
        let mut analyzer = analyzer();
        enroller.enroll(&ledger, &mut analyzer, "alice", &[png_bytes(RED)]).unwrap();

        let err = enroller
            .enroll(&ledger, &mut analyzer, "mallory", &[png_bytes(BLUE)])
            .unwrap_err();
        assert!(matches!(err, EnrollError::Ledger(LedgerError::Sqlite(_))), "{err}");
        assert!(!ledger.identity_exists("mallory").unwrap());
        assert!(!enroller.corpus().identity_dir("mallory").exists());
        match enroller.store().load() {
            GalleryLoad::Loaded(gallery) => assert_eq!(gallery.labels(), &["alice".to_string()]),
            other => panic!("expected persisted gallery, got {other:?}"),
        }
    }
}
