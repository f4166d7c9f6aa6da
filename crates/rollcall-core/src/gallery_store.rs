//! Durable gallery file pair: an embedding matrix file and a label file.
//!
//! Both files carry the same generation id. Each is written to a temporary
//! sibling, synced and renamed into place, so a reader either sees a matching
//! pair or detects the mismatch and reports the gallery as corrupt.
//!
//! Writers coordinate through an advisory `flock(2)` on `.lock` in the same
//! directory, which also serializes separate processes.

use crate::gallery::{Gallery, GalleryError};
use crate::types::EMBEDDING_DIM;
use ndarray::Array2;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MATRIX_FILE: &str = "embeddings.bin";
const LABELS_FILE: &str = "labels.json";
const LOCK_FILE: &str = ".lock";
const MATRIX_MAGIC: &[u8; 4] = b"RCGM";
const MATRIX_VERSION: u32 = 1;
/// magic + version + generation + rows + dim
const MATRIX_HEADER_LEN: usize = 4 + 4 + 16 + 4 + 4;

#[derive(Serialize, Deserialize)]
struct LabelsFile {
    generation: Uuid,
    labels: Vec<String>,
}

/// Outcome of reading the persisted gallery.
#[derive(Debug)]
pub enum GalleryLoad {
    Loaded(Gallery),
    /// Neither file exists.
    Absent,
    /// Unreadable, unparsable or mutually inconsistent files.
    Corrupt(GalleryError),
}

/// Exclusive hold on a gallery directory; released on drop.
pub struct GalleryLock {
    _file: Flock<File>,
}

/// Gallery file pair rooted at a directory.
#[derive(Debug, Clone)]
pub struct GalleryStore {
    dir: PathBuf,
}

impl GalleryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn matrix_path(&self) -> PathBuf {
        self.dir.join(MATRIX_FILE)
    }

    pub fn labels_path(&self) -> PathBuf {
        self.dir.join(LABELS_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Block until this process holds the directory's exclusive lock.
    ///
    /// The lock belongs to the open file description, so it excludes other
    /// processes and other `GalleryStore` handles in this process alike.
    pub fn lock(&self) -> Result<GalleryLock, GalleryError> {
        let path = self.lock_path();
        let lock_err = |source: std::io::Error| GalleryError::Lock {
            path: path.display().to_string(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(lock_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(lock_err)?;
        let file = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| lock_err(errno.into()))?;
        tracing::trace!(path = %path.display(), "gallery lock acquired");
        Ok(GalleryLock { _file: file })
    }

    /// Read the persisted gallery. Never fails: problems are reported as
    /// [`GalleryLoad::Absent`] or [`GalleryLoad::Corrupt`].
    pub fn load(&self) -> GalleryLoad {
        let matrix_path = self.matrix_path();
        let labels_path = self.labels_path();

        let matrix_bytes = match fs::read(&matrix_path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return GalleryLoad::Corrupt(e.into()),
        };
        let labels_bytes = match fs::read(&labels_path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return GalleryLoad::Corrupt(e.into()),
        };

        let (matrix_bytes, labels_bytes) = match (matrix_bytes, labels_bytes) {
            (None, None) => return GalleryLoad::Absent,
            (Some(m), Some(l)) => (m, l),
            (Some(_), None) => {
                return GalleryLoad::Corrupt(corrupt(&labels_path, "label file missing"))
            }
            (None, Some(_)) => {
                return GalleryLoad::Corrupt(corrupt(&matrix_path, "matrix file missing"))
            }
        };

        match decode(&matrix_path, &matrix_bytes, &labels_bytes) {
            Ok(gallery) => {
                tracing::debug!(
                    rows = gallery.len(),
                    dim = gallery.dim(),
                    dir = %self.dir.display(),
                    "loaded gallery"
                );
                GalleryLoad::Loaded(gallery)
            }
            Err(e) => GalleryLoad::Corrupt(e),
        }
    }

    /// Write the gallery as a new generation of the file pair.
    pub fn persist(&self, gallery: &Gallery) -> Result<(), GalleryError> {
        fs::create_dir_all(&self.dir)?;
        let generation = Uuid::new_v4();

        let matrix_tmp = self.dir.join(format!("{MATRIX_FILE}.tmp"));
        let labels_tmp = self.dir.join(format!("{LABELS_FILE}.tmp"));

        write_synced(&matrix_tmp, &encode_matrix(gallery, generation))?;
        let labels = serde_json::to_vec(&LabelsFile {
            generation,
            labels: gallery.labels().to_vec(),
        })?;
        write_synced(&labels_tmp, &labels)?;

        fs::rename(&matrix_tmp, self.matrix_path())?;
        fs::rename(&labels_tmp, self.labels_path())?;
        sync_dir(&self.dir);

        tracing::info!(
            rows = gallery.len(),
            identities = gallery.identities().len(),
            %generation,
            "persisted gallery"
        );
        Ok(())
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> GalleryError {
    GalleryError::Corrupt {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn encode_matrix(gallery: &Gallery, generation: Uuid) -> Vec<u8> {
    let matrix = gallery.matrix();
    let mut buf = Vec::with_capacity(MATRIX_HEADER_LEN + matrix.len() * 4);
    buf.extend_from_slice(MATRIX_MAGIC);
    buf.extend_from_slice(&MATRIX_VERSION.to_le_bytes());
    buf.extend_from_slice(generation.as_bytes());
    buf.extend_from_slice(&(matrix.nrows() as u32).to_le_bytes());
    buf.extend_from_slice(&(matrix.ncols() as u32).to_le_bytes());
    for v in matrix.iter() {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn decode(matrix_path: &Path, matrix: &[u8], labels: &[u8]) -> Result<Gallery, GalleryError> {
    if matrix.len() < MATRIX_HEADER_LEN {
        return Err(corrupt(matrix_path, "truncated header"));
    }
    if &matrix[0..4] != MATRIX_MAGIC {
        return Err(corrupt(matrix_path, "bad magic"));
    }
    let version = read_u32(matrix, 4);
    if version != MATRIX_VERSION {
        return Err(corrupt(matrix_path, format!("unsupported version {version}")));
    }
    let mut generation = [0u8; 16];
    generation.copy_from_slice(&matrix[8..24]);
    let generation = Uuid::from_bytes(generation);
    let rows = read_u32(matrix, 24) as usize;
    let dim = read_u32(matrix, 28) as usize;
    if dim != EMBEDDING_DIM {
        return Err(corrupt(
            matrix_path,
            format!("embedding dimension {dim}, expected {EMBEDDING_DIM}"),
        ));
    }

    let body = &matrix[MATRIX_HEADER_LEN..];
    let expected = rows
        .checked_mul(dim)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| corrupt(matrix_path, "matrix shape overflows"))?;
    if body.len() != expected {
        return Err(corrupt(
            matrix_path,
            format!("expected {expected} data bytes for {rows}x{dim}, found {}", body.len()),
        ));
    }

    let values: Vec<f32> = body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let labels: LabelsFile = serde_json::from_slice(labels)?;
    if labels.generation != generation {
        return Err(corrupt(
            matrix_path,
            format!(
                "generation {generation} does not match label file generation {}",
                labels.generation
            ),
        ));
    }

    let matrix = Array2::from_shape_vec((rows, dim), values)
        .map_err(|e| corrupt(matrix_path, e.to_string()))?;
    Gallery::new(matrix, labels.labels)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), GalleryError> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Best-effort directory sync so the renames survive power loss.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            tracing::debug!(error = %e, dir = %dir.display(), "directory sync failed");
        }
    }
}
