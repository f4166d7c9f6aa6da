//! Enrollment image corpus: one directory per identity, one file per image.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("invalid identity name {0:?}")]
    InvalidName(String),
    #[error("no images supplied")]
    NoImages,
    #[error("image {index} is not a JPEG or PNG")]
    UnsupportedImage { index: usize },
    #[error("corpus I/O at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CorpusError + '_ {
    move |source| CorpusError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Trim and validate an identity name for use as a corpus directory.
pub fn validate_name(name: &str) -> Result<&str, CorpusError> {
    let trimmed = name.trim();
    let bad = trimmed.is_empty()
        || trimmed.starts_with('.')
        || trimmed.contains(['/', '\\', '\0']);
    if bad {
        return Err(CorpusError::InvalidName(name.to_string()));
    }
    Ok(trimmed)
}

/// Images stored for a single identity, in file-name order.
#[derive(Debug, Clone)]
pub struct IdentityImages {
    pub name: String,
    pub images: Vec<PathBuf>,
}

/// Directory tree `<root>/<identity>/<timestamp>.<ext>`.
#[derive(Debug, Clone)]
pub struct ImageCorpus {
    root: PathBuf,
}

impl ImageCorpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Write every image under the identity's directory.
    ///
    /// File names are timestamp-based and created exclusively, so repeated
    /// enrollments never overwrite one another. All images are checked before
    /// anything is written; if a write fails, files already written by this
    /// call are removed.
    pub fn store_images(&self, name: &str, images: &[Vec<u8>]) -> Result<Vec<PathBuf>, CorpusError> {
        let name = validate_name(name)?;
        if images.is_empty() {
            return Err(CorpusError::NoImages);
        }
        let extensions = images
            .iter()
            .enumerate()
            .map(|(index, bytes)| extension_for(bytes).ok_or(CorpusError::UnsupportedImage { index }))
            .collect::<Result<Vec<_>, _>>()?;

        let dir = self.identity_dir(name);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f").to_string();
        let mut written = Vec::with_capacity(images.len());
        for (i, (bytes, ext)) in images.iter().zip(extensions).enumerate() {
            match write_exclusive(&dir, &stamp, i, ext, bytes) {
                Ok(path) => written.push(path),
                Err(e) => {
                    self.remove(&written);
                    return Err(e);
                }
            }
        }

        tracing::debug!(identity = name, count = written.len(), "stored enrollment images");
        Ok(written)
    }

    /// Remove files written by a failed enrollment. Best-effort.
    pub fn remove(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove corpus image");
            }
        }
        // Drop identity directories left empty by the removal.
        for dir in paths.iter().filter_map(|p| p.parent()) {
            let _ = fs::remove_dir(dir);
        }
    }

    /// Every identity directory with its image files, both sorted by name.
    ///
    /// A missing root is created and yields an empty corpus.
    pub fn identities(&self) -> Result<Vec<IdentityImages>, CorpusError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(io_err(&self.root)(e)),
        };

        let mut identities = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %path.display(), "skipping non-UTF-8 identity directory");
                continue;
            };
            if validate_name(name).is_err() || name != name.trim() {
                continue;
            }
            identities.push(IdentityImages {
                name: name.to_string(),
                images: list_images(&path)?,
            });
        }
        identities.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(identities)
    }
}

fn extension_for(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        image::ImageFormat::Jpeg => Some("jpg"),
        image::ImageFormat::Png => Some("png"),
        _ => None,
    }
}

fn write_exclusive(
    dir: &Path,
    stamp: &str,
    index: usize,
    ext: &str,
    bytes: &[u8],
) -> Result<PathBuf, CorpusError> {
    let mut attempt = 0u32;
    loop {
        let file_name = if attempt == 0 {
            format!("{stamp}_{index}.{ext}")
        } else {
            format!("{stamp}_{index}_{attempt}.{ext}")
        };
        let path = dir.join(file_name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let result = file.write_all(bytes).and_then(|()| file.sync_all());
                if let Err(e) = result {
                    let _ = fs::remove_file(&path);
                    return Err(io_err(&path)(e));
                }
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(io_err(&path)(e)),
        }
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, CorpusError> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}
