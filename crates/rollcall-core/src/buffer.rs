//! Capture buffer: scratch directory of face crops from the current session.

use crate::store::list_images;
use image::GrayImage;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const FACE_PREFIX: &str = "face_";
const FACE_EXT: &str = "jpg";

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("failed to write {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Scratch directory of `face_<seq>.jpg` crops.
///
/// Sequence numbers restart at zero after every [`clear`](Self::clear).
#[derive(Debug)]
pub struct CaptureBuffer {
    dir: PathBuf,
    next_seq: u32,
}

impl CaptureBuffer {
    pub fn open(dir: &Path) -> Result<Self, BufferError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            next_seq: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove every file and subdirectory, recreating the directory if it vanished.
    ///
    /// Returns how many entries were removed.
    pub fn clear(&mut self) -> Result<usize, BufferError> {
        let mut removed = 0usize;
        match std::fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if entry.file_type()?.is_dir() {
                        std::fs::remove_dir_all(entry.path())?;
                    } else {
                        std::fs::remove_file(entry.path())?;
                    }
                    removed += 1;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(&self.dir)?;
        self.next_seq = 0;
        tracing::info!(dir = %self.dir.display(), removed, "capture buffer cleared");
        Ok(removed)
    }

    /// Write a crop as the next `face_<seq>.jpg`.
    pub fn save(&mut self, face: &GrayImage) -> Result<PathBuf, BufferError> {
        let path = self.dir.join(format!("{FACE_PREFIX}{}.{FACE_EXT}", self.next_seq));
        face.save(&path).map_err(|source| BufferError::Encode {
            path: path.clone(),
            source,
        })?;
        self.next_seq += 1;
        tracing::debug!(path = %path.display(), "face saved");
        Ok(path)
    }

    /// Snapshot of the buffered images, in sequence order.
    pub fn images(&self) -> Result<Vec<PathBuf>, BufferError> {
        let mut images = list_images(&self.dir)?;
        images.sort_by_key(|p| (sequence_of(p).unwrap_or(u32::MAX), p.clone()));
        Ok(images)
    }

    pub fn len(&self) -> Result<usize, BufferError> {
        Ok(self.images()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, BufferError> {
        Ok(self.len()? == 0)
    }
}

fn sequence_of(path: &Path) -> Option<u32> {
    path.file_stem()?
        .to_str()?
        .strip_prefix(FACE_PREFIX)?
        .parse()
        .ok()
}
