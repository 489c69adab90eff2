//! Reloadable identity-id → display-name directory.
//!
//! The map is held behind an `Arc` and replaced wholesale on reload, so a
//! reader holding a snapshot sees either the old map or the new one, never a
//! mix of both.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use crate::types::IdentityId;

pub type LabelMap = HashMap<IdentityId, String>;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid label map {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid identity id {key:?} in {path}")]
    InvalidId { path: PathBuf, key: String },
}

/// Backing definition a [`LabelDirectory`] is (re)built from.
pub trait DirectorySource: Send + Sync {
    fn load(&self) -> Result<LabelMap, DirectoryError>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

/// JSON object file mapping stringified ids to names: `{"0": "alice", "1": "bob"}`.
pub struct LabelMapFile {
    path: PathBuf,
}

impl LabelMapFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DirectorySource for LabelMapFile {
    fn load(&self) -> Result<LabelMap, DirectoryError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| DirectoryError::Io {
            path: self.path.clone(),
            source,
        })?;
        let entries: HashMap<String, String> =
            serde_json::from_str(&raw).map_err(|source| DirectoryError::Parse {
                path: self.path.clone(),
                source,
            })?;

        entries
            .into_iter()
            .map(|(key, name)| {
                let id = key.trim().parse::<u32>().map_err(|_| DirectoryError::InvalidId {
                    path: self.path.clone(),
                    key: key.clone(),
                })?;
                Ok((IdentityId(id), name))
            })
            .collect()
    }

    fn describe(&self) -> String {
        format!("label map {}", self.path.display())
    }
}

/// Dataset folder with one sub-directory per person. Identities are assigned
/// in sorted directory-name order starting at 0, matching the order the
/// gallery was enrolled in.
pub struct DatasetDirectory {
    root: PathBuf,
}

impl DatasetDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DirectorySource for DatasetDirectory {
    fn load(&self) -> Result<LabelMap, DirectoryError> {
        let io_err = |source| DirectoryError::Io {
            path: self.root.clone(),
            source,
        };

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_dir() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        Ok(names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (IdentityId(i as u32), name))
            .collect())
    }

    fn describe(&self) -> String {
        format!("dataset {}", self.root.display())
    }
}

/// Pick the source for a configured path: a directory is enumerated as a
/// dataset, anything else is read as a JSON label map.
pub fn source_for_path(path: &Path) -> Box<dyn DirectorySource> {
    if path.is_dir() {
        Box::new(DatasetDirectory::new(path))
    } else {
        Box::new(LabelMapFile::new(path))
    }
}

pub struct LabelDirectory {
    source: Box<dyn DirectorySource>,
    current: RwLock<Arc<LabelMap>>,
}

impl LabelDirectory {
    /// Create an empty directory; call [`reload`](Self::reload) to populate it.
    pub fn new(source: Box<dyn DirectorySource>) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(LabelMap::new())),
        }
    }

    /// The current mapping. Hold the returned `Arc` for the duration of one
    /// pipeline iteration.
    pub fn snapshot(&self) -> Arc<LabelMap> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Rebuild the mapping from the backing source and swap it in.
    ///
    /// On failure the previous mapping stays in place.
    pub fn reload(&self) -> Result<usize, DirectoryError> {
        let map = self.source.load()?;
        let count = map.len();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
        tracing::info!(source = %self.source.describe(), labels = count, "label directory reloaded");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
