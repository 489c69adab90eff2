//! Pre-enrolled reference embeddings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use vigil_core::IdentityId;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read gallery {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid gallery {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("embedding for identity {identity} has {got} dimensions, expected {expected}")]
    Dimension {
        identity: IdentityId,
        got: usize,
        expected: usize,
    },
}

/// One stored embedding. An identity may have several.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity: IdentityId,
    pub embedding: Vec<f32>,
}

/// L2-normalized reference embeddings, all of one dimension.
#[derive(Debug, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        let expected = entries.first().map_or(0, |e| e.embedding.len());
        let entries = entries
            .into_iter()
            .map(|entry| {
                if entry.embedding.len() != expected {
                    return Err(GalleryError::Dimension {
                        identity: entry.identity,
                        got: entry.embedding.len(),
                        expected,
                    });
                }
                Ok(GalleryEntry {
                    identity: entry.identity,
                    embedding: normalize(entry.embedding),
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { entries })
    }

    /// Read a JSON array of `{"identity": 0, "embedding": [...]}` objects.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| GalleryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<GalleryEntry> =
            serde_json::from_str(&raw).map_err(|source| GalleryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let gallery = Self::new(entries)?;
        tracing::info!(path = %path.display(), embeddings = gallery.len(), "loaded face gallery");
        Ok(gallery)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Closest identity to `query` and its distance, `(1 - cosine) * 100`,
    /// so 0 is identical and 100 is orthogonal.
    pub fn best_match(&self, query: &[f32]) -> Option<(IdentityId, f32)> {
        let query = normalize(query.to_vec());
        self.entries
            .iter()
            .filter(|entry| entry.embedding.len() == query.len())
            .map(|entry| {
                let cosine: f32 = entry.embedding.iter().zip(&query).map(|(a, b)| a * b).sum();
                (entry.identity, (1.0 - cosine) * 100.0)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

pub(crate) fn normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}
