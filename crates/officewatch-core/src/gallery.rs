//! Encoding gallery: the set of known (identity, embedding) pairs used for matching.
//!
//! The gallery artifact is produced offline by the trainer and is read-only to the
//! recognition pipeline. Whatever shape the artifact has on disk, the loader adapts it
//! into the single [`Gallery`] value type.

use crate::types::{Embedding, IdentityId};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery artifact not found: {0}")]
    NotFound(String),
    #[error("failed to read gallery artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed gallery artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("corrupt gallery artifact: {0}")]
    Corrupt(String),
    #[error("gallery artifact does not fit the encoder: {0}")]
    Incompatible(String),
}

/// Shape of the embeddings the live encoder produces.
///
/// A gallery built for a different model never matches anything, so loading one is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderProfile {
    pub dim: usize,
    pub model_version: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity_id: IdentityId,
    pub embedding: Embedding,
}

/// Ordered collection of gallery entries. One identity may own several entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    model_version: Option<String>,
}

impl Gallery {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a gallery, checking that every embedding has the same dimension.
    pub fn new(
        entries: Vec<GalleryEntry>,
        model_version: Option<String>,
    ) -> Result<Self, GalleryError> {
        if let Some(first) = entries.first() {
            let dim = first.embedding.dim();
            if dim == 0 {
                return Err(GalleryError::Corrupt("zero-length embedding".into()));
            }
            if let Some((idx, bad)) = entries
                .iter()
                .enumerate()
                .find(|(_, e)| e.embedding.dim() != dim)
            {
                return Err(GalleryError::Corrupt(format!(
                    "entry {idx} has {} dimensions, expected {dim}",
                    bad.embedding.dim()
                )));
            }
        }
        Ok(Self {
            entries,
            model_version,
        })
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding dimension, or `None` for an empty gallery.
    pub fn dim(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dim())
    }

    /// Number of distinct identities.
    pub fn identity_count(&self) -> usize {
        let mut ids: Vec<IdentityId> = self.entries.iter().map(|e| e.identity_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    /// Check that the gallery can be compared against `profile` embeddings.
    ///
    /// An empty gallery fits any encoder. A gallery without a model version (the legacy
    /// parallel-array shape) is checked by dimension only.
    pub fn check_compatible(&self, profile: &EncoderProfile) -> Result<(), GalleryError> {
        if let Some(dim) = self.dim() {
            if dim != profile.dim {
                return Err(GalleryError::Incompatible(format!(
                    "embeddings have {dim} dimensions, encoder produces {}",
                    profile.dim
                )));
            }
        }
        match self.model_version() {
            Some(version) if version != profile.model_version => Err(GalleryError::Incompatible(
                format!("built with model {version}, encoder is {}", profile.model_version),
            )),
            _ => Ok(()),
        }
    }
}

/// On-disk shapes the trainer may hand back.
#[derive(Deserialize)]
#[serde(untagged)]
enum GalleryArtifact {
    Entries {
        #[serde(default)]
        model_version: Option<String>,
        entries: Vec<ArtifactEntry>,
    },
    /// Parallel arrays: `encodings[i]` belongs to `labels[i]`.
    Parallel {
        encodings: Vec<Vec<f32>>,
        labels: Vec<IdentityId>,
    },
}

#[derive(Deserialize)]
struct ArtifactEntry {
    identity_id: IdentityId,
    embedding: Vec<f32>,
}

impl GalleryArtifact {
    fn into_gallery(self) -> Result<Gallery, GalleryError> {
        match self {
            GalleryArtifact::Entries {
                model_version,
                entries,
            } => {
                let entries = entries
                    .into_iter()
                    .map(|e| GalleryEntry {
                        identity_id: e.identity_id,
                        embedding: Embedding {
                            values: e.embedding,
                            model_version: model_version.clone(),
                        },
                    })
                    .collect();
                Gallery::new(entries, model_version)
            }
            GalleryArtifact::Parallel { encodings, labels } => {
                if encodings.len() != labels.len() {
                    return Err(GalleryError::Corrupt(format!(
                        "{} encodings but {} labels",
                        encodings.len(),
                        labels.len()
                    )));
                }
                let entries = encodings
                    .into_iter()
                    .zip(labels)
                    .map(|(values, identity_id)| GalleryEntry {
                        identity_id,
                        embedding: Embedding::new(values),
                    })
                    .collect();
                Gallery::new(entries, None)
            }
        }
    }
}

/// Parse a gallery from the JSON artifact text.
pub fn parse_gallery(json: &str) -> Result<Gallery, GalleryError> {
    let artifact: GalleryArtifact = serde_json::from_str(json)?;
    artifact.into_gallery()
}

/// Load the gallery artifact from disk, rejecting one built for a different encoder.
pub fn load_gallery(path: &Path, profile: &EncoderProfile) -> Result<Gallery, GalleryError> {
    if !path.exists() {
        return Err(GalleryError::NotFound(path.display().to_string()));
    }
    let text = std::fs::read_to_string(path)?;
    let gallery = parse_gallery(&text)?;
    gallery.check_compatible(profile)?;
    tracing::info!(
        path = %path.display(),
        entries = gallery.len(),
        identities = gallery.identity_count(),
        dim = ?gallery.dim(),
        model = ?gallery.model_version(),
        "loaded encoding gallery"
    );
    Ok(gallery)
}

/// Load the gallery, degrading to an empty one when the artifact is missing or unreadable.
///
/// With an empty gallery every detection is reported as no-match until a reload succeeds.
pub fn load_gallery_or_empty(path: &Path, profile: &EncoderProfile) -> Gallery {
    match load_gallery(path, profile) {
        Ok(g) => g,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "gallery unavailable; starting with empty gallery");
            Gallery::empty()
        }
    }
}
