//! Persisted identity store.
//!
//! Two JSON files in one directory: `names.json` (array of strings) and
//! `encodings.json` (array of float arrays). Entry `i` of one belongs to
//! entry `i` of the other.

use crate::types::{is_reserved_name, Embedding, KnownIdentity};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const NAMES_FILE: &str = "names.json";
pub const ENCODINGS_FILE: &str = "encodings.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity store file missing: {0}")]
    NotFound(PathBuf),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed identity store file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("identity store is misaligned: {names} names but {encodings} encodings")]
    LengthMismatch { names: usize, encodings: usize },
    #[error("encoding {index} has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("entry {index} uses the reserved name {name:?}")]
    ReservedName { index: usize, name: String },
    #[error("stored encodings have {actual} dimensions but the encoder produces {expected}; re-enroll the dataset")]
    EncoderMismatch { expected: usize, actual: usize },
}

/// Parallel names and encodings, in enrollment order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityStore {
    names: Vec<String>,
    encodings: Vec<Vec<f32>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one enrolled sample.
    pub fn push(&mut self, name: impl Into<String>, embedding: &Embedding) {
        self.names.push(name.into());
        self.encodings.push(embedding.values.clone());
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Length of the stored encodings, or `None` for an empty store.
    pub fn dimension(&self) -> Option<usize> {
        self.encodings.first().map(Vec::len)
    }

    /// Check that the stored encodings are comparable with an encoder that
    /// produces `expected`-dimensional embeddings. An empty store passes.
    pub fn ensure_dimension(&self, expected: usize) -> Result<(), StoreError> {
        match self.dimension() {
            Some(actual) if actual != expected => Err(StoreError::EncoderMismatch { expected, actual }),
            _ => Ok(()),
        }
    }

    /// Number of enrolled samples per name.
    pub fn sample_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for name in &self.names {
            *counts.entry(name.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Load both files from `dir`. Either file missing is an error.
    pub fn load(dir: &Path) -> Result<Self, StoreError> {
        let names: Vec<String> = read_json(&dir.join(NAMES_FILE))?;
        let encodings: Vec<Vec<f32>> = read_json(&dir.join(ENCODINGS_FILE))?;

        let store = Self { names, encodings };
        store.validate()?;

        tracing::info!(
            dir = %dir.display(),
            samples = store.len(),
            identities = store.sample_counts().len(),
            "identity store loaded"
        );
        Ok(store)
    }

    /// Write both files into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<(), StoreError> {
        self.validate()?;
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        write_json(&dir.join(ENCODINGS_FILE), &self.encodings)?;
        write_json(&dir.join(NAMES_FILE), &self.names)?;
        tracing::info!(dir = %dir.display(), samples = self.len(), "identity store saved");
        Ok(())
    }

    /// Consume the store into the matcher's gallery, preserving order.
    pub fn into_known(self) -> Vec<KnownIdentity> {
        self.names
            .into_iter()
            .zip(self.encodings)
            .map(|(name, values)| KnownIdentity {
                name,
                embedding: Embedding::new(values),
            })
            .collect()
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.names.len() != self.encodings.len() {
            return Err(StoreError::LengthMismatch {
                names: self.names.len(),
                encodings: self.encodings.len(),
            });
        }
        if let Some((index, name)) = self.names.iter().enumerate().find(|(_, n)| is_reserved_name(n)) {
            return Err(StoreError::ReservedName {
                index,
                name: name.clone(),
            });
        }
        if let Some(expected) = self.dimension() {
            if let Some((index, enc)) = self
                .encodings
                .iter()
                .enumerate()
                .find(|(_, e)| e.len() != expected)
            {
                return Err(StoreError::DimensionMismatch {
                    index,
                    expected,
                    actual: enc.len(),
                });
            }
        }
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = std::fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(path.to_path_buf())
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, bytes).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}
