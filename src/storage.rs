//! Abstract artifact storage consumed by stages.
//!
//! Stages that produce binary output (synthesized audio, mixed episodes)
//! write it through [`ArtifactStore`] and put only the returned
//! [`ArtifactRef`] into shared state. The orchestration core never touches
//! artifact bytes after the write returns.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Reference to a stored artifact: the key it was written under plus size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub bytes: u64,
}

/// Artifact storage failures.
#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("artifact write failed for key `{key}`: {source}")]
    #[diagnostic(code(castflow::storage::write))]
    Write {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact not found: {key}")]
    #[diagnostic(code(castflow::storage::not_found))]
    NotFound { key: String },
}

/// Write-bytes / read-bytes interface the core hands to stages.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Writes `data` under `key`, returning a reference for shared state.
    async fn put(&self, key: &str, data: &[u8]) -> Result<ArtifactRef, StorageError>;

    /// Reads an artifact back; diagnostics and tests only.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// Volatile store for tests and embedded use.
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    entries: Arc<Mutex<FxHashMap<String, Vec<u8>>>>,
}

impl MemoryArtifactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of artifacts stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<ArtifactRef, StorageError> {
        self.entries.lock().insert(key.to_string(), data.to_vec());
        Ok(ArtifactRef {
            key: key.to_string(),
            bytes: data.len() as u64,
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }
}

/// Filesystem store rooted at a content directory.
///
/// Keys map to paths under the root; parent directories are created on
/// demand so stage keys like `audio/ep_42.mp3` work without setup.
#[derive(Clone, Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<ArtifactRef, StorageError> {
        let path = self.path_for(key);
        let wrap = |source| StorageError::Write {
            key: key.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(wrap)?;
        }
        tokio::fs::write(&path, data).await.map_err(wrap)?;
        Ok(ArtifactRef {
            key: key.to_string(),
            bytes: data.len() as u64,
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(source) => Err(StorageError::Write {
                key: key.to_string(),
                source,
            }),
        }
    }
}
