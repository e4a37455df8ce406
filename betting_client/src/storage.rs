//! Durable key-value persistence
//!
//! The browser client kept bet secrets in origin-scoped local storage. Here
//! the same contract is a [`KeyValueStore`]: byte values under string keys,
//! surviving a process restart for the file-backed implementation.

use std::{
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),

    #[error("storage I/O failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stored value for {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("failed to encode value for {key}: {reason}")]
    Encode { key: String, reason: String },
}

/// Byte store keyed by string
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Process-local store (for testing)
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// One file per key under a directory
///
/// Writes go to a temporary sibling that is synced and then renamed over the
/// target, so a crash mid-write leaves either the old or the new value.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the store directory
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|source| StorageError::Io {
            key: root.display().to_string(),
            source,
        })?;
        debug!("File store opened at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key.len() <= 200
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let tmp = self.root.join(format!(".{}.{}.tmp", key, Uuid::new_v4().simple()));
        let io_err = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };

        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(value).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                warn!("Failed to remove temp file {}: {}", tmp.display(), e);
            }
            return Err(io_err(source));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}
