//! Key-addressed blob storage for intermediate artifacts.
//!
//! Extraction batches, merged data, chunks, traces and agent notices all live
//! here under slash-separated keys. [`FsBlobStore`] maps keys onto a
//! directory tree; [`MemoryBlobStore`] backs tests.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

/// Errors at the storage seam.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Database error on {key}: {source}")]
    Database {
        key: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Blob storage addressed by string keys.
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous value.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Fetch the bytes stored under `key`.
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Serialize `value` as JSON and store it.
pub fn put_json<T: Serialize + ?Sized>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Json {
        key: key.to_string(),
        source,
    })?;
    store.put(key, &bytes)
}

/// Fetch and deserialize a JSON blob.
pub fn get_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> Result<T, StoreError> {
    let bytes = store.get(key)?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
        key: key.to_string(),
        source,
    })
}

/// Reject keys that could escape the store root.
fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    let path = Path::new(key);
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Blob store rooted at a directory; keys are relative paths below it.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(io_err)?;

        // Write beside the target then rename so readers never see a partial blob.
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(bytes).map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        debug!(key, bytes = bytes.len(), "Stored blob");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

/// Key for one extraction batch.
pub fn extracted_key(job_id: &str, start: usize, end: usize) -> String {
    format!("{}/extracted/{}-{}.json", job_id, start, end)
}

/// Key for the merged extraction of a whole document.
pub fn merged_key(job_id: &str) -> String {
    format!("{}/merged/merged.json", job_id)
}

/// Key for one partitioned chunk.
pub fn chunk_key(job_id: &str, chunk_type: &str, index: usize) -> String {
    format!("{}/{}-chunks/chunk-{}.json", job_id, chunk_type, index)
}

/// Key for an analysis-side trace.
pub fn analysis_trace_key(job_id: &str, name: &str) -> String {
    format!("analysis-traces/{}/{}.json", job_id, name)
}

/// Key for a detection-side trace.
pub fn detection_trace_key(job_id: &str, name: &str) -> String {
    format!("detection-traces/{}/{}.json", job_id, name)
}

/// Key for a notice written by the action agent.
pub fn agent_output_key(document_id: &str, kind: &str) -> String {
    format!("agent_outputs/{}_{}.txt", safe_identifier(document_id), kind)
}

/// Reduce an identifier to characters that are safe in a single key segment.
pub fn safe_identifier(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe = safe.trim_matches('.');
    if safe.is_empty() {
        "unknown".to_string()
    } else {
        safe.to_string()
    }
}
