//! Object-store access for log blobs.
//!
//! Filesystem and in-memory backends behind one trait; the capture layer
//! only ever sees keys and opaque addresses.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CaptureError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, replacing any existing blob. Returns the
    /// blob's external address.
    async fn put(&self, key: &str, data: Bytes) -> Result<String, CaptureError>;

    /// Fetch the blob at `key`, `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CaptureError>;

    /// The external address a blob at `key` would have.
    fn url(&self, key: &str) -> String;
}

/// Blobs as files under a root directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<String, CaptureError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;
        Ok(self.url(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CaptureError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("file://{}", self.path_for(key).display())
    }
}

/// Blobs in a process-local map, for tests and capture-less deployments.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<String, CaptureError> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), data);
        Ok(self.url(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CaptureError> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn url(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}
