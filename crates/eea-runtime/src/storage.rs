//! Persistence for guest storage blobs and the last accepted artifact

use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::types::{EeaError, EeaResult};

/// Read/write contract for the guest's opaque storage blob
///
/// Called synchronously from inside `eea_storage_read`/`eea_storage_save`.
pub trait BlobStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet
    fn load(&self) -> EeaResult<Option<Vec<u8>>>;

    fn save(&self, blob: &[u8]) -> EeaResult<()>;
}

/// Blob kept in a single file
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    path: PathBuf,
}

impl FileBlobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlobStore for FileBlobStore {
    fn load(&self) -> EeaResult<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EeaError::Persistence(e)),
        }
    }

    fn save(&self, blob: &[u8]) -> EeaResult<()> {
        write_file(&self.path, blob)?;
        debug!(path = %self.path.display(), bytes = blob.len(), "Storage saved");
        Ok(())
    }
}

/// In-process blob, used when no storage path is configured and in tests
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: impl Into<Vec<u8>>) -> Self {
        Self {
            blob: Mutex::new(Some(blob.into())),
        }
    }

    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.blob.lock().clone()
    }
}

impl BlobStore for MemoryBlobStore {
    fn load(&self) -> EeaResult<Option<Vec<u8>>> {
        Ok(self.blob.lock().clone())
    }

    fn save(&self, blob: &[u8]) -> EeaResult<()> {
        *self.blob.lock() = Some(blob.to_vec());
        Ok(())
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> EeaResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(EeaError::Persistence)?;
    }

    // Write next to the target and rename so a crash never leaves half a file
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(EeaError::Persistence)?;
    std::fs::rename(&tmp, path).map_err(EeaError::Persistence)
}

/// Location of the last successfully loaded artifact
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    path: PathBuf,
}

impl ArtifactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw bytes of the persisted artifact, if any
    pub async fn load(&self) -> EeaResult<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                info!(path = %self.path.display(), bytes = bytes.len(), "Found persisted artifact");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No persisted artifact");
                Ok(None)
            }
            Err(e) => Err(EeaError::Persistence(e)),
        }
    }

    pub async fn save(&self, bytes: &[u8]) -> EeaResult<()> {
        let path = self.path.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || write_file(&path, &bytes))
            .await
            .map_err(|e| EeaError::Persistence(io::Error::other(e)))?
    }
}
