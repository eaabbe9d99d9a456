//! Location-keyed blob storage
//!
//! Stores attachment blobs as plain files under a root directory. A location
//! is a relative path such as `uploads/intro/diagram.png`; duplicated blobs
//! land under `attachments/<uuid>/<name>`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};

use crate::error::StorageError;

use super::AttachmentStore;

/// Result of storing a blob
#[derive(Debug, Clone)]
pub struct PutResult {
    pub location: String,
    /// SHA256 hash of the blob
    pub hash: String,
    pub size_bytes: u64,
}

/// Blob storage manager
pub struct BlobStore {
    /// Root directory for blob storage
    root_dir: PathBuf,
}

impl BlobStore {
    /// Create a new blob store at the given directory
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self, StorageError> {
        let root_dir = root_dir.as_ref().to_path_buf();

        fs::create_dir_all(&root_dir).await?;

        info!(path = %root_dir.display(), "Initialized blob store");

        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Compute SHA256 hash of data
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("sha256-{}", hex::encode(hasher.finalize()))
    }

    /// Map a location to a file path, rejecting anything that could escape the root
    fn blob_path(&self, location: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(location);
        let plain = !location.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(StorageError::InvalidInput(format!(
                "invalid blob location '{}'",
                location
            )));
        }
        Ok(self.root_dir.join(relative))
    }

    /// Store a blob at `location`, replacing any previous content
    pub async fn put(&self, location: &str, data: &[u8]) -> Result<PutResult, StorageError> {
        let path = self.blob_path(location)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;

        let hash = Self::compute_hash(data);
        debug!(location = %location, hash = %hash, size = data.len(), "Stored blob");

        Ok(PutResult {
            location: location.to_string(),
            hash,
            size_bytes: data.len() as u64,
        })
    }

    /// Check if a blob exists
    pub async fn exists(&self, location: &str) -> bool {
        match self.blob_path(location) {
            Ok(path) => fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Get blob size (without loading data)
    pub async fn size(&self, location: &str) -> Result<u64, StorageError> {
        let path = self.blob_path(location)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(location.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Retrieve a blob
    pub async fn get(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.blob_path(location)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(location.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a blob. Missing blobs are not an error.
    pub async fn delete(&self, location: &str) -> Result<(), StorageError> {
        let path = self.blob_path(location)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(location = %location, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Get storage statistics
    pub async fn stats(&self) -> Result<BlobStoreStats, StorageError> {
        let mut total_blobs = 0u64;
        let mut total_bytes = 0u64;
        let mut pending = vec![self.root_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else if metadata.is_file() {
                    total_blobs += 1;
                    total_bytes += metadata.len();
                }
            }
        }

        Ok(BlobStoreStats {
            total_blobs,
            total_bytes,
        })
    }
}

#[async_trait]
impl AttachmentStore for BlobStore {
    async fn copy(&self, source_location: &str, dest_location: &str) -> Result<(), StorageError> {
        let source = self.blob_path(source_location)?;
        let dest = self.blob_path(dest_location)?;

        if fs::metadata(&source).await.is_err() {
            return Err(StorageError::Attachment(format!(
                "source blob '{}' is missing",
                source_location
            )));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let bytes = fs::copy(&source, &dest).await?;
        debug!(
            source = %source_location,
            dest = %dest_location,
            bytes,
            "Copied blob"
        );
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct BlobStoreStats {
    pub total_blobs: u64,
    pub total_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let data = b"Hello, Elohim!";
        let result = store.put("uploads/hello.txt", data).await.unwrap();

        assert!(result.hash.starts_with("sha256-"));
        assert_eq!(result.size_bytes, data.len() as u64);
        assert!(store.exists("uploads/hello.txt").await);
        assert_eq!(store.get("uploads/hello.txt").await.unwrap(), data);
        assert_eq!(store.size("uploads/hello.txt").await.unwrap(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_copy_leaves_source() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();
        store.put("uploads/a.png", b"png bytes").await.unwrap();

        store.copy("uploads/a.png", "attachments/x/a.png").await.unwrap();

        assert_eq!(store.get("attachments/x/a.png").await.unwrap(), b"png bytes");
        assert!(store.exists("uploads/a.png").await);
    }

    #[tokio::test]
    async fn test_copy_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let err = store.copy("uploads/nope.png", "attachments/x/nope.png").await.unwrap_err();
        assert!(matches!(err, StorageError::Attachment(_)));
        assert!(!store.exists("attachments/x/nope.png").await);
    }

    #[tokio::test]
    async fn test_rejects_escaping_locations() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        for bad in ["", "../secret", "/etc/passwd", "a/../../b"] {
            assert!(matches!(
                store.put(bad, b"x").await,
                Err(StorageError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_delete_and_stats() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();
        store.put("a/one.bin", b"1234").await.unwrap();
        store.put("b/c/two.bin", b"56").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_blobs, 2);
        assert_eq!(stats.total_bytes, 6);

        store.delete("a/one.bin").await.unwrap();
        store.delete("a/one.bin").await.unwrap();
        assert!(!store.exists("a/one.bin").await);
        assert!(matches!(store.get("a/one.bin").await, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_compute_hash() {
        let hash = BlobStore::compute_hash(b"test");
        assert!(hash.starts_with("sha256-"));
        assert_eq!(hash.len(), 7 + 64);
    }
}
