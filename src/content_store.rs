//! Content-addressed chunk bytes on local disk
//!
//! Each chunk lives at a path derived from its SHA256 id:
//!
//! ```text
//! <cache_dir>/
//! ├── 3a/
//! │   └── chunk_3a7bd3e2360a3d...
//! └── f0/
//!     └── chunk_f0e4c2f76c5891...
//! ```
//!
//! Existence of the path is the existence check. Data already present for an
//! id is trusted and never rewritten or re-verified on `put`: the id is the
//! hash of the bytes, so a second write could only produce the same file.
//! Verification happens where bytes for an already-known id arrive from
//! outside (`Chunk::set_data`), not on every write.

use crate::error::StorageError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Result of storing chunk bytes
#[derive(Debug, Clone)]
pub struct StoreResult {
    /// Hex SHA256 of the bytes
    pub hash: String,
    /// Total size in bytes
    pub size_bytes: u64,
    /// Whether data for this hash was already on disk (no write performed)
    pub already_existed: bool,
}

/// Raw chunk bytes keyed by content hash
pub struct ContentStore {
    /// Cache directory holding chunk files
    root_dir: PathBuf,
}

impl ContentStore {
    /// Create a content store rooted at the given directory
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self, StorageError> {
        let root_dir = root_dir.as_ref().to_path_buf();

        fs::create_dir_all(&root_dir).await?;

        info!(path = %root_dir.display(), "Initialized content store");

        Ok(Self { root_dir })
    }

    /// Compute hex SHA256 of data
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Whether `id` has the shape of a hex SHA256 digest
    pub fn is_valid_id(id: &str) -> bool {
        id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Reject anything that is not 64 lowercase hex characters
    pub fn validate_id(id: &str) -> Result<(), StorageError> {
        if Self::is_valid_id(id) {
            Ok(())
        } else {
            Err(StorageError::InvalidInput(format!("Invalid chunk id {:?}", id)))
        }
    }

    /// Path for a chunk by id
    fn chunk_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        Self::validate_id(id)?;
        // Two-char fan-out keeps directories small
        Ok(self.root_dir.join(&id[..2]).join(format!("chunk_{}", id)))
    }

    /// Store bytes, returning their hash
    ///
    /// Writes go to a temp file that is renamed into place, so concurrent
    /// writers of the same hash never expose a partial file.
    pub async fn put(&self, data: &[u8]) -> Result<StoreResult, StorageError> {
        let hash = Self::compute_hash(data);
        let path = self.chunk_path(&hash)?;

        if fs::metadata(&path).await.is_ok() {
            debug!(hash = %hash, "Chunk already on disk");
            return Ok(StoreResult {
                hash,
                size_bytes: data.len() as u64,
                already_existed: true,
            });
        }

        let parent = path
            .parent()
            .ok_or_else(|| StorageError::Internal(format!("No parent for {}", path.display())))?;
        fs::create_dir_all(parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp_path, data).await?;

        // Lost the race: someone else finished first, keep theirs
        if fs::metadata(&path).await.is_ok() {
            fs::remove_file(&tmp_path).await.ok();
            debug!(hash = %hash, "Chunk written concurrently, skipping");
            return Ok(StoreResult {
                hash,
                size_bytes: data.len() as u64,
                already_existed: true,
            });
        }

        fs::rename(&tmp_path, &path).await?;

        debug!(hash = %hash, size = data.len(), "Stored chunk");

        Ok(StoreResult {
            hash,
            size_bytes: data.len() as u64,
            already_existed: false,
        })
    }

    /// Check if bytes exist for an id. A malformed id never exists.
    pub async fn exists(&self, id: &str) -> bool {
        match self.chunk_path(id) {
            Ok(path) => fs::metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Read bytes by id
    pub async fn get(&self, id: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.chunk_path(id)?).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stored byte length without reading the content
    pub async fn size_of(&self, id: &str) -> Result<u64, StorageError> {
        match fs::metadata(self.chunk_path(id)?).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete bytes for an id (missing data is not an error)
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.chunk_path(id)?).await {
            Ok(()) => {
                debug!(hash = %id, "Deleted chunk bytes");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Get storage statistics
    pub async fn stats(&self) -> Result<ContentStats, StorageError> {
        let mut total_chunks = 0u64;
        let mut total_bytes = 0u64;

        let mut entries = fs::read_dir(&self.root_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let mut subentries = fs::read_dir(entry.path()).await?;
            while let Some(subentry) = subentries.next_entry().await? {
                if subentry.file_name().to_string_lossy().starts_with("chunk_") {
                    total_chunks += 1;
                    total_bytes += subentry.metadata().await?.len();
                }
            }
        }

        Ok(ContentStats {
            total_chunks,
            total_bytes,
        })
    }
}

/// Content store statistics
#[derive(Debug, Clone)]
pub struct ContentStats {
    pub total_chunks: u64,
    pub total_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path()).await.unwrap();

        let data = b"Hello, Elohim!";
        let result = store.put(data).await.unwrap();

        assert_eq!(result.hash.len(), 64);
        assert_eq!(result.size_bytes, data.len() as u64);
        assert!(!result.already_existed);

        assert_eq!(store.get(&result.hash).await.unwrap(), data);
        assert_eq!(store.size_of(&result.hash).await.unwrap(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_idempotent_put() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path()).await.unwrap();

        let data = b"Duplicate test";
        let result1 = store.put(data).await.unwrap();
        let result2 = store.put(data).await.unwrap();

        assert_eq!(result1.hash, result2.hash);
        assert!(!result1.already_existed);
        assert!(result2.already_existed);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.total_bytes, data.len() as u64);
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path()).await.unwrap();

        let id = ContentStore::compute_hash(b"never stored");
        assert!(matches!(store.get(&id).await, Err(StorageError::NotFound(_))));
        assert!(matches!(store.size_of(&id).await, Err(StorageError::NotFound(_))));
        assert!(!store.exists(&id).await);
    }

    #[tokio::test]
    async fn test_concurrent_puts_write_once() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::new(temp_dir.path()).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.put(b"racing bytes").await }));
        }

        let mut hashes = Vec::new();
        for handle in handles {
            hashes.push(handle.await.unwrap().unwrap().hash);
        }
        hashes.dedup();
        assert_eq!(hashes.len(), 1);
        assert_eq!(store.get(&hashes[0]).await.unwrap(), b"racing bytes");
        assert_eq!(store.stats().await.unwrap().total_chunks, 1);
    }

    #[tokio::test]
    async fn test_malformed_ids_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path().join("cache")).await.unwrap();

        // A file just outside the cache directory that a traversal would reach
        let outside = temp_dir.path().join("chunk_escape");
        std::fs::write(&outside, b"outside").unwrap();

        let upper = ContentStore::compute_hash(b"x").to_uppercase();
        let short = "a".repeat(63);
        for id in ["", "../../escape", "..", upper.as_str(), short.as_str()] {
            assert!(matches!(store.get(id).await, Err(StorageError::InvalidInput(_))));
            assert!(matches!(store.size_of(id).await, Err(StorageError::InvalidInput(_))));
            assert!(matches!(store.delete(id).await, Err(StorageError::InvalidInput(_))));
            assert!(!store.exists(id).await);
        }
        assert!(outside.exists());
        assert!(ContentStore::is_valid_id(&ContentStore::compute_hash(b"x")));
    }

    #[test]
    fn test_compute_hash() {
        assert_eq!(
            ContentStore::compute_hash(b"test"),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }
}
