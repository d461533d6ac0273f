//! Content-addressed block cache.
//!
//! One file per block at `<root>/<folder>/<file-id>/<offset>`. Reads are
//! verified against the expected SHA-256 before being served; a
//! mismatch reads as a miss so the caller can mark the block stale and
//! re-request it.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Filesystem block cache rooted at a single directory.
#[derive(Clone)]
pub struct BlockCache {
    root: PathBuf,
}

impl BlockCache {
    /// Creates a cache rooted at `root`; directories appear lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn block_path(&self, folder: &str, file_id: i64, offset: i64) -> PathBuf {
        self.root
            .join(folder)
            .join(file_id.to_string())
            .join(offset.to_string())
    }

    /// Writes a verified block, creating missing directories.
    pub async fn write_block(
        &self,
        folder: &str,
        file_id: i64,
        offset: i64,
        bytes: &[u8],
    ) -> io::Result<()> {
        let path = self.block_path(folder, file_id, offset);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(path = %path.display(), len = bytes.len(), "block cached");
        Ok(())
    }

    /// Reads a block back, verifying size and content hash.
    ///
    /// Returns `None` when the file is absent, truncated, oversized, or
    /// hashes to something other than `expected_hash`.
    pub async fn read_block(
        &self,
        folder: &str,
        file_id: i64,
        offset: i64,
        expected_size: usize,
        expected_hash: &[u8],
    ) -> Option<Vec<u8>> {
        let path = self.block_path(folder, file_id, offset);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(path = %path.display(), %error, "cache read failed");
                return None;
            }
        };
        if bytes.is_empty() || bytes.len() != expected_size {
            return None;
        }
        if Sha256::digest(&bytes).as_slice() != expected_hash {
            warn!(path = %path.display(), "cached block failed verification");
            return None;
        }
        Some(bytes)
    }

    /// Removes a block file; absence is not an error.
    pub async fn remove_block(
        &self,
        folder: &str,
        file_id: i64,
        offset: i64,
    ) -> io::Result<()> {
        let path = self.block_path(folder, file_id, offset);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// The cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(bytes: &[u8]) -> Vec<u8> {
        Sha256::digest(bytes).to_vec()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlockCache::new(dir.path());
        let data = vec![0x42u8; 1024];

        cache.write_block("docs", 7, 0, &data).await.unwrap();
        let read = cache.read_block("docs", 7, 0, 1024, &hash_of(&data)).await;
        assert_eq!(read, Some(data));
    }

    #[tokio::test]
    async fn corrupted_block_reads_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlockCache::new(dir.path());
        let data = vec![0x42u8; 1024];
        cache.write_block("docs", 7, 0, &data).await.unwrap();

        // Flip a byte on disk behind the cache's back.
        let path = dir.path().join("docs").join("7").join("0");
        let mut on_disk = std::fs::read(&path).unwrap();
        on_disk[0] ^= 0xFF;
        std::fs::write(&path, &on_disk).unwrap();

        assert!(
            cache
                .read_block("docs", 7, 0, 1024, &hash_of(&data))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn wrong_size_reads_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlockCache::new(dir.path());
        let data = vec![0x42u8; 512];
        cache.write_block("docs", 7, 0, &data).await.unwrap();
        assert!(
            cache
                .read_block("docs", 7, 0, 1024, &hash_of(&data))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn absent_block_reads_as_miss_and_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlockCache::new(dir.path());
        assert!(cache.read_block("docs", 1, 0, 16, &[0; 32]).await.is_none());
        cache.remove_block("docs", 1, 0).await.unwrap();
    }
}
