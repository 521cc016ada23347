//! Content-addressed artifact storage for remote execution.

use crate::{
    error::{BuildError, Result},
    hash::ContentHash,
    utils,
};
use std::{fmt, path::PathBuf};

/// Blob storage shared between the engine and remote workers.
#[auto_impl::auto_impl(&, Arc)]
pub trait ArtifactStore: Send + Sync + fmt::Debug {
    /// Stores `bytes` and returns their content hash.
    fn put(&self, bytes: &[u8]) -> Result<ContentHash>;

    /// Fetches a blob by hash.
    fn get(&self, hash: &ContentHash) -> Result<Vec<u8>>;

    fn contains(&self, hash: &ContentHash) -> bool;
}

/// Directory-backed store with the same two-hex-prefix sharding as the
/// action cache's object store.
#[derive(Debug)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| BuildError::io(err, &root))?;
        Ok(Self { root })
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn put(&self, bytes: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(bytes);
        let path = self.blob_path(&hash);
        if !path.exists() {
            utils::replace_file(&path, bytes)?;
        }
        Ok(hash)
    }

    fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        utils::read_bytes(self.blob_path(hash))
    }

    fn contains(&self, hash: &ContentHash) -> bool {
        self.blob_path(hash).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::open(dir.path()).unwrap();
        let hash = store.put(b"artifact").unwrap();
        assert!(store.contains(&hash));
        assert_eq!(store.get(&hash).unwrap(), b"artifact");
        // identical content stores once
        assert_eq!(store.put(b"artifact").unwrap(), hash);
    }

    #[test]
    fn missing_blob_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::open(dir.path()).unwrap();
        assert!(store.get(&ContentHash::of(b"missing")).is_err());
    }
}
