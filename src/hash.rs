//! Content hashing for files, byte strings and composite cache keys.

use crate::error::{BuildError, Result};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// A 32-byte content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub const ZERO: ContentHash = ContentHash([0u8; 32]);

    /// Hashes the given bytes.
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        ContentHash(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes: [u8; 32] =
            hex::decode_to_array(s).map_err(|err| BuildError::msg(format!("bad hash: {err}")))?;
        Ok(ContentHash(bytes))
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental builder for composite hashes.
///
/// Every part is length-prefixed so `["ab","c"]` and `["a","bc"]` produce
/// different digests.
#[derive(Default)]
pub struct CompositeHasher {
    inner: Sha256,
}

impl CompositeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, part: impl AsRef<[u8]>) -> &mut Self {
        let part = part.as_ref();
        self.inner.update((part.len() as u64).to_be_bytes());
        self.inner.update(part);
        self
    }

    pub fn update_hash(&mut self, hash: &ContentHash) -> &mut Self {
        self.update(hash.as_bytes())
    }

    pub fn finish(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

/// File metadata used to decide whether a cached hash is still valid.
#[derive(Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    mtime_ms: u64,
    len: u64,
}

impl FileStamp {
    fn read(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|err| BuildError::io(err, path))?;
        let mtime_ms = meta
            .modified()
            .map_err(|err| BuildError::io(err, path))?
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(BuildError::msg)?
            .as_millis() as u64;
        Ok(Self { mtime_ms, len: meta.len() })
    }
}

/// Hashes file contents with a (mtime, len) keyed lookup cache.
///
/// The cache is shared across threads; hits avoid re-reading unchanged files
/// within a session.
#[derive(Default)]
pub struct FileHasher {
    cache: Mutex<HashMap<PathBuf, (FileStamp, ContentHash)>>,
}

impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the content hash of the file, reading it only if the cached
    /// stamp no longer matches.
    pub fn hash_file(&self, path: &Path) -> Result<ContentHash> {
        let stamp = FileStamp::read(path)?;
        if let Some((cached_stamp, hash)) = self.cache.lock().unwrap().get(path) {
            if *cached_stamp == stamp {
                return Ok(*hash);
            }
        }
        let bytes = fs::read(path).map_err(|err| BuildError::io(err, path))?;
        let hash = ContentHash::of(&bytes);
        self.cache.lock().unwrap().insert(path.to_path_buf(), (stamp, hash));
        Ok(hash)
    }

    /// Hashes an ordered list of files into one composite digest.
    pub fn hash_files<'a>(&self, paths: impl IntoIterator<Item = &'a Path>) -> Result<ContentHash> {
        let mut hasher = CompositeHasher::new();
        for path in paths {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update_hash(&self.hash_file(path)?);
        }
        Ok(hasher.finish())
    }

    /// Number of cached file hashes.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for FileHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHasher").field("entries", &self.len()).finish()
    }
}

/// Short md5-derived id over ordered string parts, used for build/session ids.
pub fn short_id<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    use md5::Digest;
    let mut hasher = md5::Md5::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn composite_is_length_prefixed() {
        let mut a = CompositeHasher::new();
        a.update("ab").update("c");
        let mut b = CompositeHasher::new();
        b.update("a").update("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn hex_round_trip() {
        let hash = ContentHash::of(b"polybuild");
        assert_eq!(ContentHash::from_hex(&hash.to_hex()).unwrap(), hash);
    }

    #[test]
    fn file_hash_cache_invalidates_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.txt");
        std::fs::write(&path, "one").unwrap();

        let hasher = FileHasher::new();
        let first = hasher.hash_file(&path).unwrap();
        assert_eq!(hasher.hash_file(&path).unwrap(), first);

        // rewrite with different length so the stamp is guaranteed to change
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"changed").unwrap();
        drop(f);
        assert_ne!(hasher.hash_file(&path).unwrap(), first);
    }

    #[test]
    fn short_ids_are_stable() {
        assert_eq!(short_id(["a", "b"]), short_id(["a", "b"]));
        assert_ne!(short_id(["ab"]), short_id(["a", "b"]));
    }
}
