//! Fine-grained action cache.
//!
//! On disk the cache is a directory of content-addressed blobs
//! (`objects/<first-two-hex>/<rest-hex>`) plus one index entry per action
//! (`actions/<digest>.entry`). Entries for failed actions are kept in memory
//! for the session with a short TTL so repeated failing work is suppressed;
//! they are persisted but ignored by later sessions unless the policy opts
//! in.

use super::entry::{ActionEntry, ActionId};
use crate::{
    error::{BuildError, Result},
    hash::{CompositeHasher, ContentHash},
    utils,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

const OBJECTS_DIR: &str = "objects";
const ACTIONS_DIR: &str = "actions";
const ENTRY_EXT: &str = "entry";

/// Computes the inputs hash of an action: the ordered content hashes of all
/// input paths plus the canonical (sorted) form of the metadata map.
pub fn inputs_hash(
    input_hashes: &[ContentHash],
    metadata: &BTreeMap<String, String>,
) -> ContentHash {
    let mut hasher = CompositeHasher::new();
    for hash in input_hashes {
        hasher.update_hash(hash);
    }
    for (key, value) in metadata {
        hasher.update(key).update(value);
    }
    hasher.finish()
}

#[derive(Debug)]
pub struct ActionCache {
    root: PathBuf,
    /// Entries loaded from disk or written this session.
    entries: Mutex<HashMap<ActionId, ActionEntry>>,
    /// Action ids recorded during this session, the only ones for which
    /// negative results are honored.
    session: Mutex<HashSet<ActionId>>,
    /// TTL of in-session negative entries.
    negative_ttl: Duration,
    /// Honor persisted negative entries from previous sessions.
    reuse_failures: bool,
}

impl ActionCache {
    pub fn open(root: &Path, negative_ttl: Duration, reuse_failures: bool) -> Result<Self> {
        fs::create_dir_all(root.join(OBJECTS_DIR))
            .map_err(|err| BuildError::io(err, root.join(OBJECTS_DIR)))?;
        fs::create_dir_all(root.join(ACTIONS_DIR))
            .map_err(|err| BuildError::io(err, root.join(ACTIONS_DIR)))?;
        Ok(Self {
            root: root.to_path_buf(),
            entries: Mutex::new(HashMap::new()),
            session: Mutex::new(HashSet::new()),
            negative_ttl,
            reuse_failures,
        })
    }

    fn entry_path(&self, id: &ActionId) -> PathBuf {
        self.root.join(ACTIONS_DIR).join(format!("{}.{ENTRY_EXT}", id.digest()))
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(OBJECTS_DIR).join(&hex[..2]).join(&hex[2..])
    }

    /// Loads the entry for `id`, preferring the in-memory copy and falling
    /// back to disk. Corrupt files are quarantined and treated as a miss.
    fn load(&self, id: &ActionId) -> Option<ActionEntry> {
        if let Some(entry) = self.entries.lock().unwrap().get(id) {
            return Some(entry.clone());
        }
        let path = self.entry_path(id);
        let bytes = fs::read(&path).ok()?;
        match ActionEntry::decode(&bytes, &path) {
            Ok(entry) => {
                self.entries.lock().unwrap().insert(id.clone(), entry.clone());
                Some(entry)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "quarantining corrupt action entry");
                let _ = fs::rename(&path, path.with_extension("quarantine"));
                None
            }
        }
    }

    /// Returns `true` iff a matching entry exists, its metadata equals the
    /// provided metadata, all outputs exist on disk and the recorded outcome
    /// is usable (success, or an unexpired in-session failure).
    pub fn is_cached(
        &self,
        id: &ActionId,
        metadata: &BTreeMap<String, String>,
    ) -> bool {
        let Some(entry) = self.load(id) else { return false };
        if entry.inputs_hash() != &id.input_hash || &entry.metadata != metadata {
            return false;
        }
        if !entry.success {
            return self.negative_hit(&entry);
        }
        entry.outputs.iter().all(|output| output.exists())
    }

    /// Negative entries are only honored when recorded this session (unless
    /// `reuse_failures` is configured) and only within their TTL.
    fn negative_hit(&self, entry: &ActionEntry) -> bool {
        if !self.reuse_failures && !self.session.lock().unwrap().contains(&entry.id) {
            return false;
        }
        let age = utils::unix_time_ms().saturating_sub(entry.timestamp_ms);
        age <= self.negative_ttl.as_millis() as u64
    }

    /// Returns the cached entry if [`Self::is_cached`] would accept it.
    pub fn lookup(
        &self,
        id: &ActionId,
        metadata: &BTreeMap<String, String>,
    ) -> Option<ActionEntry> {
        self.is_cached(id, metadata).then(|| self.load(id)).flatten()
    }

    /// Records the outcome of an action.
    pub fn update(
        &self,
        id: ActionId,
        metadata: BTreeMap<String, String>,
        outputs: Vec<PathBuf>,
        success: bool,
    ) -> Result<()> {
        let entry = ActionEntry {
            id: id.clone(),
            metadata,
            outputs,
            success,
            timestamp_ms: utils::unix_time_ms(),
        };
        utils::replace_file(&self.entry_path(&id), &entry.encode())?;
        self.session.lock().unwrap().insert(id.clone());
        self.entries.lock().unwrap().insert(id, entry);
        Ok(())
    }

    /// Stores a blob in the content-addressed object store.
    pub fn store_object(&self, bytes: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(bytes);
        let path = self.object_path(&hash);
        if !path.exists() {
            utils::replace_file(&path, bytes)?;
        }
        Ok(hash)
    }

    /// Reads a blob from the object store.
    pub fn read_object(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        utils::read_bytes(self.object_path(hash))
    }

    pub fn has_object(&self, hash: &ContentHash) -> bool {
        self.object_path(hash).exists()
    }

    /// All entry files on disk with their sizes and timestamps, for gc.
    pub(crate) fn disk_entries(&self) -> Vec<(PathBuf, u64, u64)> {
        let mut out = Vec::new();
        let dir = self.root.join(ACTIONS_DIR);
        let Ok(read) = fs::read_dir(&dir) else { return out };
        for entry in read.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == ENTRY_EXT).unwrap_or(false) {
                if let Ok(meta) = entry.metadata() {
                    let mtime = meta
                        .modified()
                        .ok()
                        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or_default();
                    out.push((path, meta.len(), mtime));
                }
            }
        }
        out
    }

    /// Drops the in-memory index, keeping disk state.
    pub(crate) fn clear_memory(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ActionKind, TargetId};

    fn cache(dir: &Path) -> ActionCache {
        ActionCache::open(dir, Duration::from_secs(60), false).unwrap()
    }

    fn action(inputs: &[u8]) -> ActionId {
        ActionId::new(
            TargetId::test("lib"),
            ActionKind::Compile,
            ContentHash::of(inputs),
            "lib.py",
        )
    }

    fn metadata() -> BTreeMap<String, String> {
        BTreeMap::from([("compiler".to_string(), "cc 1.0".to_string())])
    }

    #[test]
    fn miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let output = dir.path().join("out.o");
        std::fs::write(&output, "obj").unwrap();

        let id = action(b"in");
        assert!(!cache.is_cached(&id, &metadata()));
        cache.update(id.clone(), metadata(), vec![output], true).unwrap();
        assert!(cache.is_cached(&id, &metadata()));
    }

    #[test]
    fn metadata_change_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let output = dir.path().join("out.o");
        std::fs::write(&output, "obj").unwrap();

        let id = action(b"in");
        cache.update(id.clone(), metadata(), vec![output], true).unwrap();

        let mut changed = metadata();
        changed.insert("opt".into(), "3".into());
        assert!(!cache.is_cached(&id, &changed));
    }

    #[test]
    fn missing_output_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let output = dir.path().join("gone.o");
        std::fs::write(&output, "obj").unwrap();

        let id = action(b"in");
        cache.update(id.clone(), metadata(), vec![output.clone()], true).unwrap();
        std::fs::remove_file(&output).unwrap();
        assert!(!cache.is_cached(&id, &metadata()));
    }

    #[test]
    fn negative_entries_are_session_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let id = action(b"in");
        {
            let cache = cache(dir.path());
            cache.update(id.clone(), metadata(), vec![], false).unwrap();
            // same session: failure is cached
            assert!(cache.is_cached(&id, &metadata()));
        }
        // fresh session: persisted failure is ignored
        let fresh = cache(dir.path());
        assert!(!fresh.is_cached(&id, &metadata()));
    }

    #[test]
    fn negative_entries_reusable_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let id = action(b"in");
        cache(dir.path()).update(id.clone(), metadata(), vec![], false).unwrap();

        let fresh = ActionCache::open(dir.path(), Duration::from_secs(60), true).unwrap();
        assert!(fresh.is_cached(&id, &metadata()));
    }

    #[test]
    fn corrupt_entry_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let id = action(b"in");
        cache.update(id.clone(), metadata(), vec![], true).unwrap();
        cache.clear_memory();

        let path = cache.entry_path(&id);
        std::fs::write(&path, b"garbage").unwrap();
        assert!(!cache.is_cached(&id, &metadata()));
        assert!(path.with_extension("quarantine").exists());
    }

    #[test]
    fn object_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let hash = cache.store_object(b"artifact bytes").unwrap();
        assert!(cache.has_object(&hash));
        assert_eq!(cache.read_object(&hash).unwrap(), b"artifact bytes");
        // layout is two-hex-prefix sharded
        let hex = hash.to_hex();
        assert!(dir.path().join(OBJECTS_DIR).join(&hex[..2]).join(&hex[2..]).exists());
    }

    #[test]
    fn inputs_hash_covers_metadata() {
        let hashes = [ContentHash::of(b"a"), ContentHash::of(b"b")];
        let base = inputs_hash(&hashes, &metadata());
        let mut changed = metadata();
        changed.insert("triple".into(), "x86_64".into());
        assert_ne!(base, inputs_hash(&hashes, &changed));
        // order of inputs matters
        let swapped = [ContentHash::of(b"b"), ContentHash::of(b"a")];
        assert_ne!(base, inputs_hash(&swapped, &metadata()));
    }
}
