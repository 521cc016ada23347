//! Coarse per-target cache.
//!
//! One entry per target records the (sources, deps) fingerprint the target
//! was built from and the combined hash of its outputs. Writes are batched
//! in memory and flushed on session end or via an explicit
//! [`TargetCache::flush`].

use super::entry::TargetEntry;
use crate::{
    error::{BuildError, Result},
    hash::{ContentHash, FileHasher},
    target::TargetId,
    utils,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

const TARGETS_DIR: &str = "targets";
const ENTRY_EXT: &str = "entry";

#[derive(Debug)]
pub struct TargetCache {
    root: PathBuf,
    /// Entries read from disk this session.
    loaded: Mutex<HashMap<TargetId, TargetEntry>>,
    /// Entries written this session, flushed in one batch.
    pending: Mutex<HashMap<TargetId, TargetEntry>>,
}

impl TargetCache {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join(TARGETS_DIR))
            .map_err(|err| BuildError::io(err, root.join(TARGETS_DIR)))?;
        Ok(Self {
            root: root.to_path_buf(),
            loaded: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn entry_path(&self, target: &TargetId) -> PathBuf {
        let digest = ContentHash::of(target.as_str().as_bytes()).to_hex();
        self.root.join(TARGETS_DIR).join(format!("{digest}.{ENTRY_EXT}"))
    }

    fn load(&self, target: &TargetId) -> Option<TargetEntry> {
        if let Some(entry) = self.pending.lock().unwrap().get(target) {
            return Some(entry.clone());
        }
        if let Some(entry) = self.loaded.lock().unwrap().get(target) {
            return Some(entry.clone());
        }
        let path = self.entry_path(target);
        let bytes = fs::read(&path).ok()?;
        match TargetEntry::decode(&bytes, &path) {
            Ok(entry) => {
                self.loaded.lock().unwrap().insert(target.clone(), entry.clone());
                Some(entry)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "quarantining corrupt target entry");
                let _ = fs::rename(&path, path.with_extension("quarantine"));
                None
            }
        }
    }

    /// A target is cached when the stored fingerprint equals the current one,
    /// all outputs exist and their combined content hash matches the stored
    /// output hash. The integrity signature was already validated on decode.
    pub fn is_cached(
        &self,
        target: &TargetId,
        sources_hash: &ContentHash,
        deps_hash: &ContentHash,
        hasher: &FileHasher,
    ) -> bool {
        let Some(entry) = self.load(target) else { return false };
        if &entry.sources_hash != sources_hash || &entry.deps_hash != deps_hash {
            return false;
        }
        if !entry.outputs.iter().all(|output| output.exists()) {
            return false;
        }
        match hasher.hash_files(entry.outputs.iter().map(PathBuf::as_path)) {
            Ok(actual) => actual == entry.output_hash,
            Err(_) => false,
        }
    }

    /// The recorded output hash of a cached target, used as the dependency
    /// fingerprint of its dependents.
    pub fn output_hash(&self, target: &TargetId) -> Option<ContentHash> {
        self.load(target).map(|entry| entry.output_hash)
    }

    /// Records a fresh build result; staged in memory until [`flush`].
    ///
    /// [`flush`]: Self::flush
    pub fn update(
        &self,
        target: TargetId,
        sources_hash: ContentHash,
        deps_hash: ContentHash,
        output_hash: ContentHash,
        outputs: Vec<PathBuf>,
    ) {
        let entry = TargetEntry {
            target: target.clone(),
            sources_hash,
            deps_hash,
            output_hash,
            outputs,
            timestamp_ms: utils::unix_time_ms(),
        };
        self.pending.lock().unwrap().insert(target, entry);
    }

    /// Writes all staged entries to disk. Returns the number written.
    pub fn flush(&self) -> Result<usize> {
        let pending: Vec<(TargetId, TargetEntry)> =
            self.pending.lock().unwrap().drain().collect();
        let count = pending.len();
        for (target, entry) in pending {
            utils::replace_file(&self.entry_path(&target), &entry.encode())?;
            self.loaded.lock().unwrap().insert(target, entry);
        }
        if count > 0 {
            trace!(count, "flushed target cache entries");
        }
        Ok(count)
    }

    /// Staged entries not yet flushed.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// All entry files on disk with sizes and timestamps, for gc.
    pub(crate) fn disk_entries(&self) -> Vec<(PathBuf, u64, u64)> {
        let mut out = Vec::new();
        let dir = self.root.join(TARGETS_DIR);
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
}
