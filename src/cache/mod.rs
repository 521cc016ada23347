//! Two-tier build cache.
//!
//! The [`CacheCoordinator`] is the single entry point the engine talks to. It
//! combines the coarse [`TargetCache`] (one entry per target) with the
//! fine-grained [`ActionCache`] (one entry per action, plus a
//! content-addressed object store), emits cache events to the report bus and
//! owns garbage collection.
//!
//! When the cache root cannot be opened the coordinator degrades to a
//! no-cache mode for the session instead of failing the build.

mod action;
mod entry;
mod target_cache;

pub use action::{inputs_hash, ActionCache};
pub use entry::{ActionEntry, ActionId, TargetEntry, ACTION_ENTRY_VERSION, TARGET_ENTRY_VERSION};
pub use target_cache::TargetCache;

use crate::{
    error::Result,
    hash::{CompositeHasher, ContentHash, FileHasher},
    report::{self, CacheEvent},
    target::{Target, TargetId},
};
use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Garbage-collection strategy for persisted entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcPolicy {
    /// Remove entries older than the given age.
    MaxAge(Duration),
    /// Keep the most recently used entries up to the byte budget.
    LruBySize(u64),
    /// Age pass first, then the size budget.
    Hybrid { max_age: Duration, max_bytes: u64 },
}

/// Immutable cache configuration, built via [`CachePolicyBuilder`].
#[derive(Clone, Debug)]
pub struct CachePolicy {
    pub root: PathBuf,
    pub enabled: bool,
    pub negative_ttl: Duration,
    pub reuse_failures: bool,
    pub gc: Option<GcPolicy>,
}

impl CachePolicy {
    pub fn builder() -> CachePolicyBuilder {
        CachePolicyBuilder::default()
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicyBuilder::default().build()
    }
}

#[derive(Clone, Debug, Default)]
pub struct CachePolicyBuilder {
    root: Option<PathBuf>,
    enabled: Option<bool>,
    negative_ttl: Option<Duration>,
    reuse_failures: bool,
    gc: Option<GcPolicy>,
}

impl CachePolicyBuilder {
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = Some(ttl);
        self
    }

    /// Honor persisted negative entries from previous sessions.
    pub fn reuse_failures(mut self, reuse: bool) -> Self {
        self.reuse_failures = reuse;
        self
    }

    pub fn gc(mut self, policy: GcPolicy) -> Self {
        self.gc = Some(policy);
        self
    }

    pub fn build(self) -> CachePolicy {
        CachePolicy {
            root: self.root.unwrap_or_else(default_cache_root),
            enabled: self.enabled.unwrap_or(true),
            negative_ttl: self.negative_ttl.unwrap_or(Duration::from_secs(15 * 60)),
            reuse_failures: self.reuse_failures,
            gc: self.gc,
        }
    }
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("polybuild")
}

/// The current (sources, deps) fingerprint of a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetFingerprint {
    pub sources_hash: ContentHash,
    pub deps_hash: ContentHash,
}

impl TargetFingerprint {
    /// Computes the fingerprint of `target`.
    ///
    /// The sources hash covers the content of every source file plus the
    /// target definition itself (kind, language, flags, env, config) and the
    /// effect log of its evaluation; the deps hash covers the dependency ids
    /// with the output hashes their builds produced.
    pub fn compute(
        target: &Target,
        hasher: &FileHasher,
        dep_outputs: &[(TargetId, ContentHash)],
    ) -> Result<Self> {
        let mut sources = CompositeHasher::new();
        for source in &target.sources {
            sources.update(source.to_string_lossy().as_bytes());
            sources.update_hash(&hasher.hash_file(source)?);
        }
        sources.update(format!("{:?}|{}", target.kind, target.language));
        sources.update(target.flags.join("\u{1f}"));
        for (key, value) in &target.env {
            sources.update(key).update(value);
        }
        sources.update(serde_json::to_string(&target.config)?);
        for effect in &target.effects {
            sources.update(&effect.builtin).update(&effect.input).update(&effect.observed);
        }

        let mut deps = CompositeHasher::new();
        for (id, output_hash) in dep_outputs {
            deps.update(id.as_str());
            deps.update_hash(output_hash);
        }

        Ok(Self { sources_hash: sources.finish(), deps_hash: deps.finish() })
    }
}

/// Aggregate cache statistics for one session.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub evicted_entries: AtomicU64,
    pub evicted_bytes: AtomicU64,
}

/// Result of one gc run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub removed_entries: usize,
    pub removed_bytes: u64,
}

#[derive(Debug)]
struct Caches {
    targets: TargetCache,
    actions: ActionCache,
}

/// Unified entry point over the target and action caches.
#[derive(Debug)]
pub struct CacheCoordinator {
    inner: Option<Caches>,
    stats: CacheStats,
}

impl CacheCoordinator {
    /// Opens the caches under the policy's root.
    ///
    /// An unusable cache root logs a warning and degrades to no caching for
    /// the session.
    pub fn open(policy: &CachePolicy) -> Self {
        if !policy.enabled {
            return Self { inner: None, stats: CacheStats::default() };
        }
        let opened = TargetCache::open(&policy.root).and_then(|targets| {
            let actions =
                ActionCache::open(&policy.root, policy.negative_ttl, policy.reuse_failures)?;
            Ok(Caches { targets, actions })
        });
        let inner = match opened {
            Ok(caches) => Some(caches),
            Err(err) => {
                warn!(root = %policy.root.display(), %err, "cache unusable, running without cache");
                None
            }
        };
        Self { inner, stats: CacheStats::default() }
    }

    /// Whether caching is active (not degraded, not disabled).
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    // ---- target tier ----

    pub fn is_cached(
        &self,
        target: &TargetId,
        fingerprint: &TargetFingerprint,
        hasher: &FileHasher,
    ) -> bool {
        let hit = self
            .inner
            .as_ref()
            .map(|caches| {
                caches.targets.is_cached(
                    target,
                    &fingerprint.sources_hash,
                    &fingerprint.deps_hash,
                    hasher,
                )
            })
            .unwrap_or(false);
        if hit {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            report::get_default(|r| r.on_cache_event(&CacheEvent::Hit { target: target.clone() }));
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            report::get_default(|r| r.on_cache_event(&CacheEvent::Miss { target: target.clone() }));
        }
        hit
    }

    pub fn update(
        &self,
        target: &TargetId,
        fingerprint: &TargetFingerprint,
        output_hash: ContentHash,
        outputs: Vec<PathBuf>,
    ) {
        if let Some(caches) = &self.inner {
            caches.targets.update(
                target.clone(),
                fingerprint.sources_hash,
                fingerprint.deps_hash,
                output_hash,
                outputs,
            );
            self.stats.writes.fetch_add(1, Ordering::Relaxed);
            report::get_default(|r| {
                r.on_cache_event(&CacheEvent::Write { target: target.clone() })
            });
        }
    }

    /// Output hash of a previously built or cached target.
    pub fn output_hash(&self, target: &TargetId) -> Option<ContentHash> {
        self.inner.as_ref()?.targets.output_hash(target)
    }

    // ---- action tier ----

    pub fn is_action_cached(&self, id: &ActionId, metadata: &BTreeMap<String, String>) -> bool {
        self.inner
            .as_ref()
            .map(|caches| caches.actions.is_cached(id, metadata))
            .unwrap_or(false)
    }

    pub fn lookup_action(
        &self,
        id: &ActionId,
        metadata: &BTreeMap<String, String>,
    ) -> Option<ActionEntry> {
        self.inner.as_ref()?.actions.lookup(id, metadata)
    }

    pub fn record_action(
        &self,
        id: ActionId,
        metadata: BTreeMap<String, String>,
        outputs: Vec<PathBuf>,
        success: bool,
    ) -> Result<()> {
        if let Some(caches) = &self.inner {
            caches.actions.update(id, metadata, outputs, success)?;
        }
        Ok(())
    }

    pub fn store_object(&self, bytes: &[u8]) -> Result<Option<ContentHash>> {
        match &self.inner {
            Some(caches) => caches.actions.store_object(bytes).map(Some),
            None => Ok(None),
        }
    }

    // ---- lifecycle ----

    /// Flushes batched target entries to disk.
    pub fn flush(&self) -> Result<usize> {
        match &self.inner {
            Some(caches) => caches.targets.flush(),
            None => Ok(0),
        }
    }

    /// Flushes and drops in-memory state. The coordinator stays usable but
    /// empty-handed, matching a freshly opened cold cache.
    pub fn close(&self) -> Result<()> {
        if let Some(caches) = &self.inner {
            caches.targets.flush()?;
            caches.actions.clear_memory();
        }
        Ok(())
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Removes entries according to `policy`; objects are untouched.
    pub fn gc(&self, policy: GcPolicy) -> Result<GcStats> {
        let Some(caches) = &self.inner else { return Ok(GcStats::default()) };

        let mut entries = caches.targets.disk_entries();
        entries.extend(caches.actions.disk_entries());

        let now = crate::utils::unix_time_ms();
        let mut doomed: Vec<(PathBuf, u64)> = Vec::new();

        let (max_age, max_bytes) = match policy {
            GcPolicy::MaxAge(age) => (Some(age), None),
            GcPolicy::LruBySize(bytes) => (None, Some(bytes)),
            GcPolicy::Hybrid { max_age, max_bytes } => (Some(max_age), Some(max_bytes)),
        };

        if let Some(max_age) = max_age {
            let cutoff = now.saturating_sub(max_age.as_millis() as u64);
            entries.retain(|(path, len, mtime)| {
                if *mtime < cutoff {
                    doomed.push((path.clone(), *len));
                    false
                } else {
                    true
                }
            });
        }

        if let Some(max_bytes) = max_bytes {
            // most recently used first, evict from the tail
            entries.sort_by(|a, b| b.2.cmp(&a.2));
            let mut used = 0u64;
            for (path, len, _) in entries {
                used += len;
                if used > max_bytes {
                    doomed.push((path, len));
                }
            }
        }

        let mut stats = GcStats::default();
        for (path, len) in doomed {
            if fs::remove_file(&path).is_ok() {
                stats.removed_entries += 1;
                stats.removed_bytes += len;
            }
        }
        if stats.removed_entries > 0 {
            self.stats.evicted_entries.fetch_add(stats.removed_entries as u64, Ordering::Relaxed);
            self.stats.evicted_bytes.fetch_add(stats.removed_bytes, Ordering::Relaxed);
            report::get_default(|r| {
                r.on_cache_event(&CacheEvent::Evict {
                    entries: stats.removed_entries,
                    bytes: stats.removed_bytes,
                })
            });
            debug!(?stats, "cache gc");
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::ActionKind;
    use std::path::Path;

    fn policy(dir: &Path) -> CachePolicy {
        CachePolicy::builder().root(dir).build()
    }

    #[test]
    fn disabled_policy_never_caches() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator =
            CacheCoordinator::open(&CachePolicy::builder().root(dir.path()).enabled(false).build());
        assert!(!coordinator.is_enabled());
        assert!(coordinator
            .store_object(b"bytes")
            .unwrap()
            .is_none());
    }

    #[test]
    fn unusable_root_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        let coordinator = CacheCoordinator::open(&policy(&file));
        assert!(!coordinator.is_enabled());
    }

    #[test]
    fn action_round_trip_through_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = CacheCoordinator::open(&policy(dir.path()));
        let id = ActionId::new(
            TargetId::test("a"),
            ActionKind::Compile,
            ContentHash::of(b"in"),
            "",
        );
        let metadata = BTreeMap::from([("compiler".to_string(), "cc".to_string())]);
        assert!(!coordinator.is_action_cached(&id, &metadata));
        coordinator.record_action(id.clone(), metadata.clone(), vec![], true).unwrap();
        assert!(coordinator.is_action_cached(&id, &metadata));
    }

    #[test]
    fn gc_by_size_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = CacheCoordinator::open(&policy(dir.path()));
        for i in 0..4 {
            let id = ActionId::new(
                TargetId::test("a"),
                ActionKind::Compile,
                ContentHash::of(format!("in{i}").as_bytes()),
                i.to_string(),
            );
            coordinator.record_action(id, BTreeMap::new(), vec![], true).unwrap();
        }
        // budget of zero removes everything
        let stats = coordinator.gc(GcPolicy::LruBySize(0)).unwrap();
        assert_eq!(stats.removed_entries, 4);
    }

    #[test]
    fn gc_by_age_ignores_fresh_entries() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = CacheCoordinator::open(&policy(dir.path()));
        let id = ActionId::new(
            TargetId::test("a"),
            ActionKind::Compile,
            ContentHash::of(b"in"),
            "",
        );
        coordinator.record_action(id, BTreeMap::new(), vec![], true).unwrap();
        let stats = coordinator.gc(GcPolicy::MaxAge(Duration::from_secs(3600))).unwrap();
        assert_eq!(stats.removed_entries, 0);
    }
}
