//! Checkpoint and resume.
//!
//! The session periodically snapshots which targets completed; on startup a
//! snapshot whose graph fingerprint matches the current graph (and whose age
//! is below the staleness bound) yields a resume plan listing the targets
//! that still need work.

use crate::{
    error::Result,
    graph::BuildGraph,
    hash::ContentHash,
    target::TargetId,
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};

const CHECKPOINT_FORMAT: u32 = 1;

/// Serialized snapshot of build progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "_format")]
    pub format: u32,
    pub build_id: String,
    /// Hex fingerprint of the graph this snapshot belongs to.
    pub graph_fingerprint: String,
    pub built: Vec<TargetId>,
    pub cached: Vec<TargetId>,
    pub failed: Vec<TargetId>,
    pub timestamp_ms: u64,
}

impl Checkpoint {
    pub fn new(
        build_id: impl Into<String>,
        graph_fingerprint: ContentHash,
        built: Vec<TargetId>,
        cached: Vec<TargetId>,
        failed: Vec<TargetId>,
    ) -> Self {
        Self {
            format: CHECKPOINT_FORMAT,
            build_id: build_id.into(),
            graph_fingerprint: graph_fingerprint.to_hex(),
            built,
            cached,
            failed,
            timestamp_ms: utils::unix_time_ms(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        utils::write_json_file(self, path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        utils::read_json_file(path)
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(utils::unix_time_ms().saturating_sub(self.timestamp_ms))
    }

    /// Whether this snapshot can seed a resume of `graph`.
    pub fn is_valid_for(&self, graph: &BuildGraph, staleness: Duration) -> bool {
        self.format == CHECKPOINT_FORMAT
            && self.graph_fingerprint == graph.fingerprint().to_hex()
            && self.age() < staleness
    }

    /// Produces the resume plan, or `None` when the snapshot does not apply.
    pub fn resume_plan(&self, graph: &BuildGraph, staleness: Duration) -> Option<ResumePlan> {
        if !self.is_valid_for(graph, staleness) {
            return None;
        }
        let mut done: Vec<&TargetId> = self.built.iter().chain(&self.cached).collect();
        done.sort();
        let remaining = graph
            .node_ids()
            .into_iter()
            .map(|id| graph.node(id).target.clone())
            .filter(|target| done.binary_search(&target).is_err())
            .collect();
        Some(ResumePlan {
            completed: self.built.len() + self.cached.len(),
            previously_failed: self.failed.clone(),
            remaining,
        })
    }
}

/// What is left to do according to a valid checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumePlan {
    /// Targets already in a good terminal state.
    pub completed: usize,
    /// Targets that failed last time; they are rebuilt.
    pub previously_failed: Vec<TargetId>,
    /// Targets still needing work, in graph order.
    pub remaining: Vec<TargetId>,
}

/// Writes checkpoints on an interval and on demand.
#[derive(Debug)]
pub struct CheckpointManager {
    path: PathBuf,
    interval: Duration,
    staleness: Duration,
    last_write: Mutex<Option<Instant>>,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>, interval: Duration, staleness: Duration) -> Self {
        Self { path: path.into(), interval, staleness, last_write: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Loads the snapshot on disk, if any. Unreadable snapshots are treated
    /// as absent.
    pub fn load(&self) -> Option<Checkpoint> {
        if !self.path.exists() {
            return None;
        }
        match Checkpoint::read(&self.path) {
            Ok(checkpoint) => Some(checkpoint),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "ignoring unreadable checkpoint");
                None
            }
        }
    }

    /// Writes `checkpoint` if the interval elapsed since the last write.
    pub fn maybe_write(&self, checkpoint: &Checkpoint) -> Result<bool> {
        let mut last = self.last_write.lock().unwrap();
        if let Some(at) = *last {
            if at.elapsed() < self.interval {
                return Ok(false);
            }
        }
        checkpoint.write(&self.path)?;
        *last = Some(Instant::now());
        crate::report::get_default(|r| {
            r.on_checkpoint_written(checkpoint.built.len() + checkpoint.cached.len())
        });
        Ok(true)
    }

    /// Unconditional write, used on cancellation and fatal errors.
    pub fn force_write(&self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.write(&self.path)?;
        *self.last_write.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    /// Removes the snapshot after a fully successful build.
    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_abc() -> BuildGraph {
        let graph = BuildGraph::new();
        let a = graph.add_target(TargetId::test("a")).unwrap();
        let b = graph.add_target(TargetId::test("b")).unwrap();
        graph.add_dependency(b, a).unwrap();
        graph.add_target(TargetId::test("c")).unwrap();
        graph
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let checkpoint = Checkpoint::new(
            "build-1",
            ContentHash::of(b"graph"),
            vec![TargetId::test("a")],
            vec![],
            vec![TargetId::test("b")],
        );
        checkpoint.write(&path).unwrap();
        assert_eq!(Checkpoint::read(&path).unwrap(), checkpoint);
    }

    #[test]
    fn resume_plan_lists_remaining_targets() {
        let graph = graph_abc();
        let checkpoint = Checkpoint::new(
            "build-1",
            graph.fingerprint(),
            vec![TargetId::test("a")],
            vec![TargetId::test("c")],
            vec![],
        );
        let plan = checkpoint.resume_plan(&graph, Duration::from_secs(3600)).unwrap();
        assert_eq!(plan.completed, 2);
        assert_eq!(plan.remaining, vec![TargetId::test("b")]);
    }

    #[test]
    fn fingerprint_mismatch_invalidates() {
        let graph = graph_abc();
        let checkpoint =
            Checkpoint::new("build-1", ContentHash::of(b"other graph"), vec![], vec![], vec![]);
        assert!(checkpoint.resume_plan(&graph, Duration::from_secs(3600)).is_none());
    }

    #[test]
    fn stale_checkpoint_invalidates() {
        let graph = graph_abc();
        let mut checkpoint = Checkpoint::new("build-1", graph.fingerprint(), vec![], vec![], vec![]);
        checkpoint.timestamp_ms = checkpoint.timestamp_ms.saturating_sub(10_000);
        assert!(checkpoint.resume_plan(&graph, Duration::from_secs(5)).is_none());
        assert!(checkpoint.resume_plan(&graph, Duration::from_secs(60)).is_some());
    }

    #[test]
    fn manager_respects_interval() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(
            dir.path().join("cp.json"),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        let checkpoint =
            Checkpoint::new("build-1", ContentHash::of(b"g"), vec![], vec![], vec![]);
        assert!(manager.maybe_write(&checkpoint).unwrap());
        assert!(!manager.maybe_write(&checkpoint).unwrap());
        manager.force_write(&checkpoint).unwrap();
        assert!(manager.load().is_some());
        manager.clear();
        assert!(manager.load().is_none());
    }
}
