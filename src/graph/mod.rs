//! The runtime build graph.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]; edges store ids,
//! never pointers. Structure (nodes, edges) is mutated behind short write
//! locks during construction and discovery application; during execution only
//! each node's status and pending-dependency counter change, both atomically.

pub mod dynamic;

pub use dynamic::{Discovery, DynamicBuildGraph};

use crate::{
    error::{BuildError, Result},
    hash::{CompositeHasher, ContentHash},
    target::TargetId,
};
use itertools::Itertools;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

/// Stable arena index of a build node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Lifecycle of a node. Transitions are monotone:
/// `Pending → Building → {Success | Cached | Failed}`, with `Pending →
/// Failed` for cascading failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeStatus {
    Pending = 0,
    Building = 1,
    Success = 2,
    Cached = 3,
    Failed = 4,
}

impl NodeStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Building,
            2 => Self::Success,
            3 => Self::Cached,
            _ => Self::Failed,
        }
    }

    /// Terminal states.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Success | Self::Cached | Self::Failed)
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::Success | Self::Cached)
    }
}

/// One vertex of the build graph.
#[derive(Debug)]
pub struct BuildNode {
    pub target: TargetId,
    status: AtomicU8,
    pending: AtomicUsize,
    deps: Mutex<Vec<NodeId>>,
    dependents: Mutex<Vec<NodeId>>,
}

impl BuildNode {
    fn new(target: TargetId) -> Self {
        Self {
            target,
            status: AtomicU8::new(NodeStatus::Pending as u8),
            pending: AtomicUsize::new(0),
            deps: Mutex::new(Vec::new()),
            dependents: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn pending_deps(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn pending_raw(&self) -> &AtomicUsize {
        &self.pending
    }

    pub fn deps(&self) -> Vec<NodeId> {
        self.deps.lock().unwrap().clone()
    }

    pub fn dependents(&self) -> Vec<NodeId> {
        self.dependents.lock().unwrap().clone()
    }

    /// Claims the node for execution; only one caller wins.
    pub fn try_start(&self) -> bool {
        self.status
            .compare_exchange(
                NodeStatus::Pending as u8,
                NodeStatus::Building as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn set_terminal(&self, status: NodeStatus) -> bool {
        debug_assert!(status.is_done());
        loop {
            let current = self.status.load(Ordering::Acquire);
            if NodeStatus::from_u8(current).is_done() {
                return false;
            }
            if self
                .status
                .compare_exchange(current, status as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// A dependency cycle, rendered in edge order ending at its start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleError {
    pub cycle: Vec<TargetId>,
}

impl CycleError {
    /// `a → b → c → a`
    pub fn render(&self) -> String {
        self.cycle
            .iter()
            .chain(self.cycle.first())
            .map(TargetId::as_str)
            .join(" → ")
    }
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Arena of build nodes plus the edge set.
#[derive(Debug, Default)]
pub struct BuildGraph {
    nodes: RwLock<Vec<Arc<BuildNode>>>,
    index: RwLock<HashMap<TargetId, NodeId>>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node for `target`. O(1).
    pub fn add_target(&self, target: TargetId) -> Result<NodeId> {
        let mut index = self.index.write().unwrap();
        if index.contains_key(&target) {
            return Err(BuildError::DuplicateTarget(target.to_string()));
        }
        let mut nodes = self.nodes.write().unwrap();
        let id = NodeId(nodes.len());
        nodes.push(Arc::new(BuildNode::new(target.clone())));
        index.insert(target, id);
        Ok(id)
    }

    /// Adds the edge `from → to` (`from` depends on `to`). O(1). Rejects
    /// self-loops and records the reverse edge on `to`.
    pub fn add_dependency(&self, from: NodeId, to: NodeId) -> Result<()> {
        if from == to {
            return Err(BuildError::msg(format!(
                "self-dependency on `{}`",
                self.node(from).target
            )));
        }
        let nodes = self.nodes.read().unwrap();
        nodes[from.0].deps.lock().unwrap().push(to);
        nodes[to.0].dependents.lock().unwrap().push(from);
        Ok(())
    }

    /// O(1) node lookup.
    pub fn node(&self, id: NodeId) -> Arc<BuildNode> {
        self.nodes.read().unwrap()[id.0].clone()
    }

    pub fn node_id(&self, target: &TargetId) -> Option<NodeId> {
        self.index.read().unwrap().get(target).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        (0..self.len()).map(NodeId).collect()
    }

    /// Kahn's algorithm with deterministic tie-breaking by target id.
    ///
    /// Returns the execution order (dependencies first) or the cycle that
    /// prevents one.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>, CycleError> {
        let nodes = self.nodes.read().unwrap();
        let mut in_degree: Vec<usize> =
            nodes.iter().map(|node| node.deps.lock().unwrap().len()).collect();

        let mut ready: Vec<NodeId> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(idx, _)| NodeId(idx))
            .collect();
        ready.sort_by(|a, b| nodes[a.0].target.cmp(&nodes[b.0].target));

        let mut order = Vec::with_capacity(nodes.len());
        let mut queue: VecDeque<NodeId> = ready.into();
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for dependent in nodes[id.0].dependents.lock().unwrap().iter() {
                in_degree[dependent.0] -= 1;
                if in_degree[dependent.0] == 0 {
                    queue.push_back(*dependent);
                }
            }
        }

        if order.len() == nodes.len() {
            return Ok(order);
        }
        Err(self.find_cycle(&nodes, &in_degree))
    }

    /// DFS over the unsorted remainder to produce a concrete cycle path.
    fn find_cycle(&self, nodes: &[Arc<BuildNode>], in_degree: &[usize]) -> CycleError {
        let remaining: Vec<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(idx, _)| idx)
            .collect();

        // walk deps from any remaining node until one repeats
        let mut path: Vec<usize> = Vec::new();
        let mut seen: HashMap<usize, usize> = HashMap::new();
        let mut current = remaining[0];
        loop {
            if let Some(&at) = seen.get(&current) {
                let cycle = path[at..].iter().map(|&idx| nodes[idx].target.clone()).collect();
                return CycleError { cycle };
            }
            seen.insert(current, path.len());
            path.push(current);
            let deps = nodes[current].deps.lock().unwrap();
            current = deps
                .iter()
                .map(|id| id.0)
                .find(|idx| in_degree[*idx] > 0)
                .expect("remaining node must have an unsorted dependency");
        }
    }

    /// Sets every node's pending counter to its dependency count and returns
    /// the initially ready nodes.
    pub fn init_pending_deps(&self) -> Vec<NodeId> {
        let nodes = self.nodes.read().unwrap();
        let mut ready = Vec::new();
        for (idx, node) in nodes.iter().enumerate() {
            let deps = node.deps.lock().unwrap().len();
            node.pending.store(deps, Ordering::Release);
            if deps == 0 {
                ready.push(NodeId(idx));
            }
        }
        ready
    }

    /// Records a terminal status for `id` and propagates to dependents.
    ///
    /// On success the pending counter of every dependent is decremented
    /// atomically; dependents whose counter reached zero are returned as
    /// newly ready. On failure the transitive dependents are marked failed
    /// and returned in `cascaded`.
    pub fn complete(&self, id: NodeId, status: NodeStatus) -> Completion {
        let node = self.node(id);
        if !node.set_terminal(status) {
            return Completion::default();
        }

        let mut completion = Completion::default();
        if status.is_ok() {
            for dependent in node.dependents() {
                let dep_node = self.node(dependent);
                // the last decrementer submits the dependent
                if dep_node.pending.fetch_sub(1, Ordering::AcqRel) == 1
                    && dep_node.status() == NodeStatus::Pending
                {
                    completion.ready.push(dependent);
                }
            }
        } else {
            let mut queue = VecDeque::from(node.dependents());
            while let Some(dependent) = queue.pop_front() {
                let dep_node = self.node(dependent);
                if dep_node.set_terminal(NodeStatus::Failed) {
                    completion.cascaded.push(dependent);
                    queue.extend(dep_node.dependents());
                }
            }
        }
        completion
    }

    /// Whether all nodes reached a terminal status.
    pub fn is_done(&self) -> bool {
        self.nodes.read().unwrap().iter().all(|node| node.status().is_done())
    }

    /// Counts per status: (success, cached, failed, pending-or-building).
    pub fn tally(&self) -> (usize, usize, usize, usize) {
        let mut tally = (0, 0, 0, 0);
        for node in self.nodes.read().unwrap().iter() {
            match node.status() {
                NodeStatus::Success => tally.0 += 1,
                NodeStatus::Cached => tally.1 += 1,
                NodeStatus::Failed => tally.2 += 1,
                _ => tally.3 += 1,
            }
        }
        tally
    }

    /// Structural fingerprint over the sorted (target, deps) pairs, used to
    /// validate checkpoints against the current graph.
    pub fn fingerprint(&self) -> ContentHash {
        let nodes = self.nodes.read().unwrap();
        let mut lines: Vec<String> = nodes
            .iter()
            .map(|node| {
                let deps = node
                    .deps
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|dep| nodes[dep.0].target.as_str().to_string())
                    .sorted()
                    .join(",");
                format!("{}<-{deps}", node.target)
            })
            .collect();
        lines.sort();
        let mut hasher = CompositeHasher::new();
        for line in &lines {
            hasher.update(line);
        }
        hasher.finish()
    }
}

/// Result of completing one node.
#[derive(Debug, Default)]
pub struct Completion {
    /// Dependents whose pending counter reached zero.
    pub ready: Vec<NodeId>,
    /// Dependents transitively failed by a failed predecessor.
    pub cascaded: Vec<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> (BuildGraph, NodeId, NodeId, NodeId, NodeId) {
        // d depends on b and c, which both depend on a
        let graph = BuildGraph::new();
        let a = graph.add_target(TargetId::test("a")).unwrap();
        let b = graph.add_target(TargetId::test("b")).unwrap();
        let c = graph.add_target(TargetId::test("c")).unwrap();
        let d = graph.add_target(TargetId::test("d")).unwrap();
        graph.add_dependency(b, a).unwrap();
        graph.add_dependency(c, a).unwrap();
        graph.add_dependency(d, b).unwrap();
        graph.add_dependency(d, c).unwrap();
        (graph, a, b, c, d)
    }

    #[test]
    fn toposort_orders_dependencies_first() {
        let (graph, a, b, c, d) = diamond();
        let order = graph.topological_sort().unwrap();
        let pos = |id: NodeId| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(a) < pos(c));
        assert!(pos(b) < pos(d));
        assert!(pos(c) < pos(d));
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let graph = BuildGraph::new();
        let a = graph.add_target(TargetId::test("a")).unwrap();
        let b = graph.add_target(TargetId::test("b")).unwrap();
        let c = graph.add_target(TargetId::test("c")).unwrap();
        graph.add_dependency(a, b).unwrap();
        graph.add_dependency(b, c).unwrap();
        graph.add_dependency(c, a).unwrap();

        let err = graph.topological_sort().unwrap_err();
        assert_eq!(err.cycle.len(), 3);
        let rendered = err.render();
        // the rendered path closes the loop
        assert_eq!(rendered.matches('→').count(), 3);
        assert!(rendered.contains("//:a"), "{rendered}");
    }

    #[test]
    fn cycle_of_two_is_detected() {
        let graph = BuildGraph::new();
        let a = graph.add_target(TargetId::test("a")).unwrap();
        let b = graph.add_target(TargetId::test("b")).unwrap();
        graph.add_dependency(a, b).unwrap();
        graph.add_dependency(b, a).unwrap();
        let err = graph.topological_sort().unwrap_err();
        assert!(err.cycle.len() >= 2);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let graph = BuildGraph::new();
        let a = graph.add_target(TargetId::test("a")).unwrap();
        assert!(graph.add_dependency(a, a).is_err());
    }

    #[test]
    fn pending_counters_gate_readiness() {
        let (graph, a, b, c, d) = diamond();
        let ready = graph.init_pending_deps();
        assert_eq!(ready, vec![a]);
        assert_eq!(graph.node(d).pending_deps(), 2);

        assert!(graph.node(a).try_start());
        let completion = graph.complete(a, NodeStatus::Success);
        let mut newly = completion.ready;
        newly.sort();
        assert_eq!(newly, vec![b, c]);

        graph.node(b).try_start();
        assert!(graph.complete(b, NodeStatus::Success).ready.is_empty());
        graph.node(c).try_start();
        // last decrementer surfaces d
        assert_eq!(graph.complete(c, NodeStatus::Cached).ready, vec![d]);
    }

    #[test]
    fn failure_cascades_without_execution() {
        let (graph, a, b, c, d) = diamond();
        graph.init_pending_deps();
        graph.node(a).try_start();
        let completion = graph.complete(a, NodeStatus::Failed);
        let mut cascaded = completion.cascaded;
        cascaded.sort();
        assert_eq!(cascaded, vec![b, c, d]);
        assert_eq!(graph.node(d).status(), NodeStatus::Failed);
        // failed nodes cannot be started
        assert!(!graph.node(b).try_start());
        assert!(graph.is_done());
    }

    #[test]
    fn status_transitions_are_monotone() {
        let graph = BuildGraph::new();
        let a = graph.add_target(TargetId::test("a")).unwrap();
        let node = graph.node(a);
        assert!(node.try_start());
        assert!(!node.try_start());
        assert!(node.set_terminal(NodeStatus::Success));
        // terminal states never change
        assert!(!node.set_terminal(NodeStatus::Failed));
        assert_eq!(node.status(), NodeStatus::Success);
    }

    #[test]
    fn fingerprint_tracks_structure() {
        let (graph, ..) = diamond();
        let (other, ..) = diamond();
        assert_eq!(graph.fingerprint(), other.fingerprint());

        let extra = other.add_target(TargetId::test("e")).unwrap();
        other.add_dependency(extra, other.node_id(&TargetId::test("a")).unwrap()).unwrap();
        assert_ne!(graph.fingerprint(), other.fingerprint());
    }

    #[test]
    fn duplicate_target_rejected() {
        let graph = BuildGraph::new();
        graph.add_target(TargetId::test("a")).unwrap();
        assert!(graph.add_target(TargetId::test("a")).is_err());
    }
}
