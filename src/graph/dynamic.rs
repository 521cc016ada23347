//! Graph extension during a build.
//!
//! Executing nodes may propose additions: new nodes and edges discovered
//! mid-build (e.g. a codegen step that produces further compilable targets).
//! Proposals queue up and are applied between scheduling batches, after the
//! discoverer completed successfully. A violating proposal is rejected as a
//! whole with [`BuildError::DiscoveryRejected`]; the graph is never left in a
//! partially-extended state.

use super::{BuildGraph, NodeId, NodeStatus};
use crate::{
    error::{BuildError, Result},
    target::{Target, TargetId},
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

/// A proposed graph extension submitted by an executing node.
#[derive(Clone, Debug)]
pub struct Discovery {
    pub discoverer: TargetId,
    /// Targets to add; each becomes a new node depending on the discoverer.
    pub nodes: Vec<Target>,
    /// Additional edges in execution order: `(from, to)` means `to` runs
    /// after `from`. `to` must be a discovered node; `from` may be the
    /// discoverer, another discovered node or a not-yet-completed existing
    /// node.
    pub edges: Vec<(TargetId, TargetId)>,
}

/// [`BuildGraph`] plus a queue of pending discoveries.
#[derive(Debug, Default)]
pub struct DynamicBuildGraph {
    graph: BuildGraph,
    pending: Mutex<Vec<Discovery>>,
}

impl DynamicBuildGraph {
    pub fn new(graph: BuildGraph) -> Self {
        Self { graph, pending: Mutex::new(Vec::new()) }
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    /// Queues a discovery; validation happens on application.
    pub fn submit_discovery(&self, discovery: Discovery) {
        trace!(
            discoverer = %discovery.discoverer,
            nodes = discovery.nodes.len(),
            edges = discovery.edges.len(),
            "discovery submitted"
        );
        self.pending.lock().unwrap().push(discovery);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    /// Applies all queued discoveries whose discoverer completed
    /// successfully and returns the targets of newly-ready nodes plus the
    /// added targets.
    ///
    /// Discoveries from failed discoverers are dropped; discoveries from
    /// still-running discoverers stay queued for the next application.
    pub fn apply_discoveries(&self) -> Result<AppliedDiscoveries> {
        let mut queue: Vec<Discovery> =
            std::mem::take(&mut *self.pending.lock().unwrap());
        let mut applied = AppliedDiscoveries::default();

        let mut keep = Vec::new();
        for discovery in queue.drain(..) {
            let Some(discoverer_id) = self.graph.node_id(&discovery.discoverer) else {
                return Err(BuildError::DiscoveryRejected {
                    discoverer: discovery.discoverer.to_string(),
                    reason: "unknown discoverer".into(),
                });
            };
            match self.graph.node(discoverer_id).status() {
                NodeStatus::Success | NodeStatus::Cached => {
                    self.apply_one(&discovery, &mut applied)?;
                }
                NodeStatus::Failed => {
                    debug!(discoverer = %discovery.discoverer, "dropping discovery of failed node");
                }
                _ => keep.push(discovery),
            }
        }
        *self.pending.lock().unwrap() = keep;
        Ok(applied)
    }

    /// Validates and applies a single discovery.
    fn apply_one(&self, discovery: &Discovery, applied: &mut AppliedDiscoveries) -> Result<()> {
        let reject = |reason: String| BuildError::DiscoveryRejected {
            discoverer: discovery.discoverer.to_string(),
            reason,
        };

        let discovered: HashSet<&TargetId> =
            discovery.nodes.iter().map(|target| &target.id).collect();
        if discovered.len() != discovery.nodes.len() {
            return Err(reject("duplicate node in discovery".into()));
        }

        for target in &discovery.nodes {
            if self.graph.node_id(&target.id).is_some() {
                return Err(reject(format!("node `{}` already exists", target.id)));
            }
        }

        // edges may only point to discovered nodes, from the discoverer,
        // other discovered nodes or not-yet-completed existing nodes
        for (from, to) in &discovery.edges {
            if !discovered.contains(to) {
                return Err(reject(format!(
                    "edge target `{to}` is not a discovered node"
                )));
            }
            if discovered.contains(from) || from == &discovery.discoverer {
                continue;
            }
            match self.graph.node_id(from) {
                Some(id) if !self.graph.node(id).status().is_done() => {}
                Some(_) => {
                    return Err(reject(format!(
                        "edge source `{from}` already completed"
                    )))
                }
                None => return Err(reject(format!("edge source `{from}` is unknown"))),
            }
        }

        // acyclicity among the discovered subgraph; edges into discovered
        // nodes from the existing graph cannot close a cycle because no edge
        // may leave the discovered set toward existing nodes
        self.check_discovered_acyclic(discovery, &reject)?;

        // all checks passed, extend the graph
        let mut ids: HashMap<&TargetId, NodeId> = HashMap::new();
        let discoverer_id = self.graph.node_id(&discovery.discoverer).unwrap();
        for target in &discovery.nodes {
            let id = self.graph.add_target(target.id.clone())?;
            ids.insert(&target.id, id);
            applied.added.push(target.clone());
            // provenance edge; the discoverer already completed so it
            // contributes no pending count
            self.graph.add_dependency(id, discoverer_id)?;
        }

        // a dependency edge `to → from` for every execution-order pair;
        // edges whose `from` is the completed discoverer are inert
        for (from, to) in &discovery.edges {
            if from == &discovery.discoverer {
                continue;
            }
            let to_id = ids[to];
            let from_id = match ids.get(from) {
                Some(id) => *id,
                None => self.graph.node_id(from).unwrap(),
            };
            self.graph.add_dependency(to_id, from_id)?;
        }

        // counters of new nodes: gated by discovered deps and by existing
        // not-yet-completed deps, never by the discoverer
        for target in &discovery.nodes {
            let id = ids[&target.id];
            let node = self.graph.node(id);
            let gating = discovery
                .edges
                .iter()
                .filter(|(from, to)| to == &target.id && from != &discovery.discoverer)
                .count();
            node.pending_raw().store(gating, std::sync::atomic::Ordering::Release);
            if gating == 0 {
                applied.ready.push(target.id.clone());
            }
        }

        debug_assert!(self.graph.topological_sort().is_ok());
        crate::report::get_default(|r| {
            r.on_discovery_applied(&discovery.discoverer, discovery.nodes.len())
        });
        Ok(())
    }

    fn check_discovered_acyclic(
        &self,
        discovery: &Discovery,
        reject: &impl Fn(String) -> BuildError,
    ) -> Result<()> {
        let ids: HashMap<&TargetId, usize> = discovery
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, target)| (&target.id, idx))
            .collect();
        let mut in_degree = vec![0usize; discovery.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); discovery.nodes.len()];
        for (from, to) in &discovery.edges {
            if let (Some(&from), Some(&to)) = (ids.get(from), ids.get(to)) {
                in_degree[from] += 1;
                dependents[to].push(from);
            }
        }
        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(idx, _)| idx)
            .collect();
        let mut sorted = 0;
        while let Some(idx) = queue.pop_front() {
            sorted += 1;
            for &dependent in &dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        if sorted != discovery.nodes.len() {
            return Err(reject("discovered nodes form a cycle".into()));
        }
        Ok(())
    }
}

/// Outcome of [`DynamicBuildGraph::apply_discoveries`].
#[derive(Clone, Debug, Default)]
pub struct AppliedDiscoveries {
    /// Targets added to the graph.
    pub added: Vec<Target>,
    /// Targets whose pending counter is zero as a result, ready to schedule.
    pub ready: Vec<TargetId>,
}

impl AppliedDiscoveries {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.ready.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Language, TargetKind};
    use std::collections::BTreeMap;

    fn target(name: &str) -> Target {
        Target {
            id: TargetId::test(name),
            kind: TargetKind::Library,
            language: Language::new("python"),
            sources: Vec::new(),
            deps: Vec::new(),
            flags: Vec::new(),
            output: None,
            env: BTreeMap::new(),
            config: serde_json::Value::Null,
            timeout: None,
            effects: Vec::new(),
        }
    }

    fn graph_with_codegen() -> DynamicBuildGraph {
        let graph = BuildGraph::new();
        let codegen = graph.add_target(TargetId::test("codegen")).unwrap();
        graph.init_pending_deps();
        graph.node(codegen).try_start();
        graph.complete(codegen, NodeStatus::Success);
        DynamicBuildGraph::new(graph)
    }

    #[test]
    fn discovery_adds_ready_nodes_after_discoverer_success() {
        let dynamic = graph_with_codegen();
        dynamic.submit_discovery(Discovery {
            discoverer: TargetId::test("codegen"),
            nodes: vec![target("gen_a"), target("gen_b")],
            edges: vec![],
        });

        let applied = dynamic.apply_discoveries().unwrap();
        assert_eq!(applied.added.len(), 2);
        let mut ready = applied.ready.clone();
        ready.sort();
        assert_eq!(ready, vec![TargetId::test("gen_a"), TargetId::test("gen_b")]);
        assert_eq!(dynamic.graph().len(), 3);
    }

    #[test]
    fn edges_among_discovered_nodes_gate_readiness() {
        let dynamic = graph_with_codegen();
        dynamic.submit_discovery(Discovery {
            discoverer: TargetId::test("codegen"),
            nodes: vec![target("gen_a"), target("gen_b")],
            // gen_b runs after gen_a
            edges: vec![(TargetId::test("gen_a"), TargetId::test("gen_b"))],
        });

        let applied = dynamic.apply_discoveries().unwrap();
        assert_eq!(applied.ready, vec![TargetId::test("gen_a")]);

        let graph = dynamic.graph();
        let gen_b = graph.node_id(&TargetId::test("gen_b")).unwrap();
        assert_eq!(graph.node(gen_b).pending_deps(), 1);

        let gen_a = graph.node_id(&TargetId::test("gen_a")).unwrap();
        graph.node(gen_a).try_start();
        assert_eq!(graph.complete(gen_a, NodeStatus::Success).ready, vec![gen_b]);
    }

    #[test]
    fn cyclic_discovery_is_rejected() {
        let dynamic = graph_with_codegen();
        dynamic.submit_discovery(Discovery {
            discoverer: TargetId::test("codegen"),
            nodes: vec![target("x"), target("y")],
            edges: vec![
                (TargetId::test("x"), TargetId::test("y")),
                (TargetId::test("y"), TargetId::test("x")),
            ],
        });
        let err = dynamic.apply_discoveries().unwrap_err();
        assert!(matches!(err, BuildError::DiscoveryRejected { .. }), "{err}");
        // nothing was applied
        assert_eq!(dynamic.graph().len(), 1);
    }

    #[test]
    fn edge_to_existing_node_is_rejected() {
        let dynamic = graph_with_codegen();
        dynamic.submit_discovery(Discovery {
            discoverer: TargetId::test("codegen"),
            nodes: vec![target("gen_a")],
            // only discovered nodes may be edge targets
            edges: vec![(TargetId::test("gen_a"), TargetId::test("codegen"))],
        });
        let err = dynamic.apply_discoveries().unwrap_err();
        assert!(matches!(err, BuildError::DiscoveryRejected { .. }), "{err}");
    }

    #[test]
    fn discovery_from_running_node_stays_queued() {
        let graph = BuildGraph::new();
        let slow = graph.add_target(TargetId::test("slow")).unwrap();
        graph.init_pending_deps();
        graph.node(slow).try_start();
        let dynamic = DynamicBuildGraph::new(graph);

        dynamic.submit_discovery(Discovery {
            discoverer: TargetId::test("slow"),
            nodes: vec![target("later")],
            edges: vec![],
        });
        assert!(dynamic.apply_discoveries().unwrap().is_empty());
        assert!(dynamic.has_pending());

        dynamic.graph().complete(
            dynamic.graph().node_id(&TargetId::test("slow")).unwrap(),
            NodeStatus::Success,
        );
        let applied = dynamic.apply_discoveries().unwrap();
        assert_eq!(applied.ready, vec![TargetId::test("later")]);
        assert!(!dynamic.has_pending());
    }

    #[test]
    fn discovery_from_failed_node_is_dropped() {
        let graph = BuildGraph::new();
        let bad = graph.add_target(TargetId::test("bad")).unwrap();
        graph.init_pending_deps();
        graph.node(bad).try_start();
        graph.complete(bad, NodeStatus::Failed);
        let dynamic = DynamicBuildGraph::new(graph);

        dynamic.submit_discovery(Discovery {
            discoverer: TargetId::test("bad"),
            nodes: vec![target("never")],
            edges: vec![],
        });
        assert!(dynamic.apply_discoveries().unwrap().is_empty());
        assert!(dynamic.graph().node_id(&TargetId::test("never")).is_none());
    }
}
