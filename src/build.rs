//! Drives a build session to completion.
//!
//! The session is a small state machine in the spirit of a compiler
//! pipeline: configuration (parse, resolve, analyze, graph) happens up
//! front and fails the whole build with a configuration error; execution
//! then walks the graph in dependency order, a batch of ready nodes at a
//! time, feeding discoveries back between batches and checkpointing
//! progress. Failures cascade to dependents but do not stop the session
//! unless `fail_fast` is set.

use crate::{
    analyzer::DependencyAnalyzer,
    cache::CacheCoordinator,
    error::{BuildError, Result},
    executor::ExecutionResult,
    graph::{BuildGraph, DynamicBuildGraph, NodeId, NodeStatus},
    hash::{short_id, ContentHash},
    report,
    resilience::Checkpoint,
    scheduler::{CancelToken, Scheduler, WaitOutcome},
    target::{ActionKind, Target, TargetId, TargetSet},
    Workspace,
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Per-build options.
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    /// Build only these targets (plus their transitive deps); all when empty.
    pub targets: Vec<TargetId>,
    /// Stop scheduling after the first failure.
    pub fail_fast: bool,
    /// External cancellation handle; the session creates its own when absent.
    pub cancel: Option<CancelToken>,
}

/// One failed target with everything a user needs to act on it.
#[derive(Clone, Debug)]
pub struct FailedTarget {
    pub target: TargetId,
    pub kind: ActionKind,
    /// Machine-parseable diagnostic code, see [`BuildError::code`].
    pub code: &'static str,
    pub message: String,
    pub diagnostics: Vec<String>,
}

/// Aggregate result of one session.
#[derive(Debug, Default)]
pub struct BuildSummary {
    pub built: Vec<TargetId>,
    pub cached: Vec<TargetId>,
    pub failed: Vec<FailedTarget>,
    /// Targets never executed because a dependency failed.
    pub skipped: Vec<TargetId>,
    pub duration: Duration,
    pub cancelled: bool,
    /// Completed targets carried over from a valid checkpoint.
    pub resumed: usize,
}

impl BuildSummary {
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed.is_empty() && self.skipped.is_empty()
    }

    /// 0 = everything built or cached, 1 = failures, 3 = cancelled.
    /// Configuration errors never reach a summary; they surface as an `Err`
    /// whose [`BuildError::exit_code`] is 2.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            3
        } else if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Terminal rendering of all failures, first lines of output included.
    pub fn render_failures(&self) -> String {
        self.failed
            .iter()
            .map(|failure| {
                report::render_failure(
                    &failure.target,
                    failure.kind,
                    failure.code,
                    &failure.diagnostics.join("\n"),
                    64,
                )
            })
            .collect()
    }
}

/// The running session; one per [`Workspace::build`] call.
pub(crate) struct BuildSession<'a> {
    workspace: &'a Workspace,
    options: BuildOptions,
}

impl<'a> BuildSession<'a> {
    pub(crate) fn new(workspace: &'a Workspace, options: BuildOptions) -> Self {
        Self { workspace, options }
    }

    pub(crate) fn run(self) -> Result<BuildSummary> {
        let started = Instant::now();
        let configured = self.configure()?;
        let mut summary = configured.execute()?;
        summary.duration = started.elapsed();
        Ok(summary)
    }

    /// Configuration: parse + resolve + analyze + graph. All errors here are
    /// workspace configuration errors (exit code 2).
    fn configure(self) -> Result<ConfiguredState<'a>> {
        let workspace = self.workspace;
        trace!(root = %workspace.root().display(), "configuring build session");

        let targets = workspace.load_targets()?;
        let selected = select_targets(&targets, &self.options.targets)?;

        // analysis adds implicit edges; a target whose analysis fails is
        // pre-failed and cascades like any execution failure
        let analyzer = DependencyAnalyzer::new(
            workspace.ast_registry(),
            &targets,
            workspace.root(),
        )
        .with_policy(workspace.analysis_policy());

        let mut implicit: HashMap<TargetId, Vec<TargetId>> = HashMap::new();
        let mut pre_failed: Vec<(TargetId, BuildError)> = Vec::new();
        for id in &selected {
            let target = targets.get(id).expect("selected target exists");
            match analyzer.analyze(target) {
                Ok(analysis) => {
                    for warning in &analysis.warnings {
                        warn!(target = %id, warning, "analysis warning");
                    }
                    implicit.insert(
                        id.clone(),
                        analysis
                            .implicit_deps
                            .into_iter()
                            .filter(|dep| selected.contains(dep))
                            .collect(),
                    );
                }
                Err(err) => pre_failed.push((id.clone(), err)),
            }
        }

        let graph = BuildGraph::new();
        for id in &selected {
            graph.add_target(id.clone())?;
        }
        for id in &selected {
            let target = targets.get(id).expect("selected target exists");
            let node = graph.node_id(id).expect("node added above");
            let deps = target
                .deps
                .iter()
                .filter(|dep| selected.contains(*dep))
                .chain(implicit.get(id).into_iter().flatten());
            for dep in deps {
                let dep_node = graph
                    .node_id(dep)
                    .ok_or_else(|| BuildError::UnresolvedDependency {
                        from: id.to_string(),
                        dep: dep.to_string(),
                    })?;
                if node != dep_node {
                    graph.add_dependency(node, dep_node)?;
                }
            }
        }

        if let Err(cycle) = graph.topological_sort() {
            return Err(BuildError::Cycle(cycle));
        }

        Ok(ConfiguredState {
            workspace,
            options: self.options,
            targets,
            graph: DynamicBuildGraph::new(graph),
            pre_failed,
        })
    }
}

/// State after successful configuration; owns the graph and drives
/// execution.
struct ConfiguredState<'a> {
    workspace: &'a Workspace,
    options: BuildOptions,
    targets: TargetSet,
    graph: DynamicBuildGraph,
    pre_failed: Vec<(TargetId, BuildError)>,
}

impl ConfiguredState<'_> {
    fn execute(self) -> Result<BuildSummary> {
        let ConfiguredState { workspace, options, targets, graph, pre_failed } = self;

        let coordinator = Arc::new(CacheCoordinator::open(workspace.cache_policy()));
        let executor = Arc::new(workspace.executor(coordinator.clone()));
        let cancel = options.cancel.clone().unwrap_or_default();
        let scheduler = Scheduler::new(workspace.workers(), cancel.clone());
        let fail_fast = options.fail_fast || workspace.fail_fast();

        let build_id = short_id([
            workspace.root().to_string_lossy().as_ref(),
            &graph.graph().fingerprint().to_hex(),
        ]);
        let checkpoints = workspace.checkpoint_manager();
        let mut summary = BuildSummary::default();

        if let Some(manager) = &checkpoints {
            if let Some(plan) = manager
                .load()
                .and_then(|cp| cp.resume_plan(graph.graph(), manager.staleness()))
            {
                debug!(
                    completed = plan.completed,
                    remaining = plan.remaining.len(),
                    "resuming from checkpoint"
                );
                summary.resumed = plan.completed;
            }
        }

        // per-session output hashes, the dependency fingerprints of dependents
        let output_hashes: Arc<Mutex<HashMap<TargetId, ContentHash>>> =
            Arc::new(Mutex::new(HashMap::new()));
        // targets added by discoveries live alongside the static set
        let mut dynamic_targets: HashMap<TargetId, Arc<Target>> = HashMap::new();
        let mut errors: HashMap<TargetId, (BuildError, Vec<String>)> = HashMap::new();

        // pre-failed targets cascade before anything is scheduled
        for (id, err) in pre_failed {
            let node = graph.graph().node_id(&id).expect("pre-failed target is in the graph");
            let completion = graph.graph().complete(node, NodeStatus::Failed);
            for cascaded in &completion.cascaded {
                summary.skipped.push(graph.graph().node(*cascaded).target.clone());
            }
            report::get_default(|r| r.on_cascade(&id, completion.cascaded.len()));
            errors.insert(id, (err, Vec::new()));
        }

        scheduler.submit_all(graph.graph().init_pending_deps().into_iter().filter(|id| {
            graph.graph().node(*id).status() == NodeStatus::Pending
        }));

        let batch_limit = scheduler.worker_count() * 2;
        let mut cancelled = false;
        let mut fail_fast_hit = false;

        loop {
            match scheduler.wait_for_ready() {
                WaitOutcome::Idle => {
                    // discoveries can wake an otherwise finished session
                    let applied = graph.apply_discoveries()?;
                    if applied.is_empty() {
                        break;
                    }
                    for target in applied.added {
                        dynamic_targets.insert(target.id.clone(), Arc::new(target));
                    }
                    for id in applied.ready {
                        let node = graph.graph().node_id(&id).expect("discovered node");
                        scheduler.submit(node);
                    }
                    continue;
                }
                WaitOutcome::Cancelled => {
                    cancelled = true;
                    break;
                }
                WaitOutcome::Ready => {}
            }

            let claimed = scheduler.dequeue_ready(batch_limit);
            let mut batch: Vec<(NodeId, Arc<Target>, Vec<(TargetId, ContentHash)>)> = Vec::new();
            for node_id in claimed {
                let node = graph.graph().node(node_id);
                if !node.try_start() {
                    // cascaded to failed after it became ready
                    continue;
                }
                let target = match targets.get(&node.target) {
                    Some(target) => Arc::new(target.clone()),
                    None => match dynamic_targets.get(&node.target) {
                        Some(target) => target.clone(),
                        None => {
                            return Err(BuildError::Invariant(format!(
                                "node `{}` has no target record",
                                node.target
                            )))
                        }
                    },
                };
                let hashes = output_hashes.lock().unwrap();
                let dep_outputs = target
                    .deps
                    .iter()
                    .filter_map(|dep| {
                        hashes.get(dep).map(|hash| (dep.clone(), *hash))
                    })
                    .collect();
                drop(hashes);
                batch.push((node_id, target, dep_outputs));
            }
            if batch.is_empty() {
                continue;
            }

            let batch_executor = executor.clone();
            let results: Vec<(NodeId, ExecutionResult)> = scheduler.execute_batch(
                batch,
                move |(node_id, target, dep_outputs): (
                    NodeId,
                    Arc<Target>,
                    Vec<(TargetId, ContentHash)>,
                )| {
                    (node_id, batch_executor.execute(&target, &dep_outputs))
                },
            );

            for (node_id, result) in results {
                if let Some(hash) = result.output_hash {
                    output_hashes.lock().unwrap().insert(result.target.clone(), hash);
                }
                for discovery in result.discoveries {
                    graph.submit_discovery(discovery);
                }

                let completion = graph.graph().complete(node_id, result.status);
                match result.status {
                    NodeStatus::Success => summary.built.push(result.target.clone()),
                    NodeStatus::Cached => summary.cached.push(result.target.clone()),
                    NodeStatus::Failed => {
                        for cascaded in &completion.cascaded {
                            summary.skipped.push(graph.graph().node(*cascaded).target.clone());
                        }
                        report::get_default(|r| {
                            r.on_cascade(&result.target, completion.cascaded.len())
                        });
                        errors.insert(
                            result.target.clone(),
                            (
                                result.error.unwrap_or_else(|| {
                                    BuildError::msg("handler reported failure")
                                }),
                                result.diagnostics,
                            ),
                        );
                        if fail_fast {
                            debug!(target = %result.target, "fail-fast triggered");
                            fail_fast_hit = true;
                            cancel.cancel();
                        }
                    }
                    status => {
                        return Err(BuildError::Invariant(format!(
                            "executor returned non-terminal status {status:?}"
                        )))
                    }
                }
                scheduler.submit_all(completion.ready);
            }

            let applied = graph.apply_discoveries()?;
            for target in applied.added {
                dynamic_targets.insert(target.id.clone(), Arc::new(target));
            }
            for id in applied.ready {
                let node = graph.graph().node_id(&id).expect("discovered node");
                scheduler.submit(node);
            }

            if let Some(manager) = &checkpoints {
                let _ = manager.maybe_write(&self::checkpoint_of(
                    &build_id,
                    graph.graph(),
                    &summary,
                ));
            }
        }

        // failed targets carry their error into the summary
        for (target, (err, diagnostics)) in errors {
            summary.failed.push(FailedTarget {
                kind: match &err {
                    BuildError::HandlerFailed { kind, .. } => *kind,
                    _ => ActionKind::Custom,
                },
                code: err.code(),
                message: err.to_string(),
                diagnostics,
                target,
            });
        }
        // a fail-fast stop is a failure, not a user cancellation
        summary.cancelled = cancelled && !fail_fast_hit;

        // nodes never reached count as skipped
        if cancelled || fail_fast_hit {
            for id in graph.graph().node_ids() {
                let node = graph.graph().node(id);
                if !node.status().is_done() {
                    summary.skipped.push(node.target.clone());
                }
            }
        }
        summary.failed.sort_by(|a, b| a.target.cmp(&b.target));
        summary.skipped.sort();
        summary.skipped.dedup();

        coordinator.flush()?;
        if let Some(manager) = &checkpoints {
            if summary.is_success() {
                manager.clear();
            } else {
                // the checkpoint written on the way out is what resume reads
                let _ = manager.force_write(&self::checkpoint_of(
                    &build_id,
                    graph.graph(),
                    &summary,
                ));
            }
        }
        scheduler.shutdown();

        debug!(
            built = summary.built.len(),
            cached = summary.cached.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            cancelled,
            "session finished"
        );
        Ok(summary)
    }
}

fn checkpoint_of(build_id: &str, graph: &BuildGraph, summary: &BuildSummary) -> Checkpoint {
    Checkpoint::new(
        build_id,
        graph.fingerprint(),
        summary.built.clone(),
        summary.cached.clone(),
        summary.failed.iter().map(|failure| failure.target.clone()).collect(),
    )
}

/// The requested targets plus their transitive dependency closure; all
/// targets when the request is empty.
fn select_targets(targets: &TargetSet, requested: &[TargetId]) -> Result<BTreeSet<TargetId>> {
    if requested.is_empty() {
        return Ok(targets.ids().cloned().collect());
    }
    let mut selected = BTreeSet::new();
    let mut queue: Vec<&TargetId> = Vec::new();
    for id in requested {
        if !targets.contains(id) {
            return Err(BuildError::UnresolvedDependency {
                from: "<requested>".into(),
                dep: id.to_string(),
            });
        }
        queue.push(id);
    }
    while let Some(id) = queue.pop() {
        if !selected.insert(id.clone()) {
            continue;
        }
        let target = targets.get(id).expect("validated above");
        queue.extend(target.deps.iter());
    }
    Ok(selected)
}
