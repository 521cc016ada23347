//! Executes one build node: cache first, handler second.

use crate::{
    cache::{CacheCoordinator, TargetFingerprint},
    error::{BuildError, Result},
    graph::{Discovery, NodeStatus},
    handlers::{BuildContext, HandlerRegistry},
    hash::{ContentHash, FileHasher},
    report,
    target::{ActionKind, Target, TargetId},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

/// Result of executing one node, consumed by the session to transition the
/// node and extend the graph.
#[derive(Debug)]
pub struct ExecutionResult {
    pub target: TargetId,
    pub status: NodeStatus,
    pub duration: Duration,
    pub output_hash: Option<ContentHash>,
    pub outputs: Vec<PathBuf>,
    pub diagnostics: Vec<String>,
    pub error: Option<BuildError>,
    pub discoveries: Vec<Discovery>,
}

impl ExecutionResult {
    fn failed(target: &TargetId, error: BuildError, duration: Duration) -> Self {
        Self {
            target: target.clone(),
            status: NodeStatus::Failed,
            duration,
            output_hash: None,
            outputs: Vec::new(),
            diagnostics: Vec::new(),
            error: Some(error),
            discoveries: Vec::new(),
        }
    }
}

/// Stateless executor shared by all workers.
#[derive(Debug)]
pub struct Executor {
    registry: HandlerRegistry,
    coordinator: Arc<CacheCoordinator>,
    hasher: Arc<FileHasher>,
    workspace_root: PathBuf,
    out_dir: PathBuf,
    remote: Option<Arc<crate::remote::RemoteExecutor>>,
}

impl Executor {
    pub fn new(
        registry: HandlerRegistry,
        coordinator: Arc<CacheCoordinator>,
        hasher: Arc<FileHasher>,
        workspace_root: &Path,
        out_dir: &Path,
    ) -> Self {
        Self {
            registry,
            coordinator,
            hasher,
            workspace_root: workspace_root.to_path_buf(),
            out_dir: out_dir.to_path_buf(),
            remote: None,
        }
    }

    /// Enables remote execution for targets flagged `remote`.
    pub fn with_remote(mut self, remote: Arc<crate::remote::RemoteExecutor>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }

    /// Builds one target. `dep_outputs` carries the output hash of every
    /// direct dependency, in dependency order; those builds happened before
    /// this call (happens-before through the scheduler).
    pub fn execute(
        &self,
        target: &Target,
        dep_outputs: &[(TargetId, ContentHash)],
    ) -> ExecutionResult {
        let started = Instant::now();

        let fingerprint = match TargetFingerprint::compute(target, &self.hasher, dep_outputs) {
            Ok(fingerprint) => fingerprint,
            Err(err) => return ExecutionResult::failed(&target.id, err, started.elapsed()),
        };

        // 1. the coarse cache short-circuits the handler entirely
        if self.coordinator.is_cached(&target.id, &fingerprint, &self.hasher) {
            report::get_default(|r| r.on_node_cached(&target.id));
            return ExecutionResult {
                target: target.id.clone(),
                status: NodeStatus::Cached,
                duration: started.elapsed(),
                output_hash: self.coordinator.output_hash(&target.id),
                outputs: Vec::new(),
                diagnostics: Vec::new(),
                error: None,
                discoveries: Vec::new(),
            };
        }

        let ctx = BuildContext {
            target,
            workspace_root: &self.workspace_root,
            out_dir: &self.out_dir,
            coordinator: &self.coordinator,
            hasher: &self.hasher,
        };

        // 2. remote targets bypass the local handler entirely
        if target.is_remote() {
            if let Some(remote) = &self.remote {
                report::get_default(|r| r.on_node_started(&target.id));
                let outcome = match remote.execute(
                    target,
                    &self.hasher,
                    &self.workspace_root,
                    &self.out_dir,
                ) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        report::get_default(|r| {
                            r.on_node_finished(&target.id, false, started.elapsed())
                        });
                        return ExecutionResult::failed(&target.id, err, started.elapsed());
                    }
                };
                let result = self.finish(target, &ctx, fingerprint, outcome, started);
                report::get_default(|r| {
                    r.on_node_finished(&target.id, result.status.is_ok(), result.duration)
                });
                return result;
            }
            trace!(target = %target.id, "remote flag set but no remote executor, building locally");
        }

        // 3. dispatch to the language handler
        let handler = match self.registry.require(&target.language) {
            Ok(handler) => handler,
            Err(err) => return ExecutionResult::failed(&target.id, err, started.elapsed()),
        };

        report::get_default(|r| r.on_node_started(&target.id));

        // a panicking handler is an execution failure, not an engine crash
        let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler.build(&ctx)
        })) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".into());
                let err = BuildError::HandlerFailed {
                    target: target.id.to_string(),
                    kind: ActionKind::Custom,
                    message,
                };
                report::get_default(|r| r.on_node_finished(&target.id, false, started.elapsed()));
                return ExecutionResult::failed(&target.id, err, started.elapsed());
            }
        };

        let result = self.finish(target, &ctx, fingerprint, outcome, started);
        report::get_default(|r| {
            r.on_node_finished(&target.id, result.status.is_ok(), result.duration)
        });
        result
    }

    /// Validates the outcome, records the target cache entry and collects
    /// discoveries.
    fn finish(
        &self,
        target: &Target,
        ctx: &BuildContext<'_>,
        fingerprint: TargetFingerprint,
        outcome: crate::handlers::BuildOutcome,
        started: Instant,
    ) -> ExecutionResult {
        if !outcome.success {
            let error = outcome.error.unwrap_or_else(|| BuildError::HandlerFailed {
                target: target.id.to_string(),
                kind: ActionKind::Custom,
                message: "handler reported failure".into(),
            });
            let mut result = ExecutionResult::failed(&target.id, error, started.elapsed());
            result.diagnostics = outcome.diagnostics;
            return result;
        }

        // success without outputs on disk is a lie worth failing loudly on
        for output in &outcome.outputs {
            if !output.exists() {
                return ExecutionResult::failed(
                    &target.id,
                    BuildError::MissingOutput {
                        target: target.id.to_string(),
                        output: output.clone(),
                    },
                    started.elapsed(),
                );
            }
        }

        let output_hash = match outcome.output_hash {
            Some(hash) => hash,
            None => {
                match self.hasher.hash_files(outcome.outputs.iter().map(PathBuf::as_path)) {
                    Ok(hash) => hash,
                    Err(err) => {
                        return ExecutionResult::failed(&target.id, err, started.elapsed())
                    }
                }
            }
        };

        self.coordinator.update(&target.id, &fingerprint, output_hash, outcome.outputs.clone());

        // remote targets may have no local handler, hence no discoveries
        let discoveries = self
            .registry
            .get(&target.language)
            .map(|handler| handler.discovery(ctx))
            .unwrap_or_default();

        ExecutionResult {
            target: target.id.clone(),
            status: NodeStatus::Success,
            duration: started.elapsed(),
            output_hash: Some(output_hash),
            outputs: outcome.outputs,
            diagnostics: outcome.diagnostics,
            error: None,
            discoveries,
        }
    }

    /// Collects dependency output hashes for `target` from the coordinator.
    pub fn dep_outputs(&self, target: &Target) -> Result<Vec<(TargetId, ContentHash)>> {
        let mut outputs = Vec::with_capacity(target.deps.len());
        for dep in &target.deps {
            let hash = self.coordinator.output_hash(dep).unwrap_or(ContentHash::ZERO);
            outputs.push((dep.clone(), hash));
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::CachePolicy,
        handlers::{BuildOutcome, LanguageHandler},
        target::{Language, TargetKind},
    };
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// Writes the target name into its single output file.
    #[derive(Debug)]
    struct RecordingHandler {
        invocations: Arc<AtomicUsize>,
        fail: bool,
        lie_about_outputs: bool,
    }

    impl LanguageHandler for RecordingHandler {
        fn language(&self) -> Language {
            Language::new("text")
        }

        fn outputs(&self, target: &Target, out_dir: &Path) -> Vec<PathBuf> {
            vec![out_dir.join(target.id.name())]
        }

        fn build(&self, ctx: &BuildContext<'_>) -> BuildOutcome {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return BuildOutcome::failure(BuildError::msg("synthetic failure"))
                    .with_diagnostics(vec!["error: synthetic".into()]);
            }
            let output = self.outputs(ctx.target, ctx.out_dir).remove(0);
            if !self.lie_about_outputs {
                crate::utils::write_file(&output, ctx.target.id.name()).unwrap();
            }
            BuildOutcome::success(vec![output])
        }
    }

    fn fixture(
        dir: &Path,
        fail: bool,
        lie: bool,
    ) -> (Executor, Target, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(RecordingHandler {
            invocations: invocations.clone(),
            fail,
            lie_about_outputs: lie,
        }));
        let coordinator = Arc::new(CacheCoordinator::open(
            &CachePolicy::builder().root(dir.join("cache")).build(),
        ));
        let executor = Executor::new(
            registry,
            coordinator,
            Arc::new(FileHasher::new()),
            dir,
            &dir.join("out"),
        );

        let source = dir.join("a.txt");
        std::fs::write(&source, "content").unwrap();
        let target = Target {
            id: TargetId::test("a"),
            kind: TargetKind::Library,
            language: Language::new("text"),
            sources: vec![source],
            deps: Vec::new(),
            flags: Vec::new(),
            output: None,
            env: BTreeMap::new(),
            config: serde_json::Value::Null,
            timeout: None,
            effects: Vec::new(),
        };
        (executor, target, invocations)
    }

    #[test]
    fn second_execution_is_cached_without_invoking_handler() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, target, invocations) = fixture(dir.path(), false, false);

        let first = executor.execute(&target, &[]);
        assert_eq!(first.status, NodeStatus::Success);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        let second = executor.execute(&target, &[]);
        assert_eq!(second.status, NodeStatus::Cached);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(second.output_hash, first.output_hash);
    }

    #[test]
    fn source_change_invalidates_target_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, target, invocations) = fixture(dir.path(), false, false);

        executor.execute(&target, &[]);
        std::fs::write(&target.sources[0], "changed content").unwrap();
        let result = executor.execute(&target, &[]);
        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dep_hash_change_invalidates_target_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, target, invocations) = fixture(dir.path(), false, false);

        let dep = TargetId::test("dep");
        executor.execute(&target, &[(dep.clone(), ContentHash::of(b"v1"))]);
        let result = executor.execute(&target, &[(dep, ContentHash::of(b"v2"))]);
        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_carries_diagnostics_and_code() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, target, _) = fixture(dir.path(), true, false);
        let result = executor.execute(&target, &[]);
        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(result.diagnostics, vec!["error: synthetic".to_string()]);
        assert!(result.error.is_some());
    }

    #[test]
    fn missing_output_after_success_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, target, _) = fixture(dir.path(), false, true);
        let result = executor.execute(&target, &[]);
        assert_eq!(result.status, NodeStatus::Failed);
        assert!(matches!(result.error, Some(BuildError::MissingOutput { .. })));
    }

    #[test]
    fn unknown_language_fails_without_handler() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, mut target, _) = fixture(dir.path(), false, false);
        target.language = Language::new("fortran");
        let result = executor.execute(&target, &[]);
        assert!(matches!(result.error, Some(BuildError::NoHandler(_))));
    }

    #[test]
    fn panicking_handler_is_captured() {
        #[derive(Debug)]
        struct PanickingHandler;
        impl LanguageHandler for PanickingHandler {
            fn language(&self) -> Language {
                Language::new("text")
            }
            fn outputs(&self, _: &Target, _: &Path) -> Vec<PathBuf> {
                Vec::new()
            }
            fn build(&self, _: &BuildContext<'_>) -> BuildOutcome {
                panic!("handler exploded");
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (_base, target, _) = fixture(dir.path(), false, false);
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(PanickingHandler));
        let executor = Executor::new(
            registry,
            Arc::new(CacheCoordinator::open(
                &CachePolicy::builder().root(dir.path().join("cache2")).build(),
            )),
            Arc::new(FileHasher::new()),
            dir.path(),
            &dir.path().join("out"),
        );
        let result = executor.execute(&target, &[]);
        assert_eq!(result.status, NodeStatus::Failed);
        let message = result.error.unwrap().to_string();
        assert!(message.contains("handler exploded"), "{message}");
    }
}
