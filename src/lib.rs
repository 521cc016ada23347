#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

#[macro_use]
pub mod error;

pub mod analyzer;

mod build;
pub use build::{BuildOptions, BuildSummary, FailedTarget};

pub mod cache;

pub mod dsl;

pub mod executor;
pub use executor::{ExecutionResult, Executor};

pub mod graph;
pub use graph::{BuildGraph, CycleError, DynamicBuildGraph};

pub mod handlers;
pub use handlers::{BuildContext, BuildOutcome, CommandHandler, HandlerRegistry, LanguageHandler};

pub mod hash;

pub mod remote;

pub mod report;

pub mod resilience;

pub mod scheduler;
pub use scheduler::CancelToken;

pub mod target;
pub use target::{Target, TargetId, TargetKind, TargetSet};

pub mod utils;

use crate::{
    analyzer::{AstParserRegistry, ErrorPolicy},
    cache::{CacheCoordinator, CachePolicy},
    error::Result,
    hash::FileHasher,
    remote::RemoteExecutor,
    resilience::CheckpointManager,
    target::Language,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Languages the default command handler is registered for.
const DEFAULT_HANDLER_LANGUAGES: &[&str] =
    &["python", "javascript", "typescript", "go", "c", "cpp", "rust", "java"];

/// A configured build workspace; the engine's top-level handle.
///
/// ```no_run
/// use polybuild::Workspace;
///
/// let workspace = Workspace::builder().root("path/to/repo").build()?;
/// let summary = workspace.build()?;
/// assert_eq!(summary.exit_code(), 0);
/// # Ok::<(), polybuild::error::BuildError>(())
/// ```
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    out_dir: PathBuf,
    handlers: HandlerRegistry,
    ast_registry: AstParserRegistry,
    cache_policy: CachePolicy,
    analysis_policy: ErrorPolicy,
    hasher: Arc<FileHasher>,
    workers: usize,
    fail_fast: bool,
    checkpoints: bool,
    checkpoint_interval: Duration,
    checkpoint_staleness: Duration,
    remote: Option<Arc<RemoteExecutor>>,
}

impl Workspace {
    /// Convenience function to call `WorkspaceBuilder::default()`.
    pub fn builder() -> WorkspaceBuilder {
        WorkspaceBuilder::default()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn ast_registry(&self) -> &AstParserRegistry {
        &self.ast_registry
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.cache_policy
    }

    pub fn analysis_policy(&self) -> ErrorPolicy {
        self.analysis_policy
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Parses all workspace files and resolves them into a validated target
    /// set.
    pub fn load_targets(&self) -> Result<TargetSet> {
        let raw = dsl::load_workspace(&self.root)?;
        TargetSet::resolve(raw, &self.root)
    }

    /// Builds every target of the workspace.
    pub fn build(&self) -> Result<BuildSummary> {
        self.build_with(BuildOptions::default())
    }

    /// Builds the given targets plus their transitive dependencies.
    pub fn build_targets(&self, targets: &[TargetId]) -> Result<BuildSummary> {
        self.build_with(BuildOptions { targets: targets.to_vec(), ..Default::default() })
    }

    /// Builds with explicit options.
    #[instrument(skip_all, name = "workspace::build")]
    pub fn build_with(&self, options: BuildOptions) -> Result<BuildSummary> {
        build::BuildSession::new(self, options).run()
    }

    pub(crate) fn executor(&self, coordinator: Arc<CacheCoordinator>) -> Executor {
        let executor = Executor::new(
            self.handlers.clone(),
            coordinator,
            self.hasher.clone(),
            &self.root,
            &self.out_dir,
        );
        match &self.remote {
            Some(remote) => executor.with_remote(remote.clone()),
            None => executor,
        }
    }

    pub(crate) fn checkpoint_manager(&self) -> Option<CheckpointManager> {
        self.checkpoints.then(|| {
            CheckpointManager::new(
                self.out_dir.join("checkpoint.json"),
                self.checkpoint_interval,
                self.checkpoint_staleness,
            )
        })
    }
}

/// Accumulates workspace options; [`WorkspaceBuilder::build`] produces the
/// immutable [`Workspace`].
#[derive(Debug, Default)]
pub struct WorkspaceBuilder {
    root: Option<PathBuf>,
    out_dir: Option<PathBuf>,
    handlers: HandlerRegistry,
    no_default_handlers: bool,
    ast_registry: Option<AstParserRegistry>,
    cache_policy: Option<CachePolicy>,
    analysis_policy: ErrorPolicy,
    workers: usize,
    fail_fast: bool,
    checkpoints: Option<bool>,
    checkpoint_interval: Option<Duration>,
    checkpoint_staleness: Option<Duration>,
    remote: Option<Arc<RemoteExecutor>>,
}

impl WorkspaceBuilder {
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(out_dir.into());
        self
    }

    /// Registers a language handler. Handlers registered here take
    /// precedence over the default command handlers.
    pub fn handler(mut self, handler: Arc<dyn LanguageHandler>) -> Self {
        self.handlers.register(handler);
        self
    }

    /// Skips registering the default command handlers.
    pub fn no_default_handlers(mut self) -> Self {
        self.no_default_handlers = true;
        self
    }

    pub fn ast_registry(mut self, registry: AstParserRegistry) -> Self {
        self.ast_registry = Some(registry);
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    pub fn analysis_policy(mut self, policy: ErrorPolicy) -> Self {
        self.analysis_policy = policy;
        self
    }

    /// Worker count; zero means one per core.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn checkpoints(mut self, enabled: bool) -> Self {
        self.checkpoints = Some(enabled);
        self
    }

    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }

    pub fn checkpoint_staleness(mut self, staleness: Duration) -> Self {
        self.checkpoint_staleness = Some(staleness);
        self
    }

    /// Attaches a fully-composed remote executor; targets flagged `remote`
    /// are shipped through it.
    pub fn remote(mut self, remote: Arc<RemoteExecutor>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn build(self) -> Result<Workspace> {
        let Some(root) = self.root else {
            bail!("workspace root is required");
        };
        let root = utils::canonicalized(root);
        if !root.is_dir() {
            return Err(format_err!("workspace root {} is not a directory", root.display()));
        }

        let state_dir = root.join(".polybuild");
        let out_dir = self.out_dir.unwrap_or_else(|| state_dir.join("out"));

        let mut handlers = self.handlers;
        if !self.no_default_handlers {
            for language in DEFAULT_HANDLER_LANGUAGES {
                let language = Language::new(language);
                if handlers.get(&language).is_none() {
                    handlers.register(Arc::new(CommandHandler::new(language)));
                }
            }
        }

        let cache_policy = self
            .cache_policy
            .unwrap_or_else(|| CachePolicy::builder().root(state_dir.join("cache")).build());

        Ok(Workspace {
            root,
            out_dir,
            handlers,
            ast_registry: self.ast_registry.unwrap_or_else(AstParserRegistry::with_builtins),
            cache_policy,
            analysis_policy: self.analysis_policy,
            hasher: Arc::new(FileHasher::new()),
            workers: self.workers,
            fail_fast: self.fail_fast,
            checkpoints: self.checkpoints.unwrap_or(true),
            checkpoint_interval: self.checkpoint_interval.unwrap_or(Duration::from_secs(30)),
            checkpoint_staleness: self
                .checkpoint_staleness
                .unwrap_or(Duration::from_secs(24 * 3600)),
            remote: self.remote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_existing_root() {
        assert!(Workspace::builder().build().is_err());
        assert!(Workspace::builder().root("/definitely/not/here").build().is_err());
    }

    #[test]
    fn builder_defaults_are_rooted_in_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::builder().root(dir.path()).build().unwrap();
        assert!(workspace.out_dir().starts_with(workspace.root()));
        assert!(workspace.cache_policy().root.starts_with(workspace.root()));
        // default handlers cover the common languages
        assert!(workspace.handlers().get(&Language::new("python")).is_some());
    }

    #[test]
    fn no_default_handlers_leaves_registry_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::builder()
            .root(dir.path())
            .no_default_handlers()
            .handler(Arc::new(CommandHandler::new(Language::new("zig"))))
            .build()
            .unwrap();
        assert!(workspace.handlers().get(&Language::new("python")).is_none());
        assert!(workspace.handlers().get(&Language::new("zig")).is_some());
    }
}
