//! The language handler contract.
//!
//! Handlers are the engine's external collaborators: opaque plugins that
//! compile one target. The engine knows nothing about the language beyond
//! this interface; it hands a [`BuildContext`] in by reference and receives a
//! [`BuildOutcome`] back. Handlers register during engine bootstrap, never at
//! module-load time.

pub mod command;

pub use command::CommandHandler;

use crate::{
    analyzer::{patterns, RawImport},
    cache::{inputs_hash, ActionId, CacheCoordinator},
    error::{BuildError, Result},
    graph::Discovery,
    hash::{ContentHash, FileHasher},
    target::{ActionKind, Language, Target},
    utils,
};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Everything a handler may need while building one target.
///
/// Passed by reference into every invocation; handlers must not store it.
#[derive(Debug)]
pub struct BuildContext<'a> {
    pub target: &'a Target,
    pub workspace_root: &'a Path,
    pub out_dir: &'a Path,
    pub coordinator: &'a CacheCoordinator,
    pub hasher: &'a FileHasher,
}

impl<'ctx> BuildContext<'ctx> {
    /// Starts a cached action within this target, see [`Action`].
    pub fn action<'a>(&'a self, kind: ActionKind, sub_id: impl Into<String>) -> Action<'a, 'ctx> {
        Action {
            ctx: self,
            kind,
            sub_id: sub_id.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Result of one handler invocation.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub success: bool,
    pub outputs: Vec<PathBuf>,
    /// Combined hash over the outputs; computed by the engine when `None`.
    pub output_hash: Option<ContentHash>,
    /// Human-readable compiler output, warnings included.
    pub diagnostics: Vec<String>,
    pub error: Option<BuildError>,
}

impl BuildOutcome {
    pub fn success(outputs: Vec<PathBuf>) -> Self {
        Self { success: true, outputs, ..Default::default() }
    }

    pub fn failure(error: BuildError) -> Self {
        Self { success: false, error: Some(error), ..Default::default() }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<String>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

/// A language handler, dispatched by the target's language tag.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait LanguageHandler: Send + Sync + fmt::Debug {
    fn language(&self) -> Language;

    /// The paths this target will produce.
    fn outputs(&self, target: &Target, out_dir: &Path) -> Vec<PathBuf>;

    /// Import analysis; the default delegates to the pattern backend.
    fn analyze_imports(&self, language: &Language, sources: &[PathBuf]) -> Result<Vec<RawImport>> {
        let mut imports = Vec::new();
        for source in sources {
            let content = utils::read_to_string(source)?;
            imports.extend(patterns::extract(language, &content));
        }
        Ok(imports)
    }

    /// Builds the target. Expected failures belong in the returned outcome,
    /// not in a panic.
    fn build(&self, ctx: &BuildContext<'_>) -> BuildOutcome;

    /// Additional nodes this target spawns, collected after a successful
    /// build.
    fn discovery(&self, _ctx: &BuildContext<'_>) -> Vec<Discovery> {
        Vec::new()
    }

    /// Version of the underlying tool, merged into action metadata so tool
    /// upgrades invalidate cached actions.
    fn tool_version(&self) -> Option<semver::Version> {
        None
    }
}

/// Dispatch table over language handlers, owned by the engine and populated
/// during bootstrap.
#[derive(Clone, Debug, Default)]
pub struct HandlerRegistry {
    table: HashMap<Language, Arc<dyn LanguageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn LanguageHandler>) {
        self.table.insert(handler.language(), handler);
    }

    pub fn get(&self, language: &Language) -> Option<&Arc<dyn LanguageHandler>> {
        self.table.get(language)
    }

    pub fn require(&self, language: &Language) -> Result<&Arc<dyn LanguageHandler>> {
        self.get(language).ok_or_else(|| BuildError::NoHandler(language.to_string()))
    }

    pub fn languages(&self) -> impl Iterator<Item = &Language> {
        self.table.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// A thin helper integrating per-action work with the action cache.
///
/// ```no_run
/// # use polybuild::handlers::BuildContext;
/// # use polybuild::target::ActionKind;
/// # fn demo(ctx: &BuildContext<'_>) -> polybuild::error::Result<()> {
/// let ran = ctx
///     .action(ActionKind::Compile, "main.py")
///     .metadata("compiler", "pyc 3.12")
///     .run(&[ctx.target.sources[0].clone()], vec!["out/main.pyc".into()], || {
///         // compile main.py to out/main.pyc
///         Ok(())
///     })?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Action<'a, 'ctx> {
    ctx: &'a BuildContext<'ctx>,
    kind: ActionKind,
    sub_id: String,
    metadata: BTreeMap<String, String>,
}

impl Action<'_, '_> {
    /// Adds a metadata pair. Every free parameter that can change the output
    /// must be included: compiler, optimization, target triple, feature
    /// flags.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata_map(mut self, map: impl IntoIterator<Item = (String, String)>) -> Self {
        self.metadata.extend(map);
        self
    }

    /// Runs `work` unless an identical action already produced `outputs`.
    ///
    /// Returns `true` when the work actually ran, `false` on a cache hit.
    /// Failures are recorded too, so an immediate retry within the session
    /// short-circuits.
    pub fn run(
        self,
        inputs: &[PathBuf],
        outputs: Vec<PathBuf>,
        work: impl FnOnce() -> Result<()>,
    ) -> Result<bool> {
        let mut input_hashes = Vec::with_capacity(inputs.len());
        for input in inputs {
            input_hashes.push(self.ctx.hasher.hash_file(input)?);
        }
        let hash = inputs_hash(&input_hashes, &self.metadata);
        let id = ActionId::new(self.ctx.target.id.clone(), self.kind, hash, self.sub_id);

        if let Some(entry) = self.ctx.coordinator.lookup_action(&id, &self.metadata) {
            if entry.success {
                trace!(action = %id, "action cache hit");
                return Ok(false);
            }
            return Err(BuildError::HandlerFailed {
                target: self.ctx.target.id.to_string(),
                kind: self.kind,
                message: "action failed earlier this session".into(),
            });
        }

        match work() {
            Ok(()) => {
                self.ctx.coordinator.record_action(id, self.metadata, outputs, true)?;
                Ok(true)
            }
            Err(err) => {
                self.ctx
                    .coordinator
                    .record_action(id, self.metadata, Vec::new(), false)?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::CachePolicy,
        target::{TargetId, TargetKind},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn target(dir: &Path) -> Target {
        Target {
            id: TargetId::test("lib"),
            kind: TargetKind::Library,
            language: Language::new("python"),
            sources: vec![dir.join("lib.py")],
            deps: Vec::new(),
            flags: Vec::new(),
            output: None,
            env: BTreeMap::new(),
            config: serde_json::Value::Null,
            timeout: None,
            effects: Vec::new(),
        }
    }

    #[test]
    fn action_helper_consults_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.py"), "x = 1\n").unwrap();
        let coordinator =
            CacheCoordinator::open(&CachePolicy::builder().root(dir.path().join("cache")).build());
        let hasher = FileHasher::new();
        let target = target(dir.path());
        let out = dir.path().join("out");
        let ctx = BuildContext {
            target: &target,
            workspace_root: dir.path(),
            out_dir: &out,
            coordinator: &coordinator,
            hasher: &hasher,
        };

        let runs = AtomicUsize::new(0);
        let output = dir.path().join("lib.pyc");
        let work = || {
            runs.fetch_add(1, Ordering::SeqCst);
            std::fs::write(&output, "bytecode").unwrap();
            Ok(())
        };

        let ran = ctx
            .action(ActionKind::Compile, "lib.py")
            .metadata("compiler", "pyc")
            .run(&target.sources, vec![output.clone()], work)
            .unwrap();
        assert!(ran);

        // identical action: cache hit, work not invoked again
        let ran = ctx
            .action(ActionKind::Compile, "lib.py")
            .metadata("compiler", "pyc")
            .run(&target.sources, vec![output.clone()], || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(!ran);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // changed metadata: distinct entry, work runs
        let ran = ctx
            .action(ActionKind::Compile, "lib.py")
            .metadata("compiler", "pyc")
            .metadata("opt", "3")
            .run(&target.sources, vec![output], || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(ran);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_action_short_circuits_within_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.py"), "x = 1\n").unwrap();
        let coordinator =
            CacheCoordinator::open(&CachePolicy::builder().root(dir.path().join("cache")).build());
        let hasher = FileHasher::new();
        let target = target(dir.path());
        let out = dir.path().join("out");
        let ctx = BuildContext {
            target: &target,
            workspace_root: dir.path(),
            out_dir: &out,
            coordinator: &coordinator,
            hasher: &hasher,
        };

        let err = ctx
            .action(ActionKind::Compile, "lib.py")
            .run(&target.sources, vec![], || Err(BuildError::msg("boom")))
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        // the retry is suppressed by the negative entry
        let err = ctx
            .action(ActionKind::Compile, "lib.py")
            .run(&target.sources, vec![], || unreachable!("must not rerun"))
            .unwrap_err();
        assert!(err.to_string().contains("earlier this session"), "{err}");
    }

    #[test]
    fn registry_dispatches_by_language() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(CommandHandler::new(Language::new("python"))));
        assert!(registry.get(&Language::new("python")).is_some());
        assert!(matches!(
            registry.require(&Language::new("zig")),
            Err(BuildError::NoHandler(_))
        ));
    }
}
