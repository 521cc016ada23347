//! Source analysis: discovers the imports of every target source and resolves
//! them to workspace targets, external dependencies or standard-library
//! names.
//!
//! Two backends coexist. When the [`AstParserRegistry`] has a grammar for the
//! target's language the AST backend is preferred; otherwise the pattern
//! backend in [`patterns`] runs. An AST parser failing on a file degrades to
//! the pattern backend for that file, it never fails the analysis.

pub mod patterns;
mod registry;

pub use registry::{
    AstParser, AstParserRegistry, FileAst, GoAstParser, PythonAstParser, RawImport, Symbol,
    SymbolKind, VisibilityRules,
};

use crate::{
    error::{BuildError, Result},
    target::{Language, Target, TargetId, TargetSet},
    utils,
};
use rayon::prelude::*;
use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

/// Classification of a discovered import.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportKind {
    /// Resolves to another workspace target; becomes an implicit edge.
    Internal,
    /// A third-party dependency; recorded but not scheduled.
    External,
    /// Part of the language's standard library; ignored.
    Stdlib,
}

/// A classified import with its source location.
#[derive(Clone, Debug)]
pub struct Import {
    pub module: String,
    pub kind: ImportKind,
    pub file: PathBuf,
    pub line: usize,
    /// The owning target for [`ImportKind::Internal`] imports.
    pub target: Option<TargetId>,
}

/// How per-file analysis errors are aggregated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// First file error fails the target.
    FailFast,
    /// All files are scanned; the target fails only if every file errored.
    #[default]
    CollectAll,
    /// Errors become warnings, analysis proceeds with partial imports.
    Continue,
}

/// Result of analyzing one target.
#[derive(Clone, Debug, Default)]
pub struct Analysis {
    pub imports: Vec<Import>,
    /// Internal imports not already covered by declared deps.
    pub implicit_deps: BTreeSet<TargetId>,
    pub warnings: Vec<String>,
}

/// Maps module-ish names to the targets that own them.
///
/// Keys are derived from every target source: the file stem, the
/// root-relative path with and without extension, and the dotted module path.
#[derive(Debug, Default)]
pub struct ModuleIndex {
    by_key: HashMap<String, TargetId>,
    by_path: HashMap<PathBuf, TargetId>,
}

impl ModuleIndex {
    pub fn build(targets: &TargetSet, root: &Path) -> Self {
        let mut index = Self::default();
        for target in targets.iter() {
            for source in &target.sources {
                index.by_path.insert(source.clone(), target.id.clone());
                let rel = utils::strip_prefix(source, root);
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                index.insert_key(rel_str.clone(), &target.id);
                if let Some(stripped) = rel_str.rsplit_once('.').map(|(p, _)| p) {
                    index.insert_key(stripped.to_string(), &target.id);
                    index.insert_key(stripped.replace('/', "."), &target.id);
                }
                if let Some(stem) = source.file_stem() {
                    index.insert_key(stem.to_string_lossy().into_owned(), &target.id);
                }
            }
        }
        index
    }

    fn insert_key(&mut self, key: String, id: &TargetId) {
        // first writer wins; resolution order is the deterministic target order
        self.by_key.entry(key).or_insert_with(|| id.clone());
    }

    /// Looks up the target owning `module`, trying the raw name, the
    /// dot-to-slash form and a resolution relative to the importing file.
    pub fn resolve(&self, module: &str, importer: &Path, root: &Path) -> Option<&TargetId> {
        if let Some(id) = self.by_key.get(module) {
            return Some(id);
        }
        if let Some(id) = self.by_key.get(&module.replace('.', "/")) {
            return Some(id);
        }
        // relative forms: `./util`, `../lib/x`, `local.h`
        if let Some(dir) = importer.parent() {
            let joined = utils::normalize_path(&dir.join(module));
            for candidate in candidate_paths(&joined) {
                if let Some(id) = self.by_path.get(&candidate) {
                    return Some(id);
                }
                let rel = utils::strip_prefix(&candidate, root).to_string_lossy().replace('\\', "/");
                if let Some(id) = self.by_key.get(&rel) {
                    return Some(id);
                }
            }
        }
        None
    }
}

/// The path itself plus common source extensions appended.
fn candidate_paths(path: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![path.to_path_buf()];
    for ext in ["py", "js", "ts", "go", "c", "h", "cc", "cpp", "rs", "java"] {
        let mut with_ext = path.as_os_str().to_os_string();
        with_ext.push(".");
        with_ext.push(ext);
        candidates.push(PathBuf::from(with_ext));
    }
    candidates
}

/// Per-language standard-library classification.
fn is_stdlib(language: &Language, module: &str) -> bool {
    match language.as_str() {
        "python" => PYTHON_STDLIB.contains(&module.split('.').next().unwrap_or(module)),
        "go" => !module.split('/').next().unwrap_or(module).contains('.'),
        "javascript" | "typescript" => {
            module.starts_with("node:") || NODE_BUILTINS.contains(&module)
        }
        "c" | "cpp" => module.starts_with('<'),
        "rust" => matches!(module.split("::").next(), Some("std" | "core" | "alloc")),
        "java" => module.starts_with("java.") || module.starts_with("javax."),
        _ => false,
    }
}

const PYTHON_STDLIB: &[&str] = &[
    "abc", "argparse", "asyncio", "base64", "collections", "contextlib", "copy", "csv",
    "dataclasses", "datetime", "enum", "functools", "glob", "hashlib", "io", "itertools", "json",
    "logging", "math", "os", "pathlib", "random", "re", "shutil", "socket", "string", "struct",
    "subprocess", "sys", "tempfile", "threading", "time", "typing", "unittest", "uuid",
];

const NODE_BUILTINS: &[&str] = &[
    "assert", "buffer", "child_process", "crypto", "events", "fs", "http", "https", "net", "os",
    "path", "process", "stream", "url", "util", "zlib",
];

/// Discovers and classifies the imports of targets.
#[derive(Debug)]
pub struct DependencyAnalyzer<'a> {
    registry: &'a AstParserRegistry,
    index: ModuleIndex,
    root: PathBuf,
    policy: ErrorPolicy,
}

impl<'a> DependencyAnalyzer<'a> {
    pub fn new(registry: &'a AstParserRegistry, targets: &TargetSet, root: &Path) -> Self {
        Self {
            registry,
            index: ModuleIndex::build(targets, root),
            root: root.to_path_buf(),
            policy: ErrorPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Analyzes all sources of `target`, aggregating per-file errors
    /// according to the configured policy.
    pub fn analyze(&self, target: &Target) -> Result<Analysis> {
        let per_file: Vec<(PathBuf, Result<Vec<RawImport>>)> = target
            .sources
            .par_iter()
            .map(|source| (source.clone(), self.scan_file(&target.language, source)))
            .collect();

        let mut analysis = Analysis::default();
        let mut errors = Vec::new();
        let total = per_file.len();

        for (file, result) in per_file {
            match result {
                Ok(raw_imports) => {
                    for raw in raw_imports {
                        analysis.imports.push(self.classify(&target.language, raw, &file));
                    }
                }
                Err(err) => match self.policy {
                    ErrorPolicy::FailFast => return Err(err),
                    ErrorPolicy::CollectAll => errors.push((file, err)),
                    ErrorPolicy::Continue => {
                        analysis.warnings.push(format!("{}: {err}", file.display()))
                    }
                },
            }
        }

        if self.policy == ErrorPolicy::CollectAll && !errors.is_empty() {
            if errors.len() == total {
                let rendered = errors
                    .iter()
                    .map(|(file, err)| format!("{}: {err}", file.display()))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(BuildError::msg(format!(
                    "analysis of `{}` failed for all {total} sources: {rendered}",
                    target.id
                )));
            }
            for (file, err) in errors {
                analysis.warnings.push(format!("{}: {err}", file.display()));
            }
        }

        for import in &analysis.imports {
            if let (ImportKind::Internal, Some(id)) = (import.kind, &import.target) {
                if *id != target.id && !target.deps.contains(id) {
                    analysis.implicit_deps.insert(id.clone());
                }
            }
        }

        trace!(
            target = %target.id,
            imports = analysis.imports.len(),
            implicit = analysis.implicit_deps.len(),
            "analyzed"
        );
        Ok(analysis)
    }

    /// Scans one file with the preferred backend.
    ///
    /// AST wins when a grammar is loaded, the pattern table is the fallback;
    /// an AST failure downgrades to patterns for this file.
    fn scan_file(&self, language: &Language, file: &Path) -> Result<Vec<RawImport>> {
        let content = utils::read_to_string(file)?;
        if self.registry.has_parser(language) {
            let ast = self.registry.parse_or_degrade(language, &content, file, || {
                patterns::extract(language, &content)
            });
            return Ok(ast.imports);
        }
        Ok(patterns::extract(language, &content))
    }

    fn classify(&self, language: &Language, raw: RawImport, file: &Path) -> Import {
        if is_stdlib(language, &raw.module) {
            return Import {
                module: raw.module,
                kind: ImportKind::Stdlib,
                file: file.to_path_buf(),
                line: raw.line,
                target: None,
            };
        }
        match self.index.resolve(&raw.module, file, &self.root) {
            Some(id) => Import {
                module: raw.module,
                kind: ImportKind::Internal,
                file: file.to_path_buf(),
                line: raw.line,
                target: Some(id.clone()),
            },
            None => Import {
                module: raw.module,
                kind: ImportKind::External,
                file: file.to_path_buf(),
                line: raw.line,
                target: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::RawTarget;
    use std::fs;

    fn workspace() -> (tempfile::TempDir, TargetSet) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/util.py"), "def helper():\n    return 1\n").unwrap();
        fs::write(
            dir.path().join("app.py"),
            "import os\nimport util\nimport requests\n",
        )
        .unwrap();

        let lib = RawTarget {
            name: "util".into(),
            package: "lib".into(),
            kind: Some("library".into()),
            language: Some("python".into()),
            sources: vec!["util.py".into()],
            ..Default::default()
        };
        let app = RawTarget {
            name: "app".into(),
            package: String::new(),
            kind: Some("executable".into()),
            language: Some("python".into()),
            sources: vec!["app.py".into()],
            ..Default::default()
        };
        let set = TargetSet::resolve(vec![lib, app], dir.path()).unwrap();
        (dir, set)
    }

    #[test]
    fn classifies_stdlib_internal_external() {
        let (dir, set) = workspace();
        let registry = AstParserRegistry::with_builtins();
        let analyzer = DependencyAnalyzer::new(&registry, &set, dir.path());

        let app = set.get(&TargetId::parse("//:app", "").unwrap()).unwrap();
        let analysis = analyzer.analyze(app).unwrap();

        let kind_of = |module: &str| {
            analysis.imports.iter().find(|i| i.module == module).map(|i| i.kind)
        };
        assert_eq!(kind_of("os"), Some(ImportKind::Stdlib));
        assert_eq!(kind_of("util"), Some(ImportKind::Internal));
        assert_eq!(kind_of("requests"), Some(ImportKind::External));

        let lib_id = TargetId::parse("//lib:util", "").unwrap();
        assert!(analysis.implicit_deps.contains(&lib_id));
    }

    #[test]
    fn missing_file_fails_fast() {
        let (dir, set) = workspace();
        fs::remove_file(dir.path().join("app.py")).unwrap();
        let registry = AstParserRegistry::with_builtins();
        let analyzer = DependencyAnalyzer::new(&registry, &set, dir.path())
            .with_policy(ErrorPolicy::FailFast);
        let app = set.get(&TargetId::parse("//:app", "").unwrap()).unwrap();
        assert!(analyzer.analyze(app).is_err());
    }

    #[test]
    fn continue_policy_degrades_to_warnings() {
        let (dir, set) = workspace();
        fs::remove_file(dir.path().join("app.py")).unwrap();
        let registry = AstParserRegistry::with_builtins();
        let analyzer = DependencyAnalyzer::new(&registry, &set, dir.path())
            .with_policy(ErrorPolicy::Continue);
        let app = set.get(&TargetId::parse("//:app", "").unwrap()).unwrap();
        let analysis = analyzer.analyze(app).unwrap();
        assert!(analysis.imports.is_empty());
        assert_eq!(analysis.warnings.len(), 1);
    }

    #[test]
    fn collect_all_fails_when_every_file_errors() {
        let (dir, set) = workspace();
        fs::remove_file(dir.path().join("app.py")).unwrap();
        let registry = AstParserRegistry::with_builtins();
        let analyzer = DependencyAnalyzer::new(&registry, &set, dir.path());
        let app = set.get(&TargetId::parse("//:app", "").unwrap()).unwrap();
        assert!(analyzer.analyze(app).is_err());
    }

    #[test]
    fn go_stdlib_heuristic() {
        assert!(is_stdlib(&Language::new("go"), "net/http"));
        assert!(!is_stdlib(&Language::new("go"), "example.com/pkg"));
    }

    #[test]
    fn relative_js_imports_resolve_by_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("web")).unwrap();
        fs::write(dir.path().join("web/util.js"), "").unwrap();
        fs::write(dir.path().join("web/main.js"), "import { u } from './util';\n").unwrap();

        let util = RawTarget {
            name: "util".into(),
            package: "web".into(),
            kind: Some("library".into()),
            language: Some("javascript".into()),
            sources: vec!["util.js".into()],
            ..Default::default()
        };
        let main = RawTarget {
            name: "main".into(),
            package: "web".into(),
            kind: Some("executable".into()),
            language: Some("javascript".into()),
            sources: vec!["main.js".into()],
            ..Default::default()
        };
        let set = TargetSet::resolve(vec![util, main], dir.path()).unwrap();
        let registry = AstParserRegistry::new();
        let analyzer = DependencyAnalyzer::new(&registry, &set, dir.path());
        let main = set.get(&TargetId::parse("//web:main", "").unwrap()).unwrap();
        let analysis = analyzer.analyze(main).unwrap();
        assert_eq!(analysis.imports[0].kind, ImportKind::Internal);
    }
}
