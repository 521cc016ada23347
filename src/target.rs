//! Build targets and the resolution of parsed target declarations into a
//! validated target set.
//!
//! A target is addressed by a label: `//path/to/pkg:name` is absolute,
//! `:name` refers to a sibling in the same package and `path:name` is
//! relative to the current package. Names match `[A-Za-z0-9._-]+`.

use crate::{
    dsl::EffectLog,
    error::{BuildError, Result},
    utils,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

static RE_TARGET_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap());

/// Canonical identifier of a target, rendered as `//package:name`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(Arc<str>);

impl TargetId {
    /// Creates an id from a package path (relative to the workspace root, `/`
    /// separated, possibly empty) and a target name.
    pub fn new(package: &str, name: &str) -> Result<Self> {
        if !RE_TARGET_NAME.is_match(name) {
            return Err(BuildError::InvalidLabel(format!("//{package}:{name}")));
        }
        Ok(Self(format!("//{package}:{name}").into()))
    }

    /// The package path component, without the leading `//`.
    pub fn package(&self) -> &str {
        let s = &self.0[2..];
        &s[..s.rfind(':').unwrap_or(0)]
    }

    /// The target name component.
    pub fn name(&self) -> &str {
        &self.0[self.0.rfind(':').map(|i| i + 1).unwrap_or(0)..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses a label in any of the supported syntaxes, resolving relative
    /// forms against `current_package`.
    pub fn parse(label: &str, current_package: &str) -> Result<Self> {
        let invalid = || BuildError::InvalidLabel(label.to_string());
        if let Some(rest) = label.strip_prefix("//") {
            let (package, name) = rest.split_once(':').ok_or_else(invalid)?;
            Self::new(package, name)
        } else if let Some(name) = label.strip_prefix(':') {
            Self::new(current_package, name)
        } else if let Some((path, name)) = label.split_once(':') {
            let joined = if current_package.is_empty() {
                path.to_string()
            } else {
                format!("{current_package}/{path}")
            };
            let normalized = utils::normalize_path(Path::new(&joined));
            Self::new(&normalized.to_string_lossy().replace('\\', "/"), name)
        } else {
            Err(invalid())
        }
    }

    #[doc(hidden)]
    pub fn test(name: &str) -> Self {
        Self::new("", name).unwrap()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetId({})", self.0)
    }
}

impl Serialize for TargetId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TargetId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TargetId::parse(&s, "").map_err(serde::de::Error::custom)
    }
}

/// What a target produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Executable,
    Library,
    Test,
    Custom,
}

impl TargetKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "executable" | "binary" => Some(Self::Executable),
            "library" => Some(Self::Library),
            "test" => Some(Self::Test),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Classification of a single unit of work within a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Compile,
    Link,
    Package,
    Codegen,
    Test,
    Custom,
}

impl ActionKind {
    /// Single-byte tag used in the cache entry wire format.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Compile => 0,
            Self::Link => 1,
            Self::Package => 2,
            Self::Codegen => 3,
            Self::Test => 4,
            Self::Custom => 5,
        }
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Compile,
            1 => Self::Link,
            2 => Self::Package,
            3 => Self::Codegen,
            4 => Self::Test,
            5 => Self::Custom,
            _ => return None,
        })
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Compile => "compile",
            Self::Link => "link",
            Self::Package => "package",
            Self::Codegen => "codegen",
            Self::Test => "test",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Language tag of a target, also the key for handler dispatch.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Language(Arc<str>);

impl Language {
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().to_ascii_lowercase().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Infers the language from a source file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let tag = match ext {
            "rs" => "rust",
            "py" => "python",
            "js" | "mjs" | "cjs" => "javascript",
            "ts" | "tsx" => "typescript",
            "go" => "go",
            "java" => "java",
            "c" | "h" => "c",
            "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
            "swift" => "swift",
            "kt" => "kotlin",
            "zig" => "zig",
            _ => return None,
        };
        Some(Self(tag.into()))
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Language({})", self.0)
    }
}

impl From<&str> for Language {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A fully resolved build target.
#[derive(Clone, Debug)]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
    pub language: Language,
    /// Absolute source paths, glob-expanded and sorted.
    pub sources: Vec<PathBuf>,
    /// Declared dependencies, in declaration order.
    pub deps: Vec<TargetId>,
    pub flags: Vec<String>,
    pub output: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Language-specific configuration, passed to the handler untouched.
    pub config: serde_json::Value,
    /// Optional per-action timeout.
    pub timeout: Option<Duration>,
    /// Observed values of effectful builtins during evaluation, hashed into
    /// this target's cache key.
    pub effects: EffectLog,
}

impl Target {
    /// Whether the `remote` flag opts this target into remote execution.
    pub fn is_remote(&self) -> bool {
        self.flags.iter().any(|f| f == "remote")
    }
}

/// A target declaration as produced by the workspace evaluator, before
/// resolution against the filesystem and the rest of the workspace.
#[derive(Clone, Debug, Default)]
pub struct RawTarget {
    pub name: String,
    /// Package path of the Builderfile that declared the target.
    pub package: String,
    pub kind: Option<String>,
    pub language: Option<String>,
    pub sources: Vec<String>,
    pub deps: Vec<String>,
    pub flags: Vec<String>,
    pub output: Option<String>,
    pub env: BTreeMap<String, String>,
    pub config: serde_json::Value,
    pub timeout_ms: Option<u64>,
    pub effects: EffectLog,
    /// Builderfile that declared this target, for diagnostics.
    pub file: PathBuf,
}

/// The validated set of targets of a workspace.
#[derive(Clone, Debug, Default)]
pub struct TargetSet {
    targets: BTreeMap<TargetId, Target>,
}

impl TargetSet {
    pub fn get(&self, id: &TargetId) -> Option<&Target> {
        self.targets.get(id)
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.targets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TargetId> {
        self.targets.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    /// Inserts a target produced outside of workspace resolution, e.g. by a
    /// dynamic discovery.
    pub fn insert(&mut self, target: Target) -> Result<()> {
        if self.targets.contains_key(&target.id) {
            return Err(BuildError::DuplicateTarget(target.id.to_string()));
        }
        self.targets.insert(target.id.clone(), target);
        Ok(())
    }

    /// Resolves raw declarations into a validated target set.
    ///
    /// Expands glob patterns in `sources` (deterministic, sorted), resolves
    /// dep labels, infers the language from source extensions when omitted
    /// and rejects duplicate targets, self-dependencies and dangling deps.
    pub fn resolve(raw_targets: Vec<RawTarget>, root: &Path) -> Result<Self> {
        let mut ids = HashSet::new();
        for raw in &raw_targets {
            let id = TargetId::new(&raw.package, &raw.name)?;
            if !ids.insert(id.clone()) {
                return Err(BuildError::DuplicateTarget(id.to_string()));
            }
        }

        let mut targets = BTreeMap::new();
        for raw in raw_targets {
            let id = TargetId::new(&raw.package, &raw.name)?;
            let package_dir = root.join(&raw.package);

            let sources = expand_sources(&raw.sources, &package_dir)?;

            let mut deps = Vec::with_capacity(raw.deps.len());
            for dep in &raw.deps {
                let dep_id = TargetId::parse(dep, &raw.package)?;
                if dep_id == id {
                    return Err(BuildError::UnresolvedDependency {
                        from: id.to_string(),
                        dep: format!("{dep} (self-dependency)"),
                    });
                }
                if !ids.contains(&dep_id) {
                    return Err(BuildError::UnresolvedDependency {
                        from: id.to_string(),
                        dep: dep.clone(),
                    });
                }
                deps.push(dep_id);
            }

            let kind = match raw.kind.as_deref() {
                Some(kind) => TargetKind::parse(kind).ok_or_else(|| BuildError::FieldType {
                    file: raw.file.clone(),
                    field: "type".into(),
                    expected: "one of executable|library|test|custom",
                    actual: kind.to_string(),
                })?,
                None => {
                    return Err(BuildError::RequiredFieldMissing {
                        file: raw.file.clone(),
                        target: id.to_string(),
                        field: "type".into(),
                    })
                }
            };

            let language = match raw.language.as_deref() {
                Some(tag) => Language::new(tag),
                None => infer_language(&id, &sources)?,
            };

            let output = raw.output.as_ref().map(|o| package_dir.join(o));

            targets.insert(
                id.clone(),
                Target {
                    id,
                    kind,
                    language,
                    sources,
                    deps,
                    flags: raw.flags,
                    output,
                    env: raw.env,
                    config: raw.config,
                    timeout: raw.timeout_ms.map(Duration::from_millis),
                    effects: raw.effects,
                },
            );
        }

        Ok(Self { targets })
    }

    /// Map from language to the targets using it, in id order.
    pub fn by_language(&self) -> HashMap<Language, Vec<&Target>> {
        let mut map: HashMap<Language, Vec<&Target>> = HashMap::new();
        for target in self.targets.values() {
            map.entry(target.language.clone()).or_default().push(target);
        }
        map
    }
}

/// Expands each source entry, treating entries containing glob metacharacters
/// as patterns rooted at the package directory.
fn expand_sources(entries: &[String], package_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();
    for entry in entries {
        if entry.contains(['*', '?', '[']) {
            let pattern = package_dir.join(entry);
            let matches = glob::glob(&pattern.to_string_lossy())
                .map_err(|err| BuildError::msg(format!("invalid glob `{entry}`: {err}")))?;
            for path in matches {
                let path =
                    path.map_err(|err| BuildError::msg(format!("glob `{entry}`: {err}")))?;
                sources.push(path);
            }
        } else {
            sources.push(package_dir.join(entry));
        }
    }
    // globs return filesystem order; make the target's fingerprint stable
    sources.sort();
    sources.dedup();
    Ok(sources)
}

fn infer_language(id: &TargetId, sources: &[PathBuf]) -> Result<Language> {
    let mut inferred: Option<Language> = None;
    for source in sources {
        let Some(lang) =
            source.extension().and_then(|ext| Language::from_extension(&ext.to_string_lossy()))
        else {
            continue;
        };
        match &inferred {
            Some(existing) if *existing != lang => {
                return Err(BuildError::UnknownLanguage {
                    target: id.to_string(),
                    sources: sources
                        .iter()
                        .map(|s| s.to_string_lossy().into_owned())
                        .collect(),
                })
            }
            _ => inferred = Some(lang),
        }
    }
    inferred.ok_or_else(|| BuildError::UnknownLanguage {
        target: id.to_string(),
        sources: sources.iter().map(|s| s.to_string_lossy().into_owned()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, package: &str) -> RawTarget {
        RawTarget {
            name: name.into(),
            package: package.into(),
            kind: Some("library".into()),
            language: Some("python".into()),
            ..Default::default()
        }
    }

    #[test]
    fn can_parse_labels() {
        let id = TargetId::parse("//services/api:server", "").unwrap();
        assert_eq!(id.package(), "services/api");
        assert_eq!(id.name(), "server");

        let sibling = TargetId::parse(":util", "services/api").unwrap();
        assert_eq!(sibling.as_str(), "//services/api:util");

        let relative = TargetId::parse("proto:gen", "services").unwrap();
        assert_eq!(relative.as_str(), "//services/proto:gen");
    }

    #[test]
    fn rejects_bad_labels() {
        assert!(TargetId::parse("no-colon", "").is_err());
        assert!(TargetId::parse("//pkg:bad name", "").is_err());
        assert!(TargetId::new("pkg", "").is_err());
    }

    #[test]
    fn duplicate_targets_rejected() {
        let err = TargetSet::resolve(vec![raw("a", ""), raw("a", "")], Path::new("/tmp"))
            .unwrap_err();
        assert!(matches!(err, BuildError::DuplicateTarget(_)), "{err}");
    }

    #[test]
    fn self_dependency_rejected() {
        let mut t = raw("a", "");
        t.deps.push(":a".into());
        let err = TargetSet::resolve(vec![t], Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, BuildError::UnresolvedDependency { .. }), "{err}");
    }

    #[test]
    fn unresolved_dependency_rejected() {
        let mut t = raw("a", "");
        t.deps.push(":missing".into());
        let err = TargetSet::resolve(vec![t], Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, BuildError::UnresolvedDependency { .. }), "{err}");
    }

    #[test]
    fn infers_language_from_sources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m.py"), "").unwrap();
        let mut t = raw("a", "");
        t.language = None;
        t.sources = vec!["m.py".into()];
        let set = TargetSet::resolve(vec![t], dir.path()).unwrap();
        let target = set.get(&TargetId::test("a")).unwrap();
        assert_eq!(target.language.as_str(), "python");
    }

    #[test]
    fn mixed_languages_require_explicit_tag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m.py"), "").unwrap();
        std::fs::write(dir.path().join("m.go"), "").unwrap();
        let mut t = raw("a", "");
        t.language = None;
        t.sources = vec!["m.py".into(), "m.go".into()];
        let err = TargetSet::resolve(vec![t], dir.path()).unwrap_err();
        assert!(matches!(err, BuildError::UnknownLanguage { .. }), "{err}");
    }

    #[test]
    fn glob_sources_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["z.py", "a.py", "m.py"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let expanded = expand_sources(&["*.py".into()], dir.path()).unwrap();
        let names: Vec<_> =
            expanded.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, ["a.py", "m.py", "z.py"]);
    }
}
