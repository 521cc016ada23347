//! The workspace description language.
//!
//! A workspace is rooted by a `Builderspace` file; each package may add a
//! `Builderfile`. Both share the same language: `target(name) { … }` blocks
//! plus a small scripting layer (`let`/`const`, functions, macros, `if`/`else`,
//! `for … in`, lambdas, the usual operators, arrays, maps).
//!
//! Files are evaluated hermetically. The only effectful builtins, `env()` and
//! `glob()`, log their observations so targets can be invalidated when the
//! observed values change, see [`EffectLog`].

pub mod ast;
mod eval;
mod parser;
mod token;

pub use eval::{Effect, EffectLog, Evaluator, Value};
pub use parser::parse_file;

use crate::{
    error::{BuildError, Result},
    target::RawTarget,
    utils,
};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File name of the workspace root description.
pub const BUILDERSPACE: &str = "Builderspace";

/// File name of a package description.
pub const BUILDERFILE: &str = "Builderfile";

/// Discovers and evaluates all workspace description files under `root`.
///
/// The root `Builderspace` is evaluated first (package `""`), then every
/// `Builderfile` in lexicographic path order. Returns the raw target
/// declarations of the whole workspace.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn load_workspace(root: &Path) -> Result<Vec<RawTarget>> {
    let builderspace = root.join(BUILDERSPACE);
    if !builderspace.exists() {
        return Err(BuildError::msg(format!(
            "no `{BUILDERSPACE}` found at {}",
            root.display()
        )));
    }

    let mut files = vec![(builderspace, String::new())];
    let mut builderfiles: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == BUILDERFILE)
        .map(|e| e.path().to_path_buf())
        .collect();
    builderfiles.sort();
    for file in builderfiles {
        let package = file
            .parent()
            .and_then(|dir| dir.strip_prefix(root).ok())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        files.push((file, package));
    }

    let mut targets = Vec::new();
    for (file, package) in files {
        trace!(file = %file.display(), %package, "evaluating workspace file");
        targets.extend(evaluate_file(&file, &package, root)?);
    }
    debug!(targets = targets.len(), "workspace loaded");
    Ok(targets)
}

/// Parses and evaluates a single workspace file.
pub fn evaluate_file(file: &Path, package: &str, root: &Path) -> Result<Vec<RawTarget>> {
    let content = utils::read_to_string(file)?;
    let parsed = parse_file(&content, file)?;
    let package_dir = if package.is_empty() { root.to_path_buf() } else { root.join(package) };
    Evaluator::new(file, package, package_dir).run(&parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn loads_builderspace_and_builderfiles() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(BUILDERSPACE),
            r#"target("root") { type: "library"; language: "python"; }"#,
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("svc/api")).unwrap();
        fs::write(
            dir.path().join("svc/api").join(BUILDERFILE),
            r#"target("server") { type: "executable"; language: "python"; }"#,
        )
        .unwrap();

        let targets = load_workspace(dir.path()).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "root");
        assert_eq!(targets[0].package, "");
        assert_eq!(targets[1].name, "server");
        assert_eq!(targets[1].package, "svc/api");
    }

    #[test]
    fn missing_builderspace_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_workspace(dir.path()).is_err());
    }

    #[test]
    fn glob_builtin_resolves_against_package_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(BUILDERSPACE), "").unwrap();
        let pkg = dir.path().join("lib");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("b.py"), "").unwrap();
        fs::write(pkg.join("a.py"), "").unwrap();
        fs::write(
            pkg.join(BUILDERFILE),
            r#"target("lib") { type: "library"; language: "python"; sources: glob("*.py"); }"#,
        )
        .unwrap();

        let targets = load_workspace(dir.path()).unwrap();
        let lib = targets.iter().find(|t| t.name == "lib").unwrap();
        assert_eq!(lib.sources, ["a.py", "b.py"]);
        assert_eq!(lib.effects[0].builtin, "glob");
        assert_eq!(lib.effects[0].observed, "a.py;b.py");
    }
}
