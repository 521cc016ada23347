//! Pattern-based import extraction.
//!
//! The cheap backend of the analyzer: per-language regexes plus a structured
//! line parser for python-style `from … import …` statements. Used when no
//! AST grammar is loaded for a language and as the fallback when an AST
//! parser fails on a file.

use super::registry::RawImport;
use crate::target::Language;
use once_cell::sync::Lazy;
use regex::Regex;
use winnow::{
    ascii::space1,
    combinator::{alt, opt, preceded, separated},
    token::take_till,
    PResult, Parser,
};

static RE_JS_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:import|export)\s+(?:[^'"]*?\s+from\s+)?['"](?P<path>[^'"]+)['"]"#).unwrap()
});
static RE_JS_REQUIRE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"require\s*\(\s*['"](?P<path>[^'"]+)['"]\s*\)"#).unwrap());
static RE_GO_IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*(?:import\s+)?(?:\w+\s+)?"(?P<path>[^"]+)"\s*$"#).unwrap());
static RE_C_INCLUDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*#\s*include\s*(?:"(?P<local>[^"]+)"|<(?P<system>[^>]+)>)"#).unwrap());
static RE_RUST_USE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:pub\s+)?use\s+(?P<path>[\w:]+)").unwrap());
static RE_RUST_MOD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(?:pub\s+)?mod\s+(?P<name>\w+)\s*;").unwrap());
static RE_JAVA_IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*import\s+(?:static\s+)?(?P<path>[\w.]+?)(?:\.\*)?\s*;").unwrap());

/// Extracts imports for `language`, returning an empty list for languages
/// without a pattern table.
pub fn extract(language: &Language, content: &str) -> Vec<RawImport> {
    match language.as_str() {
        "python" => python_imports(content),
        "javascript" | "typescript" => js_imports(content),
        "go" => go_imports(content),
        "c" | "cpp" => c_imports(content),
        "rust" => rust_imports(content),
        "java" => java_imports(content),
        _ => Vec::new(),
    }
}

/// Whether a pattern table exists for the language.
pub fn supports(language: &Language) -> bool {
    matches!(
        language.as_str(),
        "python" | "javascript" | "typescript" | "go" | "c" | "cpp" | "rust" | "java"
    )
}

/// Parses one python import line: `import a.b.c` or `from a.b import c`.
fn parse_python_import<'a>(input: &mut &'a str) -> PResult<Vec<&'a str>> {
    (
        preceded(
            (alt(["from", "import"]), space1),
            separated(1.., take_till(1.., ['.', ' ', ',']), '.'),
        ),
        opt(preceded((space1, "import", space1), take_till(0.., [' ', ',']))),
    )
        .parse_next(input)
        .map(|(parts, _): (Vec<&str>, Option<&str>)| parts)
}

/// Python `import`/`from` statements. The imported name of a `from` statement
/// is not part of the module path.
pub fn python_imports(content: &str) -> Vec<RawImport> {
    let mut imports = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("import ") && !trimmed.starts_with("from ") {
            continue;
        }
        let mut rest = trimmed;
        if let Ok(parts) = parse_python_import(&mut rest) {
            imports.push(RawImport { module: parts.join("."), line: idx + 1 });
        }
    }
    imports
}

pub fn js_imports(content: &str) -> Vec<RawImport> {
    let mut imports = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        for cap in RE_JS_IMPORT.captures_iter(line) {
            imports.push(RawImport { module: cap["path"].to_string(), line: idx + 1 });
        }
        for cap in RE_JS_REQUIRE.captures_iter(line) {
            imports.push(RawImport { module: cap["path"].to_string(), line: idx + 1 });
        }
    }
    imports
}

/// Go imports, both single-line and grouped `import ( … )` blocks.
pub fn go_imports(content: &str) -> Vec<RawImport> {
    let mut imports = Vec::new();
    let mut in_block = false;
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("import (") {
            in_block = true;
            continue;
        }
        if in_block {
            if trimmed.starts_with(')') {
                in_block = false;
                continue;
            }
            if let Some(cap) = RE_GO_IMPORT.captures(line) {
                imports.push(RawImport { module: cap["path"].to_string(), line: idx + 1 });
            }
        } else if trimmed.starts_with("import ") {
            if let Some(cap) = RE_GO_IMPORT.captures(trimmed) {
                imports.push(RawImport { module: cap["path"].to_string(), line: idx + 1 });
            }
        }
    }
    imports
}

/// C/C++ includes. System includes keep their angle brackets so the
/// classifier can tell them apart.
pub fn c_imports(content: &str) -> Vec<RawImport> {
    let mut imports = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if let Some(cap) = RE_C_INCLUDE.captures(line) {
            let module = match (cap.name("local"), cap.name("system")) {
                (Some(local), _) => local.as_str().to_string(),
                (None, Some(system)) => format!("<{}>", system.as_str()),
                _ => continue,
            };
            imports.push(RawImport { module, line: idx + 1 });
        }
    }
    imports
}

pub fn rust_imports(content: &str) -> Vec<RawImport> {
    let mut imports = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if let Some(cap) = RE_RUST_USE.captures(line) {
            imports.push(RawImport { module: cap["path"].to_string(), line: idx + 1 });
        } else if let Some(cap) = RE_RUST_MOD.captures(line) {
            imports.push(RawImport { module: cap["name"].to_string(), line: idx + 1 });
        }
    }
    imports
}

pub fn java_imports(content: &str) -> Vec<RawImport> {
    let mut imports = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if let Some(cap) = RE_JAVA_IMPORT.captures(line) {
            imports.push(RawImport { module: cap["path"].to_string(), line: idx + 1 });
        }
    }
    imports
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modules(imports: &[RawImport]) -> Vec<&str> {
        imports.iter().map(|i| i.module.as_str()).collect()
    }

    #[test]
    fn can_parse_python_imports() {
        let imports = python_imports("import os\nfrom pkg.sub import thing\n  import a.b.c\n");
        assert_eq!(modules(&imports), ["os", "pkg.sub", "a.b.c"]);
        assert_eq!(imports[1].line, 2);
    }

    #[test]
    fn can_parse_js_imports() {
        let src = r#"
import { x } from "./util";
import * as fs from 'fs';
const lib = require("../lib");
export { y } from "./other";
"#;
        let imports = js_imports(src);
        assert_eq!(modules(&imports), ["./util", "fs", "../lib", "./other"]);
    }

    #[test]
    fn can_parse_go_import_blocks() {
        let src = "package main\n\nimport (\n\t\"fmt\"\n\talias \"example.com/pkg\"\n)\n\nimport \"os\"\n";
        let imports = go_imports(src);
        assert_eq!(modules(&imports), ["fmt", "example.com/pkg", "os"]);
    }

    #[test]
    fn c_system_includes_are_marked() {
        let imports = c_imports("#include <stdio.h>\n#include \"local.h\"\n");
        assert_eq!(modules(&imports), ["<stdio.h>", "local.h"]);
    }

    #[test]
    fn rust_use_and_mod() {
        let imports = rust_imports("use std::fs;\npub use crate::graph::BuildGraph;\nmod cache;\n");
        assert_eq!(modules(&imports), ["std::fs", "crate::graph::BuildGraph", "cache"]);
    }

    #[test]
    fn java_imports_strip_wildcards() {
        let imports = java_imports("import java.util.List;\nimport static org.junit.Assert.*;\n");
        assert_eq!(modules(&imports), ["java.util.List", "org.junit.Assert"]);
    }
}
