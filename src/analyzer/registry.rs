//! Pluggable per-language AST extraction.
//!
//! Parsers registered here produce a [`FileAst`]: the symbols a source file
//! declares and the imports it makes. The registry is built once during
//! engine bootstrap; looking up a language that has no parser (or whose
//! parser fails on a file) degrades to file-level granularity and is never
//! fatal.

use crate::{
    error::Result,
    hash::ContentHash,
    target::Language,
    utils,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Classification of a declared symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Class,
    Struct,
    Function,
    Method,
    Field,
    Enum,
    Typedef,
    Namespace,
    Template,
    Variable,
}

/// One symbol extracted from a source file.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub start_line: usize,
    pub end_line: usize,
    /// The declaration line as written.
    pub signature: String,
    pub is_public: bool,
    /// Type names referenced by the declaration.
    pub used_types: Vec<String>,
    /// Names of other symbols in the same file this one refers to.
    pub dependencies: Vec<String>,
    /// Hash over the symbol's source lines.
    pub content_hash: ContentHash,
}

/// An import statement as written in the source, before classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawImport {
    pub module: String,
    pub line: usize,
}

/// Per-file extraction result.
#[derive(Clone, Debug)]
pub struct FileAst {
    pub path: PathBuf,
    pub content_hash: ContentHash,
    pub symbols: Vec<Symbol>,
    pub imports: Vec<RawImport>,
    /// True when the parser degraded to a single file-spanning symbol.
    pub file_level: bool,
}

impl FileAst {
    /// File-level fallback: one opaque symbol spanning the whole file.
    pub fn file_level(path: &Path, content: &str, imports: Vec<RawImport>) -> Self {
        let lines = content.lines().count().max(1);
        let hash = ContentHash::of(content.as_bytes());
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        Self {
            path: path.to_path_buf(),
            content_hash: hash,
            symbols: vec![Symbol {
                name,
                kind: SymbolKind::Namespace,
                start_line: 1,
                end_line: lines,
                signature: String::new(),
                is_public: true,
                used_types: Vec::new(),
                dependencies: Vec::new(),
                content_hash: hash,
            }],
            imports,
            file_level: true,
        }
    }
}

/// Declarative visibility rules of a language.
///
/// A symbol is public when its declaration carries one of
/// `public_modifiers`, is not public when it carries one of
/// `private_modifiers`, and otherwise falls back to the name pattern
/// (e.g. `_`-prefixed names are private in python).
#[derive(Clone, Debug, Default)]
pub struct VisibilityRules {
    pub public_modifiers: Vec<&'static str>,
    pub private_modifiers: Vec<&'static str>,
    pub private_name_pattern: Option<&'static Lazy<Regex>>,
    /// Default visibility when no rule matches.
    pub default_public: bool,
}

static RE_UNDERSCORE_PRIVATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^_").unwrap());
static RE_LOWERCASE_PRIVATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]").unwrap());

impl VisibilityRules {
    pub fn python() -> Self {
        Self {
            public_modifiers: vec![],
            private_modifiers: vec![],
            private_name_pattern: Some(&RE_UNDERSCORE_PRIVATE),
            default_public: true,
        }
    }

    pub fn rust() -> Self {
        Self {
            public_modifiers: vec!["pub"],
            private_modifiers: vec![],
            private_name_pattern: None,
            default_public: false,
        }
    }

    pub fn go() -> Self {
        Self {
            public_modifiers: vec![],
            private_modifiers: vec![],
            private_name_pattern: Some(&RE_LOWERCASE_PRIVATE),
            default_public: true,
        }
    }

    pub fn is_public(&self, signature: &str, name: &str) -> bool {
        let words: Vec<&str> = signature.split_whitespace().collect();
        if self.public_modifiers.iter().any(|m| words.contains(m)) {
            return true;
        }
        if self.private_modifiers.iter().any(|m| words.contains(m)) {
            return false;
        }
        if let Some(pattern) = self.private_name_pattern {
            return !pattern.is_match(name);
        }
        self.default_public
    }
}

/// A per-language AST parser.
pub trait AstParser: Send + Sync + std::fmt::Debug {
    fn language(&self) -> Language;

    /// Whether this parser accepts the file, usually by extension.
    fn can_handle(&self, path: &Path) -> bool;

    /// Parses the file from disk.
    fn parse_file(&self, path: &Path) -> Result<FileAst> {
        let content = utils::read_to_string(path)?;
        self.parse_content(&content, path)
    }

    /// Parses already-read content.
    fn parse_content(&self, content: &str, path: &Path) -> Result<FileAst>;
}

/// Registry of AST parsers, keyed by language tag.
#[derive(Debug, Default)]
pub struct AstParserRegistry {
    parsers: HashMap<Language, Arc<dyn AstParser>>,
}

impl AstParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in line-oriented parsers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PythonAstParser));
        registry.register(Arc::new(GoAstParser));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn AstParser>) {
        self.parsers.insert(parser.language(), parser);
    }

    /// Whether a grammar is loaded for the language.
    pub fn has_parser(&self, language: &Language) -> bool {
        self.parsers.contains_key(language)
    }

    pub fn get(&self, language: &Language) -> Option<&Arc<dyn AstParser>> {
        self.parsers.get(language)
    }

    /// Parses `content`, degrading to file-level granularity when no parser
    /// is registered or the parser fails. Never fatal.
    pub fn parse_or_degrade(
        &self,
        language: &Language,
        content: &str,
        path: &Path,
        fallback_imports: impl FnOnce() -> Vec<RawImport>,
    ) -> FileAst {
        if let Some(parser) = self.parsers.get(language) {
            match parser.parse_content(content, path) {
                Ok(ast) => return ast,
                Err(err) => {
                    warn!(file = %path.display(), %err, "ast parse failed, degrading to file level");
                }
            }
        }
        FileAst::file_level(path, content, fallback_imports())
    }
}

// ---- built-in parsers ----

/// Computes the hash of the lines `[start, end)` of `content` (0-based).
fn hash_lines(lines: &[&str], start: usize, end: usize) -> ContentHash {
    ContentHash::of(lines[start..end.min(lines.len())].join("\n").as_bytes())
}

/// Leading-whitespace depth, tabs counted as one level.
fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Finds the end (exclusive, 0-based) of an indentation-delimited block
/// starting at `start`.
fn indented_block_end(lines: &[&str], start: usize) -> usize {
    let base = indent_of(lines[start]);
    let mut end = start + 1;
    while end < lines.len() {
        let line = lines[end];
        if !line.trim().is_empty() && indent_of(line) <= base {
            break;
        }
        end += 1;
    }
    end
}

static RE_PY_DEF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)def\s+(?P<name>\w+)\s*\((?P<params>[^)]*)").unwrap());
static RE_PY_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)class\s+(?P<name>\w+)\s*(?:\((?P<bases>[^)]*)\))?").unwrap());
static RE_PY_ASSIGN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?P<name>\w+)\s*=\s*").unwrap());

/// Line-oriented symbol extraction for python sources.
#[derive(Clone, Copy, Debug)]
pub struct PythonAstParser;

impl AstParser for PythonAstParser {
    fn language(&self) -> Language {
        Language::new("python")
    }

    fn can_handle(&self, path: &Path) -> bool {
        path.extension().map(|ext| ext == "py").unwrap_or(false)
    }

    fn parse_content(&self, content: &str, path: &Path) -> Result<FileAst> {
        let rules = VisibilityRules::python();
        let lines: Vec<&str> = content.lines().collect();
        let mut symbols = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            if let Some(cap) = RE_PY_CLASS.captures(line) {
                let name = cap["name"].to_string();
                let end = indented_block_end(&lines, idx);
                let used_types = cap
                    .name("bases")
                    .map(|b| {
                        b.as_str()
                            .split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();
                symbols.push(Symbol {
                    is_public: rules.is_public(line, &name),
                    name,
                    kind: SymbolKind::Class,
                    start_line: idx + 1,
                    end_line: end,
                    signature: line.trim().to_string(),
                    used_types,
                    dependencies: Vec::new(),
                    content_hash: hash_lines(&lines, idx, end),
                });
            } else if let Some(cap) = RE_PY_DEF.captures(line) {
                let name = cap["name"].to_string();
                let end = indented_block_end(&lines, idx);
                let kind =
                    if indent_of(line) > 0 { SymbolKind::Method } else { SymbolKind::Function };
                symbols.push(Symbol {
                    is_public: rules.is_public(line, &name),
                    name,
                    kind,
                    start_line: idx + 1,
                    end_line: end,
                    signature: line.trim().to_string(),
                    used_types: Vec::new(),
                    dependencies: Vec::new(),
                    content_hash: hash_lines(&lines, idx, end),
                });
            } else if indent_of(line) == 0 {
                if let Some(cap) = RE_PY_ASSIGN.captures(line) {
                    let name = cap["name"].to_string();
                    symbols.push(Symbol {
                        is_public: rules.is_public(line, &name),
                        name,
                        kind: SymbolKind::Variable,
                        start_line: idx + 1,
                        end_line: idx + 1,
                        signature: line.trim().to_string(),
                        used_types: Vec::new(),
                        dependencies: Vec::new(),
                        content_hash: hash_lines(&lines, idx, idx + 1),
                    });
                }
            }
        }

        // wire up intra-file references by name
        let names: Vec<String> = symbols.iter().map(|s| s.name.clone()).collect();
        for (i, symbol) in symbols.iter_mut().enumerate() {
            let body = lines
                [symbol.start_line - 1..symbol.end_line.min(lines.len())]
                .join("\n");
            for (j, name) in names.iter().enumerate() {
                if i != j && body.contains(name.as_str()) {
                    symbol.dependencies.push(name.clone());
                }
            }
        }

        Ok(FileAst {
            path: path.to_path_buf(),
            content_hash: ContentHash::of(content.as_bytes()),
            symbols,
            imports: super::patterns::python_imports(content),
            file_level: false,
        })
    }
}

static RE_GO_FUNC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^func\s+(?:\((?P<recv>[^)]*)\)\s+)?(?P<name>\w+)\s*\(").unwrap()
});
static RE_GO_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^type\s+(?P<name>\w+)\s+(?P<kind>struct|interface|\S+)").unwrap());

/// Line-oriented symbol extraction for go sources.
#[derive(Clone, Copy, Debug)]
pub struct GoAstParser;

impl AstParser for GoAstParser {
    fn language(&self) -> Language {
        Language::new("go")
    }

    fn can_handle(&self, path: &Path) -> bool {
        path.extension().map(|ext| ext == "go").unwrap_or(false)
    }

    fn parse_content(&self, content: &str, path: &Path) -> Result<FileAst> {
        let rules = VisibilityRules::go();
        let lines: Vec<&str> = content.lines().collect();
        let mut symbols = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            if let Some(cap) = RE_GO_FUNC.captures(line) {
                let name = cap["name"].to_string();
                let end = brace_block_end(&lines, idx);
                let kind =
                    if cap.name("recv").is_some() { SymbolKind::Method } else { SymbolKind::Function };
                symbols.push(Symbol {
                    is_public: rules.is_public(line, &name),
                    name,
                    kind,
                    start_line: idx + 1,
                    end_line: end,
                    signature: line.trim().to_string(),
                    used_types: Vec::new(),
                    dependencies: Vec::new(),
                    content_hash: hash_lines(&lines, idx, end),
                });
            } else if let Some(cap) = RE_GO_TYPE.captures(line) {
                let name = cap["name"].to_string();
                let end = brace_block_end(&lines, idx);
                let kind = match &cap["kind"] {
                    "struct" => SymbolKind::Struct,
                    "interface" => SymbolKind::Class,
                    _ => SymbolKind::Typedef,
                };
                symbols.push(Symbol {
                    is_public: rules.is_public(line, &name),
                    name,
                    kind,
                    start_line: idx + 1,
                    end_line: end,
                    signature: line.trim().to_string(),
                    used_types: Vec::new(),
                    dependencies: Vec::new(),
                    content_hash: hash_lines(&lines, idx, end),
                });
            }
        }

        Ok(FileAst {
            path: path.to_path_buf(),
            content_hash: ContentHash::of(content.as_bytes()),
            symbols,
            imports: super::patterns::go_imports(content),
            file_level: false,
        })
    }
}

/// Finds the end (exclusive, 0-based line index + 1) of a `{ … }` block
/// opened on `start`; single-line declarations end on their own line.
fn brace_block_end(lines: &[&str], start: usize) -> usize {
    let mut depth = 0i32;
    let mut opened = false;
    for (idx, line) in lines.iter().enumerate().skip(start) {
        for byte in line.bytes() {
            match byte {
                b'{' => {
                    depth += 1;
                    opened = true;
                }
                b'}' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            return idx + 1;
        }
    }
    if opened {
        lines.len()
    } else {
        start + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY: &str = r#"
import os
from lib import helpers

VERSION = "1.0"

def _internal():
    return 1

def public_api(x):
    return _internal() + x

class Service(Base):
    def run(self):
        return public_api(2)
"#;

    #[test]
    fn python_symbols_and_visibility() {
        let ast = PythonAstParser.parse_content(PY, Path::new("svc.py")).unwrap();
        assert!(!ast.file_level);

        let internal = ast.symbols.iter().find(|s| s.name == "_internal").unwrap();
        assert!(!internal.is_public);
        assert_eq!(internal.kind, SymbolKind::Function);

        let api = ast.symbols.iter().find(|s| s.name == "public_api").unwrap();
        assert!(api.is_public);
        assert!(api.dependencies.contains(&"_internal".to_string()));

        let class = ast.symbols.iter().find(|s| s.name == "Service").unwrap();
        assert_eq!(class.kind, SymbolKind::Class);
        assert_eq!(class.used_types, ["Base"]);

        let run = ast.symbols.iter().find(|s| s.name == "run").unwrap();
        assert_eq!(run.kind, SymbolKind::Method);

        assert_eq!(ast.imports.len(), 2);
    }

    #[test]
    fn go_exported_names_are_public() {
        let src = "package lib\n\nfunc Exported() {\n}\n\nfunc hidden() {\n}\n\ntype Conn struct {\n\tfd int\n}\n";
        let ast = GoAstParser.parse_content(src, Path::new("lib.go")).unwrap();
        assert!(ast.symbols.iter().find(|s| s.name == "Exported").unwrap().is_public);
        assert!(!ast.symbols.iter().find(|s| s.name == "hidden").unwrap().is_public);
        assert_eq!(ast.symbols.iter().find(|s| s.name == "Conn").unwrap().kind, SymbolKind::Struct);
    }

    #[test]
    fn registry_degrades_without_parser() {
        let registry = AstParserRegistry::with_builtins();
        let lang = Language::new("cobol");
        let ast = registry.parse_or_degrade(&lang, "MOVE A TO B", Path::new("x.cob"), Vec::new);
        assert!(ast.file_level);
        assert_eq!(ast.symbols.len(), 1);
        assert_eq!(ast.symbols[0].kind, SymbolKind::Namespace);
    }

    #[test]
    fn symbol_hash_tracks_content() {
        let a = PythonAstParser.parse_content("def f():\n    return 1\n", Path::new("a.py")).unwrap();
        let b = PythonAstParser.parse_content("def f():\n    return 2\n", Path::new("a.py")).unwrap();
        assert_ne!(a.symbols[0].content_hash, b.symbols[0].content_hash);
    }
}
