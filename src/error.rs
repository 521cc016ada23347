//! Engine-wide error and result types.

use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// An I/O error tied to the path that produced it.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct IoError {
    io: io::Error,
    path: PathBuf,
}

impl IoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the error occurred.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying `io::Error`.
    pub fn inner(&self) -> &io::Error {
        &self.io
    }
}

impl From<IoError> for io::Error {
    fn from(err: IoError) -> Self {
        err.io
    }
}

/// Byte position of a DSL syntax error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourcePos {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for SourcePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Various error types for the build engine.
///
/// Every variant maps to a stable diagnostic code, see [`BuildError::code`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("{0}")]
    Message(String),

    // configuration
    #[error("syntax error in {file} at {pos}: {message}")]
    Syntax { file: PathBuf, pos: SourcePos, message: String },
    #[error("type error in {file}: field `{field}` expected {expected}, got {actual}")]
    FieldType { file: PathBuf, field: String, expected: &'static str, actual: String },
    #[error("target `{target}` in {file} is missing required field `{field}`")]
    RequiredFieldMissing { file: PathBuf, target: String, field: String },
    #[error("target `{from}` depends on unresolved target `{dep}`")]
    UnresolvedDependency { from: String, dep: String },
    #[error("duplicate target `{0}`")]
    DuplicateTarget(String),
    #[error("cannot determine language for target `{target}` from sources {sources:?}")]
    UnknownLanguage { target: String, sources: Vec<String> },
    #[error("dependency cycle: {}", .0.render())]
    Cycle(crate::graph::CycleError),
    #[error("invalid target label `{0}`")]
    InvalidLabel(String),

    // execution
    #[error("no handler registered for language `{0}`")]
    NoHandler(String),
    #[error("target `{target}` {kind} action failed: {message}")]
    HandlerFailed { target: String, kind: crate::target::ActionKind, message: String },
    #[error("target `{target}` timed out after {timeout_ms}ms")]
    ProcessTimeout { target: String, timeout_ms: u64 },
    #[error("target `{target}` reported success but output {} is missing", .output.display())]
    MissingOutput { target: String, output: PathBuf },
    #[error("output hash mismatch for target `{0}`")]
    OutputHashMismatch(String),

    // cache
    #[error("corrupt cache entry at {}: {message}", .path.display())]
    CorruptCacheEntry { path: PathBuf, message: String },
    #[error("cache integrity mismatch for target `{0}`, entry quarantined")]
    CacheIntegrity(String),

    // dynamic graph
    #[error("discovery from `{discoverer}` rejected: {reason}")]
    DiscoveryRejected { discoverer: String, reason: String },

    // remote
    #[error("remote transport failure: {0}")]
    Transport(String),
    #[error("remote coordinator unreachable: {0}")]
    CoordinatorUnreachable(String),
    #[error("remote worker error for `{target}`: {message}")]
    WorkerError { target: String, message: String },
    #[error("circuit breaker open for endpoint `{0}`")]
    CircuitOpen(String),
    #[error("rate limit exceeded for endpoint `{0}`")]
    RateLimited(String),

    #[error("build cancelled")]
    Cancelled,

    // scheduler/graph state corruption; terminates the session after a checkpoint
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BuildError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        IoError::new(err, path).into()
    }

    /// Create an error message.
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        BuildError::Message(msg.to_string())
    }

    /// Machine-parseable diagnostic code for user-visible failures.
    pub fn code(&self) -> &'static str {
        match self {
            BuildError::Io(_) => "io",
            BuildError::Message(_) => "message",
            BuildError::Syntax { .. } => "config.syntax",
            BuildError::FieldType { .. } => "config.type",
            BuildError::RequiredFieldMissing { .. } => "config.required-field",
            BuildError::UnresolvedDependency { .. } => "config.unresolved-dependency",
            BuildError::DuplicateTarget(_) => "config.duplicate-target",
            BuildError::UnknownLanguage { .. } => "config.unknown-language",
            BuildError::Cycle(_) => "config.cycle",
            BuildError::InvalidLabel(_) => "config.invalid-label",
            BuildError::NoHandler(_) => "exec.no-handler",
            BuildError::HandlerFailed { .. } => "exec.handler-failed",
            BuildError::ProcessTimeout { .. } => "exec.timeout",
            BuildError::MissingOutput { .. } => "exec.missing-output",
            BuildError::OutputHashMismatch(_) => "exec.output-hash-mismatch",
            BuildError::CorruptCacheEntry { .. } => "cache.corrupt-entry",
            BuildError::CacheIntegrity(_) => "cache.integrity",
            BuildError::DiscoveryRejected { .. } => "graph.discovery-rejected",
            BuildError::Transport(_) => "remote.transport",
            BuildError::CoordinatorUnreachable(_) => "remote.coordinator-unreachable",
            BuildError::WorkerError { .. } => "remote.worker",
            BuildError::CircuitOpen(_) => "remote.circuit-open",
            BuildError::RateLimited(_) => "remote.rate-limited",
            BuildError::Cancelled => "cancelled",
            BuildError::Invariant(_) => "internal.invariant",
            BuildError::Json(_) => "json",
        }
    }

    /// Whether this error is a workspace configuration error (exit code 2).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BuildError::Syntax { .. }
                | BuildError::FieldType { .. }
                | BuildError::RequiredFieldMissing { .. }
                | BuildError::UnresolvedDependency { .. }
                | BuildError::DuplicateTarget(_)
                | BuildError::UnknownLanguage { .. }
                | BuildError::Cycle(_)
                | BuildError::InvalidLabel(_)
        )
    }

    /// Process exit code for a build that ended with this error.
    ///
    /// 2 for configuration errors, 3 for cancellation, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_configuration() {
            2
        } else if matches!(self, BuildError::Cancelled) {
            3
        } else {
            1
        }
    }
}

macro_rules! format_err {
    ($($tt:tt)*) => {
        $crate::error::BuildError::msg(format!($($tt)*))
    };
}

macro_rules! bail {
    ($($tt:tt)*) => { return Err(format_err!($($tt)*)) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(BuildError::DuplicateTarget("a".into()).exit_code(), 2);
        assert_eq!(BuildError::Cancelled.exit_code(), 3);
        assert_eq!(BuildError::msg("boom").exit_code(), 1);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            BuildError::ProcessTimeout { target: "a".into(), timeout_ms: 5 }.code(),
            "exec.timeout"
        );
        assert_eq!(BuildError::DuplicateTarget("x".into()).code(), "config.duplicate-target");
    }
}
