//! Generic command-driven handler.
//!
//! Builds a target by running a configured command, e.g.
//!
//! ```text
//! target("tool") {
//!     type: "executable";
//!     language: "python";
//!     sources: ["tool.py"];
//!     build: { command: "cp", args: ["tool.py", "{output}"] };
//! }
//! ```
//!
//! The command runs once per target as a single action of kind `custom` (or
//! the configured kind), with the timeout from the target config applied to
//! the child process. Placeholders `{output}`, `{out_dir}`, `{root}` and
//! `{sources}` expand before invocation.

use super::{BuildContext, BuildOutcome, LanguageHandler};
use crate::{
    error::{BuildError, Result},
    target::{ActionKind, Language, Target},
    utils,
};
use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

/// Bound on captured process output kept for diagnostics.
const MAX_CAPTURED_LINES: usize = 64;

/// A handler that shells out to a configured command.
#[derive(Clone, Debug)]
pub struct CommandHandler {
    language: Language,
    tool_version: Option<semver::Version>,
}

impl CommandHandler {
    pub fn new(language: Language) -> Self {
        Self { language, tool_version: None }
    }

    /// Records the tool version, propagated into action metadata.
    pub fn with_tool_version(mut self, version: semver::Version) -> Self {
        self.tool_version = Some(version);
        self
    }

    fn command_spec(&self, target: &Target) -> Result<(String, Vec<String>)> {
        let spec = &target.config["build"];
        let command = spec["command"].as_str().ok_or_else(|| BuildError::HandlerFailed {
            target: target.id.to_string(),
            kind: ActionKind::Custom,
            message: "missing `build.command` in target config".into(),
        })?;
        let args = spec["args"]
            .as_array()
            .map(|args| {
                args.iter()
                    .filter_map(|arg| arg.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok((command.to_string(), args))
    }

    fn expand(template: &str, ctx: &BuildContext<'_>, output: &Path) -> String {
        let sources = ctx
            .target
            .sources
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        template
            .replace("{output}", &output.to_string_lossy())
            .replace("{out_dir}", &ctx.out_dir.to_string_lossy())
            .replace("{root}", &ctx.workspace_root.to_string_lossy())
            .replace("{sources}", &sources)
    }

    fn run_command(
        &self,
        ctx: &BuildContext<'_>,
        command: &str,
        args: &[String],
        diagnostics: &mut Vec<String>,
    ) -> Result<()> {
        let target = ctx.target;
        let mut child = Command::new(command)
            .args(args)
            .current_dir(ctx.workspace_root)
            .envs(&target.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| BuildError::HandlerFailed {
                target: target.id.to_string(),
                kind: ActionKind::Custom,
                message: format!("failed to spawn `{command}`: {err}"),
            })?;

        // without a timeout the child can be drained normally; with one, the
        // child is polled so it can be killed at the deadline
        let Some(timeout) = target.timeout else {
            let output = child.wait_with_output().map_err(|err| BuildError::HandlerFailed {
                target: target.id.to_string(),
                kind: ActionKind::Custom,
                message: format!("wait failed: {err}"),
            })?;
            for captured in [&output.stdout, &output.stderr] {
                diagnostics.extend(
                    String::from_utf8_lossy(captured)
                        .lines()
                        .take(MAX_CAPTURED_LINES)
                        .map(str::to_string),
                );
            }
            if !output.status.success() {
                return Err(BuildError::HandlerFailed {
                    target: target.id.to_string(),
                    kind: ActionKind::Custom,
                    message: format!("`{command}` exited with {}", output.status),
                });
            }
            return Ok(());
        };

        let deadline = Some(Instant::now() + timeout);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(BuildError::ProcessTimeout {
                                target: target.id.to_string(),
                                timeout_ms: target.timeout.unwrap_or_default().as_millis() as u64,
                            });
                        }
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => {
                    return Err(BuildError::HandlerFailed {
                        target: target.id.to_string(),
                        kind: ActionKind::Custom,
                        message: format!("wait failed: {err}"),
                    })
                }
            }
        };

        if let Some(mut stream) = child.stdout.take() {
            let mut captured = String::new();
            let _ = stream.read_to_string(&mut captured);
            diagnostics.extend(
                captured.lines().take(MAX_CAPTURED_LINES).map(str::to_string),
            );
        }
        if let Some(mut stream) = child.stderr.take() {
            let mut captured = String::new();
            let _ = stream.read_to_string(&mut captured);
            diagnostics.extend(
                captured.lines().take(MAX_CAPTURED_LINES).map(str::to_string),
            );
        }

        if !status.success() {
            return Err(BuildError::HandlerFailed {
                target: target.id.to_string(),
                kind: ActionKind::Custom,
                message: format!("`{command}` exited with {status}"),
            });
        }
        Ok(())
    }
}

impl LanguageHandler for CommandHandler {
    fn language(&self) -> Language {
        self.language.clone()
    }

    fn outputs(&self, target: &Target, out_dir: &Path) -> Vec<PathBuf> {
        match &target.output {
            Some(output) => vec![output.clone()],
            None => vec![out_dir.join(target.id.package()).join(target.id.name())],
        }
    }

    fn build(&self, ctx: &BuildContext<'_>) -> BuildOutcome {
        let target = ctx.target;
        let output = self.outputs(target, ctx.out_dir).remove(0);
        if let Err(err) = utils::create_parent_dir_all(&output) {
            return BuildOutcome::failure(err);
        }

        let (command, args) = match self.command_spec(target) {
            Ok(spec) => spec,
            Err(err) => return BuildOutcome::failure(err),
        };
        let command = Self::expand(&command, ctx, &output);
        let args: Vec<String> =
            args.iter().map(|arg| Self::expand(arg, ctx, &output)).collect();

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("command".to_string(), command.clone());
        metadata.insert("args".to_string(), args.join("\u{1f}"));
        if let Some(version) = &self.tool_version {
            metadata.insert("tool".to_string(), version.to_string());
        }
        for (key, value) in &target.env {
            metadata.insert(format!("env.{key}"), value.clone());
        }

        let mut diagnostics = Vec::new();
        let run = ctx
            .action(ActionKind::Custom, "")
            .metadata_map(metadata)
            .run(&target.sources, vec![output.clone()], || {
                self.run_command(ctx, &command, &args, &mut diagnostics)
            });

        match run {
            Ok(_) => BuildOutcome::success(vec![output]).with_diagnostics(diagnostics),
            Err(err) => {
                let mut outcome = BuildOutcome::failure(err);
                outcome.diagnostics = diagnostics;
                outcome
            }
        }
    }

    fn tool_version(&self) -> Option<semver::Version> {
        self.tool_version.clone()
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::{
        cache::{CacheCoordinator, CachePolicy},
        hash::FileHasher,
        target::{TargetId, TargetKind},
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn context_parts(dir: &Path) -> (CacheCoordinator, FileHasher, PathBuf) {
        let coordinator =
            CacheCoordinator::open(&CachePolicy::builder().root(dir.join("cache")).build());
        (coordinator, FileHasher::new(), dir.join("out"))
    }

    fn target(dir: &Path, config: serde_json::Value) -> Target {
        Target {
            id: TargetId::test("tool"),
            kind: TargetKind::Executable,
            language: Language::new("python"),
            sources: vec![dir.join("tool.py")],
            deps: Vec::new(),
            flags: Vec::new(),
            output: Some(dir.join("out/tool")),
            env: BTreeMap::new(),
            config,
            timeout: None,
            effects: Vec::new(),
        }
    }

    #[test]
    fn builds_via_configured_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tool.py"), "print('hi')\n").unwrap();
        let (coordinator, hasher, out_dir) = context_parts(dir.path());
        let target = target(
            dir.path(),
            json!({ "build": { "command": "cp", "args": ["{sources}", "{output}"] } }),
        );
        let ctx = BuildContext {
            target: &target,
            workspace_root: dir.path(),
            out_dir: &out_dir,
            coordinator: &coordinator,
            hasher: &hasher,
        };

        let outcome = CommandHandler::new(Language::new("python")).build(&ctx);
        assert!(outcome.success, "{:?}", outcome.error);
        assert!(dir.path().join("out/tool").exists());
    }

    #[test]
    fn failing_command_reports_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tool.py"), "").unwrap();
        let (coordinator, hasher, out_dir) = context_parts(dir.path());
        let target = target(
            dir.path(),
            json!({ "build": { "command": "sh", "args": ["-c", "echo compile error >&2; exit 3"] } }),
        );
        let ctx = BuildContext {
            target: &target,
            workspace_root: dir.path(),
            out_dir: &out_dir,
            coordinator: &coordinator,
            hasher: &hasher,
        };

        let outcome = CommandHandler::new(Language::new("python")).build(&ctx);
        assert!(!outcome.success);
        assert!(outcome.diagnostics.iter().any(|line| line.contains("compile error")));
    }

    #[test]
    fn timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tool.py"), "").unwrap();
        let (coordinator, hasher, out_dir) = context_parts(dir.path());
        let mut target = target(
            dir.path(),
            json!({ "build": { "command": "sleep", "args": ["5"] } }),
        );
        target.timeout = Some(Duration::from_millis(50));
        let ctx = BuildContext {
            target: &target,
            workspace_root: dir.path(),
            out_dir: &out_dir,
            coordinator: &coordinator,
            hasher: &hasher,
        };

        let started = Instant::now();
        let outcome = CommandHandler::new(Language::new("python")).build(&ctx);
        assert!(!outcome.success);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(matches!(outcome.error, Some(BuildError::ProcessTimeout { .. })));
    }

    #[test]
    fn missing_command_config_is_a_typed_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tool.py"), "").unwrap();
        let (coordinator, hasher, out_dir) = context_parts(dir.path());
        let target = target(dir.path(), serde_json::Value::Null);
        let ctx = BuildContext {
            target: &target,
            workspace_root: dir.path(),
            out_dir: &out_dir,
            coordinator: &coordinator,
            hasher: &hasher,
        };

        let outcome = CommandHandler::new(Language::new("python")).build(&ctx);
        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(BuildError::HandlerFailed { .. })));
    }
}
