//! Remote action execution.
//!
//! Targets flagged `remote` have their build action shipped to a worker
//! fleet: inputs are uploaded to the artifact store as content-addressed
//! blobs, an [`ActionRequest`] goes to the coordinator through a
//! [`Transport`], and the executing worker blocks on the
//! [`CompletionTracker`] until the completion arrives or the timeout
//! expires. Every call is gated by the endpoint's circuit breaker and rate
//! limiter.
//!
//! The subsystem is optional and fully composed: [`RemoteExecutor::new`]
//! returns a ready executor or an error, never a half-wired one.

pub mod protocol;
mod store;
mod tracker;

pub use protocol::{
    ActionCompletion, ActionRequest, Capabilities, InputSpec, OutputSpec, RemoteStatus,
    ResourceUsage, SandboxSpec,
};
pub use store::{ArtifactStore, LocalArtifactStore};
pub use tracker::{CompletionTracker, Registration};

use crate::{
    cache::{inputs_hash, ActionId},
    error::{BuildError, Result},
    handlers::BuildOutcome,
    hash::{ContentHash, FileHasher},
    report,
    resilience::{EndpointGuard, Priority, ResiliencePolicy},
    target::{ActionKind, Target},
    utils,
};
use std::{collections::BTreeMap, fmt, path::Path, sync::Arc, time::Duration};

/// Delivery of action requests to the remote coordinator.
///
/// Implementations deliver completions asynchronously through the
/// [`CompletionTracker`] handed to them at construction.
pub trait Transport: Send + Sync + fmt::Debug {
    fn endpoint(&self) -> &str;

    fn submit(&self, request: ActionRequest) -> Result<()>;
}

/// Configuration of the remote subsystem.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub policy: ResiliencePolicy,
    /// Applied when a target has no timeout of its own.
    pub default_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "remote".into(),
            policy: ResiliencePolicy::network(),
            default_timeout: Duration::from_secs(300),
        }
    }
}

/// Ships actions to remote workers and folds completions back into the
/// normal executor path.
#[derive(Debug)]
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    tracker: Arc<CompletionTracker>,
    store: Arc<dyn ArtifactStore>,
    guard: EndpointGuard,
    default_timeout: Duration,
}

impl RemoteExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        tracker: Arc<CompletionTracker>,
        store: Arc<dyn ArtifactStore>,
        config: RemoteConfig,
    ) -> Self {
        Self {
            transport,
            tracker,
            store,
            guard: EndpointGuard::new(config.endpoint, config.policy),
            default_timeout: config.default_timeout,
        }
    }

    pub fn tracker(&self) -> &Arc<CompletionTracker> {
        &self.tracker
    }

    pub fn guard(&self) -> &EndpointGuard {
        &self.guard
    }

    /// Builds `target` remotely, returning a normal [`BuildOutcome`] for the
    /// executor path.
    pub fn execute(
        &self,
        target: &Target,
        hasher: &FileHasher,
        workspace_root: &Path,
        out_dir: &Path,
    ) -> Result<BuildOutcome> {
        self.guard.admit(Priority::Normal)?;

        let (request, action_id) = self.assemble_request(target, hasher, workspace_root)?;
        let timeout = target.timeout.unwrap_or(self.default_timeout);

        // register before submitting so a fast completion cannot be lost
        let registration = self.tracker.register(request.action_id.clone());
        report::get_default(|r| r.on_remote_dispatch(&target.id, ActionKind::Custom));

        if let Err(err) = self.submit_with_retry(&request) {
            self.guard.observe(false);
            return Err(err);
        }

        let completion = match registration.wait(timeout) {
            Ok(completion) => completion,
            Err(err) => {
                // tracker timeout: the worker may still be running, but for
                // this build the action is dead
                self.guard.observe(false);
                return Err(err);
            }
        };

        self.finish(target, &action_id, completion, out_dir)
    }

    /// Transport failures are retried with the policy's backoff.
    fn submit_with_retry(&self, request: &ActionRequest) -> Result<()> {
        let retry = *self.guard.retry();
        let mut attempt = 0;
        loop {
            match self.transport.submit(request.clone()) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt > retry.max_retries {
                        return Err(BuildError::CoordinatorUnreachable(format!(
                            "{} after {attempt} attempts: {err}",
                            self.transport.endpoint()
                        )));
                    }
                    let backoff = retry.backoff(attempt);
                    trace!(%err, attempt, ?backoff, "retrying remote submit");
                    std::thread::sleep(backoff);
                }
            }
        }
    }

    /// Uploads inputs and assembles the wire request.
    fn assemble_request(
        &self,
        target: &Target,
        hasher: &FileHasher,
        workspace_root: &Path,
    ) -> Result<(ActionRequest, ActionId)> {
        let mut inputs = Vec::with_capacity(target.sources.len());
        let mut input_hashes = Vec::with_capacity(target.sources.len());
        for source in &target.sources {
            let bytes = utils::read_bytes(source)?;
            let hash = self.store.put(&bytes)?;
            input_hashes.push(hasher.hash_file(source)?);
            inputs.push(InputSpec {
                path: utils::strip_prefix(source, workspace_root)
                    .to_string_lossy()
                    .replace('\\', "/"),
                content_hash: hash.to_hex(),
            });
        }

        let command = target.config["build"]["command"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("build {}", target.id));

        let metadata: BTreeMap<String, String> =
            BTreeMap::from([("command".to_string(), command.clone())]);
        let action_id = ActionId::new(
            target.id.clone(),
            ActionKind::Custom,
            inputs_hash(&input_hashes, &metadata),
            "remote",
        );

        let outputs = vec![OutputSpec {
            path: target
                .output
                .as_ref()
                .map(|o| o.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|| format!("out/{}", target.id.name())),
            is_dir: false,
        }];

        let request = ActionRequest {
            action_id: action_id.digest(),
            command,
            sandbox: SandboxSpec {
                inputs,
                outputs,
                env: target.env.clone(),
                capabilities: Capabilities {
                    network: target.flags.iter().any(|f| f == "network"),
                    read_paths: Vec::new(),
                    write_paths: Vec::new(),
                    timeout_ms: target
                        .timeout
                        .unwrap_or(self.default_timeout)
                        .as_millis() as u64,
                    max_memory: 0,
                },
            },
        };
        Ok((request, action_id))
    }

    /// Folds a completion into a build outcome, downloading outputs on
    /// success.
    fn finish(
        &self,
        target: &Target,
        _action_id: &ActionId,
        completion: ActionCompletion,
        out_dir: &Path,
    ) -> Result<BuildOutcome> {
        match completion.status {
            RemoteStatus::Success => {
                self.guard.observe(true);
                let mut outputs = Vec::new();
                for (idx, artifact) in completion.output_artifacts.iter().enumerate() {
                    let hash = ContentHash::from_hex(artifact)?;
                    let bytes = self.store.get(&hash)?;
                    let name = if idx == 0 {
                        target.id.name().to_string()
                    } else {
                        format!("{}.{idx}", target.id.name())
                    };
                    let path = out_dir.join(target.id.package()).join(name);
                    utils::write_file(&path, &bytes)?;
                    outputs.push(path);
                }
                let mut outcome = BuildOutcome::success(outputs);
                if !completion.stdout.is_empty() {
                    outcome.diagnostics =
                        completion.stdout.lines().map(str::to_string).collect();
                }
                Ok(outcome)
            }
            RemoteStatus::Timeout => {
                self.guard.observe(false);
                Err(BuildError::ProcessTimeout {
                    target: target.id.to_string(),
                    timeout_ms: completion.duration_ms,
                })
            }
            RemoteStatus::Failed | RemoteStatus::Rejected => {
                self.guard.observe(false);
                Err(BuildError::WorkerError {
                    target: target.id.to_string(),
                    message: if completion.stderr.is_empty() {
                        format!("remote action {:?}", completion.status)
                    } else {
                        completion.stderr
                    },
                })
            }
        }
    }
}
