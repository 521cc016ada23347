//! Wire types of the remote action protocol.
//!
//! An [`ActionRequest`] ships a hermetic description of one action to a
//! worker; an [`ActionCompletion`] comes back through the coordinator.
//! Captured output is bounded at construction so a chatty compiler cannot
//! blow up the completion message.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bytes of stdout/stderr kept in a completion message.
pub const MAX_STREAM_BYTES: usize = 64 * 1024;

/// One input file, addressed by content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub path: String,
    pub content_hash: String,
}

/// One expected output path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub path: String,
    pub is_dir: bool,
}

/// Resource and access envelope of a sandboxed action.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub network: bool,
    #[serde(default)]
    pub read_paths: Vec<String>,
    #[serde(default)]
    pub write_paths: Vec<String>,
    pub timeout_ms: u64,
    /// Zero means unlimited.
    pub max_memory: u64,
}

/// Hermetic description of an action's inputs, outputs, environment and
/// limits.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub env: BTreeMap<String, String>,
    pub capabilities: Capabilities,
}

/// Request submitted to the remote coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_id: String,
    pub command: String,
    #[serde(flatten)]
    pub sandbox: SandboxSpec,
}

/// Terminal status of a remote action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Success,
    Failed,
    Timeout,
    Rejected,
}

/// Worker-side resource usage, echoed for observability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_ms: u64,
    pub max_rss_bytes: u64,
}

/// Completion message delivered by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCompletion {
    pub action_id: String,
    pub status: RemoteStatus,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    /// Content hashes of produced artifacts, fetchable from the store.
    #[serde(default)]
    pub output_artifacts: Vec<String>,
}

impl ActionCompletion {
    /// Builds a completion with bounded streams.
    pub fn new(action_id: impl Into<String>, status: RemoteStatus) -> Self {
        Self {
            action_id: action_id.into(),
            status,
            duration_ms: 0,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            resource_usage: ResourceUsage::default(),
            output_artifacts: Vec::new(),
        }
    }

    pub fn with_streams(mut self, stdout: &str, stderr: &str) -> Self {
        self.stdout = truncate(stdout);
        self.stderr = truncate(stderr);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RemoteStatus::Success
    }
}

fn truncate(stream: &str) -> String {
    if stream.len() <= MAX_STREAM_BYTES {
        return stream.to_string();
    }
    let mut end = MAX_STREAM_BYTES;
    while !stream.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated]", &stream[..end])
}
