//! Isolated, single-use execution environments.
//!
//! A [`SandboxProvider`] is the narrow interface to the isolation
//! technology. [`SandboxManager`] drives one instance per invocation
//! through its lifecycle and guarantees teardown.

mod docker;
mod error;
pub mod lifecycle;

pub use docker::{connect, DockerSandbox};
pub use error::SandboxError;
pub use lifecycle::{LifecycleSettings, Reclamation, ResolvedLimits, RunOutcome, SandboxManager, SandboxState};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Label carried by every instance Kratos creates.
pub const INSTANCE_LABEL: &str = "kratos.instance";
/// Label naming the agent an instance runs.
pub const AGENT_LABEL: &str = "kratos.agent";
/// Label naming the engine process that created an instance.
pub const OWNER_LABEL: &str = "kratos.owner";

/// Most bytes kept of each output stream of one exec. Anything beyond is
/// still streamed to the caller's sink but not captured.
pub const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

/// Identity of one sandbox instance, assigned before creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Fresh id of the form `kratos-invoke-<agent>-<8 hex>`.
    pub fn generate(agent_name: &str) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!("kratos-invoke-{agent_name}-{}", &nonce[..8]))
    }

    /// Wrap an existing id, such as one read back from the provider.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a container name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to create one instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Name the instance is created under.
    pub id: InstanceId,
    /// Agent the instance runs.
    pub agent_name: String,
    /// Engine process that owns the instance; see [`crate::lock::ProcessOwner`].
    pub owner: String,
    /// Image tag to create the instance from.
    pub image: String,
    /// Working directory of the task command.
    pub workdir: String,
    /// Environment of the task command.
    pub env: Vec<(String, String)>,
    /// Hard memory limit.
    pub memory_bytes: i64,
    /// CPU quota in billionths of a CPU.
    pub nano_cpus: i64,
}

/// An instance as reported by [`SandboxProvider::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    /// Instance name.
    pub id: InstanceId,
    /// Missing on instances created before owners were recorded.
    pub owner: Option<String>,
}

/// Captured result of one command run inside an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit status of the command.
    pub exit_code: i64,
    /// Either stream went past [`MAX_CAPTURE_BYTES`] and was cut short.
    pub truncated: bool,
}

/// Which stream a chunk of task output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output of the task.
    Stdout,
    /// Standard error of the task.
    Stderr,
}

/// Receives task output while the task is still running.
pub type OutputSink = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// Accumulates one output stream up to a byte limit.
#[derive(Debug)]
pub struct CaptureBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl CaptureBuffer {
    /// An empty buffer keeping at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append `chunk`, cutting it on a character boundary at the limit.
    pub fn push(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }

        let mut end = room;
        while !chunk.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&chunk[..end]);
        self.truncated = true;
    }

    /// The captured text and whether anything was dropped.
    pub fn finish(self) -> (String, bool) {
        (self.text, self.truncated)
    }
}

/// Isolation backend.
///
/// `destroy` must be idempotent: destroying a missing instance succeeds.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Allocate an instance without starting it.
    async fn create(&self, spec: &InstanceSpec) -> Result<(), SandboxError>;

    /// Boot a created instance.
    async fn start(&self, id: &InstanceId) -> Result<(), SandboxError>;

    /// Run a command to completion. Arguments are passed as-is, never
    /// through a shell. With a `sink`, output is also handed over chunk by
    /// chunk as it arrives.
    async fn exec(
        &self,
        id: &InstanceId,
        command: &[String],
        sink: Option<&OutputSink>,
    ) -> Result<ExecOutput, SandboxError>;

    /// Forcibly stop everything running in the instance.
    async fn kill(&self, id: &InstanceId) -> Result<(), SandboxError>;

    /// Release the instance and every resource it holds.
    async fn destroy(&self, id: &InstanceId) -> Result<(), SandboxError>;

    /// Every instance carrying [`INSTANCE_LABEL`], live or not.
    async fn list(&self) -> Result<Vec<InstanceInfo>, SandboxError>;
}
