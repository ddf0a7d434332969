//! Error taxonomy for the execution engine.
//!
//! Callers match on variants to tell "the platform failed" (build, boot,
//! sandbox, storage) from "the agent failed" (task error, timeout).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors surfaced by [`crate::Dispatcher`] operations.
///
/// The type is `Clone` so a single build result can be shared by every
/// caller waiting on the same in-flight build.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The agent payload is malformed or uses an unsupported schema.
    #[error("Agent definition is invalid: {reason}")]
    DefinitionInvalid { reason: String },

    /// The agent name cannot be used as a record key.
    #[error("Invalid agent name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Dependency or model materialization failed while building the image.
    #[error("Image build failed: {reason}")]
    BuildFailed { reason: String },

    /// No agent is registered under this name.
    #[error("Agent not found: {name}")]
    AgentNotFound { name: String },

    /// The agent exists but has no usable image (build failed or still pending).
    #[error("Agent '{name}' is not ready: {reason}")]
    AgentNotReady { name: String, reason: String },

    /// The sandbox instance could not be brought up.
    #[error("Sandbox failed to boot after {attempts} attempt(s): {reason}")]
    BootFailure { attempts: u32, reason: String },

    /// The task exceeded its wall-clock limit.
    #[error("Task timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// The invocation was cancelled by the caller.
    #[error("Invocation was cancelled")]
    Cancelled,

    /// The agent's own logic failed inside the sandbox.
    #[error("Task failed with exit code {exit_code}: {message}")]
    TaskExecutionError { exit_code: i64, message: String },

    /// The sandbox runtime broke while the task was running, so the agent
    /// never got to report a result.
    #[error("Sandbox failed during execution: {reason}")]
    SandboxFailure { reason: String },

    /// Durable state could not be read or written.
    #[error("Storage error: {message}")]
    Storage { message: String },
}

/// Stable, serializable error code recorded in the invocation audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// See [`EngineError::DefinitionInvalid`].
    DefinitionInvalid,
    /// See [`EngineError::InvalidName`].
    InvalidName,
    /// See [`EngineError::BuildFailed`].
    BuildFailed,
    /// See [`EngineError::AgentNotFound`].
    AgentNotFound,
    /// See [`EngineError::AgentNotReady`].
    AgentNotReady,
    /// See [`EngineError::BootFailure`].
    BootFailure,
    /// See [`EngineError::Timeout`].
    Timeout,
    /// See [`EngineError::Cancelled`].
    Cancelled,
    /// See [`EngineError::TaskExecutionError`].
    TaskExecutionError,
    /// See [`EngineError::SandboxFailure`].
    SandboxFailure,
    /// See [`EngineError::Storage`].
    Storage,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DefinitionInvalid => "definition-invalid",
            Self::InvalidName => "invalid-name",
            Self::BuildFailed => "build-failed",
            Self::AgentNotFound => "agent-not-found",
            Self::AgentNotReady => "agent-not-ready",
            Self::BootFailure => "boot-failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::TaskExecutionError => "task-execution-error",
            Self::SandboxFailure => "sandbox-failure",
            Self::Storage => "storage",
        };
        f.write_str(s)
    }
}

impl EngineError {
    /// Creates a `DefinitionInvalid` error.
    pub fn definition_invalid(reason: impl Into<String>) -> Self {
        Self::DefinitionInvalid {
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidName` error.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `BuildFailed` error.
    pub fn build_failed(reason: impl Into<String>) -> Self {
        Self::BuildFailed {
            reason: reason.into(),
        }
    }

    /// Creates an `AgentNotFound` error.
    pub fn agent_not_found(name: impl Into<String>) -> Self {
        Self::AgentNotFound { name: name.into() }
    }

    /// Creates an `AgentNotReady` error.
    pub fn agent_not_ready(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AgentNotReady {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `BootFailure` error.
    pub fn boot_failure(attempts: u32, reason: impl Into<String>) -> Self {
        Self::BootFailure {
            attempts,
            reason: reason.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates a `TaskExecutionError`.
    pub fn task_failed(exit_code: i64, message: impl Into<String>) -> Self {
        Self::TaskExecutionError {
            exit_code,
            message: message.into(),
        }
    }

    /// Creates a `SandboxFailure` error.
    pub fn sandbox_failure(reason: impl Into<String>) -> Self {
        Self::SandboxFailure {
            reason: reason.into(),
        }
    }

    /// Creates a `Storage` error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Returns the stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::DefinitionInvalid { .. } => ErrorCode::DefinitionInvalid,
            Self::InvalidName { .. } => ErrorCode::InvalidName,
            Self::BuildFailed { .. } => ErrorCode::BuildFailed,
            Self::AgentNotFound { .. } => ErrorCode::AgentNotFound,
            Self::AgentNotReady { .. } => ErrorCode::AgentNotReady,
            Self::BootFailure { .. } => ErrorCode::BootFailure,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::TaskExecutionError { .. } => ErrorCode::TaskExecutionError,
            Self::SandboxFailure { .. } => ErrorCode::SandboxFailure,
            Self::Storage { .. } => ErrorCode::Storage,
        }
    }

    /// Returns true if the platform failed rather than the agent or the caller.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::BuildFailed { .. }
                | Self::BootFailure { .. }
                | Self::SandboxFailure { .. }
                | Self::Storage { .. }
        )
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the agent name is unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::AgentNotFound { .. })
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage(err.to_string())
    }
}
