//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

/// Errors a [`super::SandboxProvider`] can report.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Container image was not found.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// The instance does not exist (already destroyed or never created).
    #[error("Sandbox instance not found: {id}")]
    InstanceNotFound { id: String },

    /// Container is in an unrecoverable state (dead, removing, etc.).
    #[error("Container is unhealthy: {message}")]
    ContainerUnhealthy { message: String },

    /// Container operation failed (create, start, exec, etc.).
    #[error("Container operation failed: {message}")]
    ContainerFailed { message: String },
}

impl SandboxError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates an `InstanceNotFound` error.
    pub fn instance_not_found(id: impl Into<String>) -> Self {
        Self::InstanceNotFound { id: id.into() }
    }

    /// Creates a `ContainerUnhealthy` error.
    pub fn container_unhealthy(message: impl Into<String>) -> Self {
        Self::ContainerUnhealthy {
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Returns true if this is a Docker unavailability error.
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }

    /// Returns true if this is an image not found error.
    pub fn is_image_not_found(&self) -> bool {
        matches!(self, Self::ImageNotFound { .. })
    }

    /// Returns true if the instance is already gone.
    pub fn is_instance_not_found(&self) -> bool {
        matches!(self, Self::InstanceNotFound { .. })
    }
}
