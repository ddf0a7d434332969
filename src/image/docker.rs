//! Docker image backend.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info};

use super::{BuildContext, ImageBackend};

/// Builds agent images with the local Docker daemon.
pub struct DockerImageBackend {
    docker: Docker,
}

impl DockerImageBackend {
    /// Backend using an already connected daemon client.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ImageBackend for DockerImageBackend {
    async fn build(&self, tag: &str, context: BuildContext) -> Result<()> {
        let build_options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let tar_bytes = context.to_tar()?;
        let mut stream = self.docker.build_image(build_options, None, Some(tar_bytes));

        info!("Building image {}...", tag);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => {
                    if let Some(stream_text) = &output.stream {
                        let trimmed = stream_text.trim();
                        if !trimmed.is_empty() {
                            debug!("build {}: {}", tag, trimmed);
                        }
                    } else if let Some(error) = &output.error {
                        bail!("Docker build error: {error}");
                    } else if let Some(error_detail) = &output.error_detail {
                        if let Some(message) = &error_detail.message {
                            bail!("Docker build error: {message}");
                        }
                    }
                }
                Err(e) => bail!("Error building image: {e}"),
            }
        }

        Ok(())
    }

    async fn remove(&self, tag: &str) -> Result<()> {
        // Not forced: an image still used by a sandbox, possibly of another
        // engine process, is refused with 409 and kept for a later prune.
        let options = RemoveImageOptions {
            force: false,
            ..Default::default()
        };
        match self.docker.remove_image(tag, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove image {tag}")),
        }
    }
}
