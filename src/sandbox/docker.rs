//! Docker-backed sandbox provider.
//!
//! Each instance is a container kept alive by `sleep infinity`; the task
//! runs through `docker exec`, so boot and execution are separate steps
//! with separate timeouts.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::service::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{
    CaptureBuffer, ExecOutput, InstanceId, InstanceInfo, InstanceSpec, OutputSink, OutputStream,
    SandboxError, SandboxProvider, AGENT_LABEL, INSTANCE_LABEL, MAX_CAPTURE_BYTES, OWNER_LABEL,
};

/// Lets the runner inside the container reach model servers on the host.
const HOST_GATEWAY: &str = "host.docker.internal:host-gateway";

/// Connect to the local Docker daemon and check it answers.
pub async fn connect() -> Result<Docker, SandboxError> {
    let docker = Docker::connect_with_local_defaults().map_err(|e| {
        SandboxError::docker_unavailable(format!("Failed to connect to Docker: {e}"))
    })?;

    docker.ping().await.map_err(|e| {
        SandboxError::docker_unavailable(format!("Cannot ping Docker daemon: {e}"))
    })?;

    Ok(docker)
}

/// Runs instances as local Docker containers.
pub struct DockerSandbox {
    docker: Docker,
}

impl DockerSandbox {
    /// Wrap a connected Docker client.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_config(spec: &InstanceSpec) -> ContainerConfig<String> {
        let labels = HashMap::from([
            (INSTANCE_LABEL.to_string(), spec.id.to_string()),
            (AGENT_LABEL.to_string(), spec.agent_name.clone()),
            (OWNER_LABEL.to_string(), spec.owner.clone()),
        ]);
        let env = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(spec.workdir.clone()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_bytes),
                // Same value as memory disables swap.
                memory_swap: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                extra_hosts: Some(vec![HOST_GATEWAY.to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn map_error(id: &InstanceId, action: &str, e: DockerError) -> SandboxError {
    match e {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => SandboxError::instance_not_found(id.as_str()),
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => SandboxError::container_unhealthy(message),
        other => SandboxError::container_failed(format!("{action} {id}: {other}")),
    }
}

#[async_trait]
impl SandboxProvider for DockerSandbox {
    async fn create(&self, spec: &InstanceSpec) -> Result<(), SandboxError> {
        debug!("Creating container: {}", spec.id);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.id.to_string(),
                    platform: None,
                }),
                Self::container_config(spec),
            )
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::image_not_found(&spec.image),
                other => map_error(&spec.id, "create", other),
            })?;
        Ok(())
    }

    async fn start(&self, id: &InstanceId) -> Result<(), SandboxError> {
        debug!("Starting container: {}", id);
        self.docker
            .start_container::<String>(id.as_str(), None)
            .await
            .map_err(|e| map_error(id, "start", e))
    }

    async fn exec(
        &self,
        id: &InstanceId,
        command: &[String],
        sink: Option<&OutputSink>,
    ) -> Result<ExecOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                id.as_str(),
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_error(id, "create exec in", e))?;

        let mut stdout = CaptureBuffer::new(MAX_CAPTURE_BYTES);
        let mut stderr = CaptureBuffer::new(MAX_CAPTURE_BYTES);

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_error(id, "start exec in", e))?
        {
            while let Some(chunk) = stream.next().await {
                let (kind, message) = match chunk {
                    Ok(LogOutput::StdOut { message }) => (OutputStream::Stdout, message),
                    Ok(LogOutput::StdErr { message }) => (OutputStream::Stderr, message),
                    Err(e) => {
                        warn!("Error reading exec output from {}: {}", id, e);
                        continue;
                    }
                    _ => continue,
                };

                let text = String::from_utf8_lossy(&message);
                if let Some(sink) = sink {
                    sink(kind, &*text);
                }
                match kind {
                    OutputStream::Stdout => stdout.push(&text),
                    OutputStream::Stderr => stderr.push(&text),
                }
            }
        }

        let (stdout, stdout_truncated) = stdout.finish();
        let (stderr, stderr_truncated) = stderr.finish();
        let mut output = ExecOutput {
            stdout,
            stderr,
            truncated: stdout_truncated || stderr_truncated,
            ..ExecOutput::default()
        };

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_error(id, "inspect exec in", e))?;
        output.exit_code = inspect.exit_code.ok_or_else(|| {
            SandboxError::container_unhealthy(format!("exec in {id} reported no exit code"))
        })?;

        Ok(output)
    }

    async fn kill(&self, id: &InstanceId) -> Result<(), SandboxError> {
        debug!("Killing container: {}", id);
        match self
            .docker
            .kill_container(id.as_str(), Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            // Already gone or not running.
            Err(DockerError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(map_error(id, "kill", e)),
        }
    }

    async fn destroy(&self, id: &InstanceId) -> Result<(), SandboxError> {
        debug!("Removing container: {}", id);
        match self
            .docker
            .remove_container(
                id.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(map_error(id, "remove", e)),
        }
    }

    async fn list(&self) -> Result<Vec<InstanceInfo>, SandboxError> {
        let filters = HashMap::from([("label".to_string(), vec![INSTANCE_LABEL.to_string()])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::docker_unavailable(format!("Failed to list containers: {e}")))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let labels = c.labels.unwrap_or_default();
                let id = labels.get(INSTANCE_LABEL).cloned().or_else(|| {
                    c.names
                        .as_ref()
                        .and_then(|names| names.first())
                        .map(|name| name.trim_start_matches('/').to_string())
                })?;
                Some(InstanceInfo {
                    id: InstanceId::new(id),
                    owner: labels.get(OWNER_LABEL).cloned(),
                })
            })
            .collect())
    }
}
