//! Build context assembly: a generated Dockerfile plus the agent payload,
//! packed into an in-memory tarball for the image backend.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::fmt::Write;
use tar::{Builder, Header};

use super::{BuildRequest, BuilderSettings, ImageHandle};

/// Name of the definition file inside the image workdir.
pub const AGENT_FILE: &str = "agent.json";
const DOCKERFILE: &str = "Dockerfile";

/// Everything an image backend needs to build one agent image.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Generated Dockerfile.
    pub dockerfile: String,
    /// Tar archive holding the Dockerfile and the definition.
    pub payload: Vec<u8>,
}

impl BuildContext {
    /// Layer base runtime, extra dependencies and payload.
    pub fn assemble(
        settings: &BuilderSettings,
        handle: &ImageHandle,
        request: &BuildRequest,
    ) -> Result<Self> {
        for dep in &request.dependencies {
            validate_dependency(dep)?;
        }

        let workdir = settings.workdir.trim_end_matches('/');
        let agent_path = format!("{workdir}/{AGENT_FILE}");
        let models: Vec<String> = handle
            .models
            .iter()
            .map(|m| m.reference.to_string())
            .collect();

        let mut dockerfile = String::new();
        writeln!(dockerfile, "# Generated by kratos for agent '{}'", request.agent_name)?;
        writeln!(dockerfile, "FROM {}", settings.base_image)?;
        writeln!(dockerfile, "WORKDIR {workdir}")?;
        if request.dependencies.is_empty() {
            writeln!(dockerfile, "# No additional dependencies")?;
        } else {
            writeln!(
                dockerfile,
                "RUN {} {}",
                settings.install_command,
                shell_words::join(&request.dependencies)
            )?;
        }
        writeln!(dockerfile, "COPY {AGENT_FILE} {agent_path}")?;
        writeln!(dockerfile, "ENV KRATOS_AGENT_FILE=\"{agent_path}\"")?;
        writeln!(dockerfile, "ENV KRATOS_MODELS=\"{}\"", models.join(","))?;
        writeln!(
            dockerfile,
            "LABEL kratos.fingerprint=\"{}\" kratos.agent=\"{}\"",
            handle.fingerprint, request.agent_name
        )?;

        Ok(Self {
            dockerfile,
            payload: request.definition.clone(),
        })
    }

    /// Pack the context into a tarball.
    pub fn to_tar(&self) -> Result<Bytes> {
        let mut tar_buf = Vec::new();
        {
            let mut tar = Builder::new(&mut tar_buf);
            append_file(&mut tar, DOCKERFILE, self.dockerfile.as_bytes())?;
            append_file(&mut tar, AGENT_FILE, &self.payload)?;
            tar.finish().context("Failed to finalize build context")?;
        }
        Ok(Bytes::from(tar_buf))
    }
}

fn append_file(tar: &mut Builder<&mut Vec<u8>>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, path, data)
        .with_context(|| format!("Failed to add {path} to build context"))
}

/// Reject dependency strings that would be read as installer flags or
/// break out of the generated `RUN` line.
pub fn validate_dependency(dep: &str) -> Result<()> {
    if dep.starts_with('-') {
        bail!("dependency '{dep}' looks like an installer flag");
    }
    if dep.chars().any(char::is_control) {
        bail!("dependency '{}' contains control characters", dep.escape_debug());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ModelProvider, ModelRef};
    use crate::image::{Fingerprint, MaterializedModel};
    use std::io::Read;
    use std::time::Duration;

    fn settings() -> BuilderSettings {
        BuilderSettings {
            base_image: "kratos-agent-base:latest".to_string(),
            tag_prefix: "kratos-agent".to_string(),
            workdir: "/workdir/".to_string(),
            install_command: "uv add".to_string(),
            build_timeout: Duration::from_secs(600),
        }
    }

    fn request(deps: &[&str]) -> BuildRequest {
        BuildRequest {
            agent_name: "agent-finance".to_string(),
            definition: br#"{"schema_version":1}"#.to_vec(),
            dependencies: deps.iter().map(ToString::to_string).collect(),
            model_refs: std::collections::BTreeSet::new(),
        }
    }

    fn handle() -> ImageHandle {
        let model = MaterializedModel {
            reference: ModelRef::new(ModelProvider::Ollama, "qwen3:4b"),
            size_bytes: Some(2_500_000_000),
        };
        ImageHandle::new(
            Fingerprint::compute("base", &[], b"def"),
            "kratos-agent",
            vec![model],
        )
    }

    #[test]
    fn test_dockerfile_layers() {
        let ctx = BuildContext::assemble(&settings(), &handle(), &request(&["yfinance"])).unwrap();
        let lines: Vec<&str> = ctx.dockerfile.lines().collect();

        assert_eq!(lines[1], "FROM kratos-agent-base:latest");
        assert_eq!(lines[2], "WORKDIR /workdir");
        assert_eq!(lines[3], "RUN uv add yfinance");
        assert_eq!(lines[4], "COPY agent.json /workdir/agent.json");
        assert!(ctx.dockerfile.contains("KRATOS_MODELS=\"ollama/qwen3:4b\""));
        assert!(ctx.dockerfile.contains("kratos.agent=\"agent-finance\""));
    }

    #[test]
    fn test_dependencies_are_shell_quoted() {
        let ctx =
            BuildContext::assemble(&settings(), &handle(), &request(&["yfinance>=0.2", "ddgs"]))
                .unwrap();
        assert!(ctx.dockerfile.contains("RUN uv add 'yfinance>=0.2' ddgs"));
    }

    #[test]
    fn test_no_dependencies() {
        let ctx = BuildContext::assemble(&settings(), &handle(), &request(&[])).unwrap();
        assert!(ctx.dockerfile.contains("# No additional dependencies"));
        assert!(!ctx.dockerfile.contains("RUN"));
    }

    #[test]
    fn test_rejects_flag_and_newline_dependencies() {
        assert!(validate_dependency("--index-url=http://evil").is_err());
        assert!(validate_dependency("ddgs\nRUN curl evil").is_err());
        assert!(validate_dependency("duckduckgo-search").is_ok());
        assert!(BuildContext::assemble(&settings(), &handle(), &request(&["-e ."])).is_err());
    }

    #[test]
    fn test_tarball_contains_dockerfile_and_payload() {
        let ctx = BuildContext::assemble(&settings(), &handle(), &request(&[])).unwrap();
        let bytes = ctx.to_tar().unwrap();

        let mut archive = tar::Archive::new(bytes.as_ref());
        let mut found = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            found.push((path, content));
        }

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, "Dockerfile");
        assert_eq!(found[1].0, "agent.json");
        assert_eq!(found[1].1, br#"{"schema_version":1}"#);
    }
}
