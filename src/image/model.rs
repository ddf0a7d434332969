//! Model materialization.
//!
//! Before an image is built every declared model must be available at
//! its source. Ollama models are pulled; LM Studio models are loaded on
//! demand by the runner, so they are only checked for presence.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::agent::{ModelProvider, ModelRef};
use crate::config::ModelsConfig;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A model that is available to the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedModel {
    /// The declared model.
    pub reference: ModelRef,
    /// Size reported by the source, when it reports one.
    pub size_bytes: Option<u64>,
}

/// Source of model weights.
#[async_trait]
pub trait ModelSource: Send + Sync {
    /// Make `model` available, pulling it if needed.
    async fn materialize(&self, model: &ModelRef) -> Result<MaterializedModel>;
}

/// Model source backed by local Ollama and LM Studio HTTP endpoints.
pub struct HttpModelSource {
    client: reqwest::Client,
    config: ModelsConfig,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModels {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
}

impl HttpModelSource {
    /// Client for the servers in `config`.
    pub fn new(config: ModelsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.pull_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, config })
    }

    async fn pull_ollama(&self, id: &str) -> Result<Option<u64>> {
        let endpoint = self.config.ollama_endpoint.trim_end_matches('/');
        info!("Pulling model {} from {}", id, endpoint);

        let max_attempts = 3;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay_secs = 1u64 << attempt;
                debug!("Model pull retry {} after {}s", attempt + 1, delay_secs);
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            }

            let response = self
                .client
                .post(format!("{endpoint}/api/pull"))
                .json(&json!({ "model": id, "stream": false }))
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    last_error = None;
                    break;
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if status.as_u16() == 404 || body.contains("not found") {
                        bail!("Model {id} not found in the Ollama registry");
                    }
                    if !status.is_server_error() {
                        bail!("Ollama returned {status} pulling {id}: {body}");
                    }
                    last_error = Some(format!("Ollama returned {status}: {body}"));
                }
                Err(e) if e.is_timeout() => {
                    bail!(
                        "Model {id} pull timed out after {}s (likely larger than {} GB)",
                        self.config.pull_timeout_secs,
                        self.config.size_limit_gb
                    );
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        if let Some(error) = last_error {
            bail!("Model {id} pull failed after {max_attempts} attempts: {error}");
        }

        let tags: OllamaTags = self
            .client
            .get(format!("{endpoint}/api/tags"))
            .send()
            .await
            .context("Failed to list Ollama models")?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse Ollama model list")?;

        Ok(tags
            .models
            .iter()
            .find(|m| ollama_name_matches(&m.name, id))
            .and_then(|m| m.size))
    }

    async fn check_lmstudio(&self, id: &str) -> Result<()> {
        let endpoint = self.config.lmstudio_endpoint.trim_end_matches('/');
        let models: OpenAiModels = self
            .client
            .get(format!("{endpoint}/v1/models"))
            .send()
            .await
            .with_context(|| format!("Failed to reach LM Studio at {endpoint}"))?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse LM Studio model list")?;

        if models.data.iter().any(|m| m.id == id) {
            Ok(())
        } else {
            bail!("Model {id} is not available in LM Studio at {endpoint}")
        }
    }
}

#[async_trait]
impl ModelSource for HttpModelSource {
    async fn materialize(&self, model: &ModelRef) -> Result<MaterializedModel> {
        let size_bytes = match model.provider {
            ModelProvider::Ollama => self.pull_ollama(&model.id).await?,
            ModelProvider::LmStudio => {
                self.check_lmstudio(&model.id).await?;
                None
            }
        };

        check_size(model, size_bytes, self.config.size_limit_gb)?;

        Ok(MaterializedModel {
            reference: model.clone(),
            size_bytes,
        })
    }
}

/// Ollama lists untagged pulls as `name:latest`.
fn ollama_name_matches(listed: &str, id: &str) -> bool {
    listed == id || (!id.contains(':') && listed == format!("{id}:latest"))
}

#[allow(clippy::cast_precision_loss)]
fn check_size(model: &ModelRef, size_bytes: Option<u64>, limit_gb: f64) -> Result<()> {
    if let Some(size) = size_bytes {
        let size_gb = size as f64 / BYTES_PER_GB;
        if size_gb > limit_gb {
            bail!(
                "Model {model} size ({size_gb:.2} GB) exceeds the {limit_gb} GB limit. \
                 Kratos supports models up to {limit_gb} GB for efficiency."
            );
        }
    }
    Ok(())
}
