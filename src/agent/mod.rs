//! Agent definitions: the versioned payload schema and the model
//! references it declares.
//!
//! A definition is opaque bytes to the store and the builder. Only the
//! extractor parses it, and it does so against an explicit schema:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "model": { "provider": "ollama", "id": "qwen3:4b" },
//!   "tools": [{ "name": "duckduckgo" }],
//!   "instructions": "You are a finance agent.",
//!   "limits": { "timeout_seconds": 120, "max_memory": "2g" }
//! }
//! ```

mod extract;
pub mod store;

pub use extract::{extract, parse_definition};
pub use store::{AgentRecord, AgentStatus, AgentStore};

use serde::{Deserialize, Serialize};

/// The only schema version this engine understands.
pub const SCHEMA_VERSION: u32 = 1;

/// Model providers whose weights can be materialized locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    /// Models pulled through an Ollama server.
    Ollama,
    /// Models served by LM Studio.
    LmStudio,
}

impl std::fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ollama => write!(f, "ollama"),
            Self::LmStudio => write!(f, "lmstudio"),
        }
    }
}

impl std::str::FromStr for ModelProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "lmstudio" => Ok(Self::LmStudio),
            _ => Err(format!(
                "Kratos only supports local models for efficient compute (ollama, lmstudio). Found: {s}"
            )),
        }
    }
}

/// A model an agent depends on, resolved to weights only at build time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    /// Backend serving the model.
    pub provider: ModelProvider,
    /// Model name as the provider knows it.
    pub id: String,
}

impl ModelRef {
    /// Reference to model `id` of `provider`.
    pub fn new(provider: ModelProvider, id: impl Into<String>) -> Self {
        Self {
            provider,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.id)
    }
}

/// Resource limits an agent or a single call may request.
///
/// Unset fields fall through to the next layer: call, then agent, then
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitOverrides {
    /// Wall-clock limit in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Memory limit such as `512m` or `2g`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<String>,
}

impl LimitOverrides {
    /// Fields set here win; unset fields come from `fallback`.
    #[must_use]
    pub fn or(&self, fallback: &Self) -> Self {
        Self {
            timeout_seconds: self.timeout_seconds.or(fallback.timeout_seconds),
            max_memory: self
                .max_memory
                .clone()
                .or_else(|| fallback.max_memory.clone()),
        }
    }
}

/// Model section of a definition, before provider validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    /// Provider name as written; checked when models are extracted.
    pub provider: String,
    /// Model name.
    pub id: String,
}

/// A tool the agent calls; some tools run their own model.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    /// Tool name.
    pub name: String,
    /// Model the tool runs, if any.
    #[serde(default)]
    pub model: Option<ModelSpec>,
}

/// Parsed agent payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentDefinition {
    /// Definition format version; only 1 is accepted.
    pub schema_version: u32,
    /// Display name inside the agent runtime.
    #[serde(default)]
    pub name: Option<String>,
    /// Model the agent talks to.
    pub model: ModelSpec,
    /// Tools the agent may call.
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    /// System prompt.
    #[serde(default)]
    pub instructions: String,
    /// Limit defaults for every invocation of the agent.
    #[serde(default)]
    pub limits: LimitOverrides,
}
