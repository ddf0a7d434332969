//! Engine configuration loaded from `kratos.toml`.
//!
//! Every field has a default so an empty or missing file yields a
//! working local setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "kratos.toml";

/// Engine configuration, read from `kratos.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Base runtime and command
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Local model servers
    #[serde(default)]
    pub models: ModelsConfig,
    /// Invocation limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Image builds
    #[serde(default)]
    pub build: BuildConfig,
    /// Persisted state
    #[serde(default)]
    pub storage: StorageConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Base runtime every agent image is layered on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Base image reference, part of every content fingerprint
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// Working directory inside the sandbox; the agent payload lands here
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Runner command inside the sandbox; the task is appended as the last argument
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    /// Package install command used for declared extra dependencies
    #[serde(default = "default_install_command")]
    pub install_command: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            workdir: default_workdir(),
            command: default_command(),
            install_command: default_install_command(),
        }
    }
}

/// Where model weights are materialized from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Ollama endpoint used to pull `ollama` models
    #[serde(default = "default_ollama_endpoint")]
    pub ollama_endpoint: String,

    /// LM Studio endpoint used to verify `lmstudio` models
    #[serde(default = "default_lmstudio_endpoint")]
    pub lmstudio_endpoint: String,

    /// Largest model accepted, in gigabytes
    #[serde(default = "default_size_limit_gb")]
    pub size_limit_gb: f64,

    /// Timeout for a single model pull
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            ollama_endpoint: default_ollama_endpoint(),
            lmstudio_endpoint: default_lmstudio_endpoint(),
            size_limit_gb: default_size_limit_gb(),
            pull_timeout_secs: default_pull_timeout(),
        }
    }
}

/// Per-invocation defaults, overridable by the agent and by each call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Task wall-clock limit
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Memory limit (e.g., "2g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "2")
    #[serde(default = "default_cpus")]
    pub cpus: String,

    /// Time allowed for create + start of one instance
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,

    /// Extra boot attempts after the first failure
    #[serde(default = "default_boot_retries")]
    pub boot_retries: u32,

    /// Bound on graceful teardown before reclamation is forced
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// How long `invoke` waits on an in-flight build
    #[serde(default = "default_build_wait")]
    pub build_wait_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            memory: default_memory(),
            cpus: default_cpus(),
            boot_timeout_secs: default_boot_timeout(),
            boot_retries: default_boot_retries(),
            grace_period_secs: default_grace_period(),
            build_wait_secs: default_build_wait(),
        }
    }
}

impl LimitsConfig {
    /// Default wall-clock limit
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Limit for one boot attempt
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    /// Time between a stop request and a kill
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// How long `invoke` waits for a build still in flight
    pub fn build_wait(&self) -> Duration {
        Duration::from_secs(self.build_wait_secs)
    }

    /// Memory limit in bytes
    pub fn memory_bytes(&self) -> Result<i64> {
        parse_memory_limit(&self.memory)
    }

    /// CPU limit in nano-CPUs, as Docker expects
    #[allow(clippy::cast_possible_truncation)]
    pub fn nano_cpus(&self) -> i64 {
        let cpus = self.cpus.parse::<f64>().unwrap_or(2.0);
        (cpus * 1_000_000_000.0) as i64
    }
}

/// `[build]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Repository part of every agent image tag
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,

    /// Timeout for one image build
    #[serde(default = "default_build_timeout")]
    pub timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tag_prefix: default_tag_prefix(),
            timeout_secs: default_build_timeout(),
        }
    }
}

/// `[storage]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for agent records, image index and invocation log.
    /// Defaults to the platform data directory.
    #[serde(default)]
    pub state_dir: Option<String>,
}

impl StorageConfig {
    /// Resolve the state directory, expanding `~`
    pub fn resolve(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(PathBuf::from(expand_path(dir)?)),
            None => Ok(dirs::data_dir()
                .context("Could not determine data directory")?
                .join("kratos")),
        }
    }
}

/// Log line format on stderr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// `[logging]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Format of stderr log lines
    #[serde(default)]
    pub format: LogFormat,

    /// Also write daily-rotated log files here
    #[serde(default)]
    pub directory: Option<String>,
}

// Default value functions
fn default_base_image() -> String {
    "kratos-agent-base:latest".to_string()
}

fn default_workdir() -> String {
    "/workdir".to_string()
}

fn default_command() -> Vec<String> {
    vec![
        "/usr/local/bin/uv".to_string(),
        "run".to_string(),
        "python".to_string(),
        "/opt/kratos/run_agent.py".to_string(),
    ]
}

fn default_install_command() -> String {
    "uv add".to_string()
}

fn default_ollama_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_lmstudio_endpoint() -> String {
    "http://localhost:1234".to_string()
}

fn default_size_limit_gb() -> f64 {
    6.0
}

fn default_pull_timeout() -> u64 {
    600
}

fn default_timeout() -> u64 {
    300
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpus() -> String {
    "2".to_string()
}

fn default_boot_timeout() -> u64 {
    30
}

fn default_boot_retries() -> u32 {
    2
}

fn default_grace_period() -> u64 {
    10
}

fn default_build_wait() -> u64 {
    600
}

fn default_tag_prefix() -> String {
    "kratos-agent".to_string()
}

fn default_build_timeout() -> u64 {
    600
}

impl Config {
    /// Load configuration from `kratos.toml` in a directory, using defaults if not found
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        Self::load_file(&config_path)
    }

    /// Load configuration from an explicit file
    pub fn load_file(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.limits.memory_bytes().with_context(|| {
            format!(
                "Invalid [limits] memory '{}' in {}",
                config.limits.memory,
                config_path.display()
            )
        })?;

        Ok(config)
    }
}

/// Expand ~ to home directory
pub fn expand_path(path: &str) -> Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest).display().to_string())
    } else {
        Ok(path.to_string())
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
pub fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.trim().to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}
