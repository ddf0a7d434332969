//! Public entry point: submit, invoke and remove agents.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::store::{normalize_dependencies, validate_name};
use crate::agent::{extract, parse_definition, AgentRecord, AgentStatus, AgentStore, LimitOverrides};
use crate::config::{parse_memory_limit, Config, LimitsConfig};
use crate::error::EngineError;
use crate::image::docker::DockerImageBackend;
use crate::image::{
    BuildRequest, BuilderSettings, HttpModelSource, ImageBackend, ImageBuilder, ImageLease,
    ModelSource,
};
use crate::lock::{ProcessOwner, StateLock};
use crate::meter::{InvocationOutcome, InvocationRecord, ResourceMeter, UsageSummary};
use crate::sandbox::{
    self, DockerSandbox, LifecycleSettings, OutputSink, ResolvedLimits, SandboxManager,
    SandboxProvider,
};

/// How often to look again at a build another process is running.
const PENDING_POLL: Duration = Duration::from_millis(250);

/// Layout of the state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    /// One JSON file per agent record.
    pub agents: PathBuf,
    /// Published images, shared by every process on this directory.
    pub image_index: PathBuf,
    /// Append-only log of invocations.
    pub invocation_log: PathBuf,
}

impl StatePaths {
    /// Paths under `state_dir`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            agents: state_dir.join("agents"),
            image_index: state_dir.join("images.json"),
            invocation_log: state_dir.join("invocations.jsonl"),
        }
    }
}

/// What `prune` cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Sandboxes removed that no running engine process owned.
    pub orphans_removed: usize,
    /// Tags of the images evicted.
    pub images_removed: Vec<String>,
}

/// Coordinates the store, the image builder, the sandbox manager and the
/// meter. Cheap to share behind an `Arc`; every operation takes `&self`.
///
/// Several dispatchers, in one process or many, may share a state
/// directory.
pub struct Dispatcher {
    store: AgentStore,
    builder: ImageBuilder,
    sandbox: SandboxManager,
    meter: ResourceMeter,
    owner: Arc<ProcessOwner>,
    limits: LimitsConfig,
    default_memory: i64,
}

impl Dispatcher {
    /// Open the engine against the local Docker daemon and model servers,
    /// with state under the configured state directory.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let state_dir = config.storage.resolve()?;
        let docker = sandbox::connect().await?;
        let models = HttpModelSource::new(config.models.clone())?;

        Self::with_components(
            config,
            Some(&state_dir),
            Arc::new(DockerImageBackend::new(docker.clone())),
            Arc::new(models),
            Arc::new(DockerSandbox::new(docker)),
        )
        .await
    }

    /// Assemble the engine from explicit collaborators. Without a
    /// `state_dir` nothing is persisted.
    pub async fn with_components(
        config: &Config,
        state_dir: Option<&Path>,
        backend: Arc<dyn ImageBackend>,
        models: Arc<dyn ModelSource>,
        provider: Arc<dyn SandboxProvider>,
    ) -> anyhow::Result<Self> {
        let default_memory = config
            .limits
            .memory_bytes()
            .with_context(|| format!("Invalid [limits] memory '{}'", config.limits.memory))?;

        let (store, index_path, meter, state_lock, owner) = match state_dir {
            Some(dir) => {
                let paths = StatePaths::new(dir);
                let state_lock = StateLock::new(dir);
                (
                    AgentStore::open(&paths.agents, state_lock.clone())?,
                    Some(paths.image_index),
                    ResourceMeter::open(&paths.invocation_log)?,
                    state_lock,
                    ProcessOwner::register(dir)?,
                )
            }
            None => (
                AgentStore::in_memory(),
                None,
                ResourceMeter::in_memory(),
                StateLock::disabled(),
                ProcessOwner::ephemeral(),
            ),
        };
        let owner = Arc::new(owner);

        let repaired = store.repair_interrupted(|id| owner.is_alive(id))?;
        if !repaired.is_empty() {
            info!("Marked {} interrupted build(s) as failed", repaired.len());
        }

        let builder = ImageBuilder::new(
            backend,
            models,
            BuilderSettings::from_config(config),
            index_path,
            state_lock,
        )?;
        let sandbox = SandboxManager::new(provider, LifecycleSettings::from_config(config))
            .with_owner(Arc::clone(&owner));

        let dispatcher = Self {
            store,
            builder,
            sandbox,
            meter,
            owner,
            limits: config.limits.clone(),
            default_memory,
        };
        dispatcher.check_images().await?;
        Ok(dispatcher)
    }

    /// Fail built records whose image has disappeared.
    async fn check_images(&self) -> Result<(), EngineError> {
        for record in self.store.records() {
            let Some(image) = &record.image else {
                continue;
            };
            if !self.builder.contains(&image.fingerprint) {
                warn!(
                    "Image {} of agent '{}' is no longer cached; marking it failed",
                    image.tag, record.name
                );
                self.store
                    .fail(&record.name, record.revision, "image missing; resubmit the agent")
                    .await?;
            }
        }
        Ok(())
    }

    /// Register (or replace) an agent and build its environment.
    ///
    /// Returns once the build has finished. On failure the record is kept
    /// as `Failed` so `invoke` reports why.
    pub async fn submit(
        &self,
        definition: Vec<u8>,
        name: &str,
        dependencies: Vec<String>,
    ) -> Result<String, EngineError> {
        validate_name(name)?;
        let parsed = parse_definition(&definition)?;
        let model_refs = extract(&definition)?;
        let dependencies = normalize_dependencies(dependencies);
        for dep in &dependencies {
            crate::image::validate_dependency(dep)
                .map_err(|e| EngineError::definition_invalid(e.to_string()))?;
        }

        let request = BuildRequest {
            agent_name: name.to_string(),
            definition: definition.clone(),
            dependencies: dependencies.clone(),
            model_refs: model_refs.clone(),
        };
        let fingerprint = self.builder.fingerprint(&request);
        let mut record = AgentRecord::pending(
            name,
            definition,
            dependencies,
            model_refs,
            fingerprint,
            parsed.limits,
        );
        record.builder = Some(self.owner.id().to_string());
        let revision = record.revision;

        info!(
            "Submitting agent '{}' (image {})",
            name,
            record.fingerprint.short()
        );
        self.store.put(record).await?;

        let result = match self.builder.build(request).await {
            Ok(lease) => self.publish(name, revision, lease).await,
            Err(e) => {
                if let Err(store_err) = self.store.fail(name, revision, e.to_string()).await {
                    warn!("Failed to record build failure of '{}': {}", name, store_err);
                }
                Err(e)
            }
        };

        // The replaced revision's image, if unshared, goes now.
        self.collect_garbage().await;

        result.map(|()| name.to_string())
    }

    async fn publish(&self, name: &str, revision: Uuid, lease: ImageLease) -> Result<(), EngineError> {
        if self
            .store
            .complete(name, revision, lease.handle().clone())
            .await?
        {
            info!("Agent '{}' is ready ({})", name, lease.handle().tag);
        } else {
            debug!(
                "Agent '{}' was replaced or removed while building; leaving the image to eviction",
                name
            );
        }
        Ok(())
    }

    /// Run `task` once in a fresh sandbox of agent `name`.
    pub async fn invoke(
        &self,
        name: &str,
        task: &str,
        limits: Option<&LimitOverrides>,
    ) -> Result<Value, EngineError> {
        self.invoke_with_cancel(name, task, limits, &CancellationToken::new())
            .await
    }

    /// [`Dispatcher::invoke`] that stops, and reclaims the sandbox, when
    /// `cancel` fires.
    pub async fn invoke_with_cancel(
        &self,
        name: &str,
        task: &str,
        limits: Option<&LimitOverrides>,
        cancel: &CancellationToken,
    ) -> Result<Value, EngineError> {
        self.run_invocation(name, task, limits, cancel, None).await
    }

    /// [`Dispatcher::invoke_with_cancel`] that also hands every chunk of
    /// agent output to `sink` as it is produced.
    pub async fn invoke_streaming(
        &self,
        name: &str,
        task: &str,
        limits: Option<&LimitOverrides>,
        cancel: &CancellationToken,
        sink: &OutputSink,
    ) -> Result<Value, EngineError> {
        self.run_invocation(name, task, limits, cancel, Some(sink))
            .await
    }

    async fn run_invocation(
        &self,
        name: &str,
        task: &str,
        limits: Option<&LimitOverrides>,
        cancel: &CancellationToken,
        sink: Option<&OutputSink>,
    ) -> Result<Value, EngineError> {
        let started_at = Utc::now();
        let (record, lease) = self.acquire(name, cancel).await?;
        let limits = self.resolve_limits(&record.limits, limits)?;

        info!("Invoking agent '{}'", name);
        let outcome = self
            .sandbox
            .run_streaming(name, lease.handle(), task, &limits, cancel, sink)
            .await;
        drop(lease);

        match &outcome.result {
            Ok(_) => info!("Agent '{}' finished in {}ms", name, outcome.usage.wall_clock_ms),
            Err(e) => info!("Agent '{}' failed: {}", name, e),
        }

        let invocation = InvocationRecord {
            id: Uuid::new_v4(),
            agent_name: name.to_string(),
            task: task.to_string(),
            instance_id: outcome.instance_id,
            started_at,
            finished_at: Utc::now(),
            usage: outcome.usage,
            outcome: InvocationOutcome::from_result(&outcome.result),
        };
        if let Err(e) = self.meter.record(invocation) {
            warn!("Failed to record usage for '{}': {}", name, e);
        }

        outcome.result
    }

    /// Find the agent and take a lease on its image, waiting for a build
    /// in flight here or in another process.
    ///
    /// The record is read again whenever the lease cannot be taken, so an
    /// agent removed or replaced in between reports what it is now.
    async fn acquire(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(AgentRecord, ImageLease), EngineError> {
        let wait = self.limits.build_wait();
        let deadline = Instant::now() + wait;
        let mut retried = false;

        loop {
            let record = self
                .store
                .get(name)
                .ok_or_else(|| EngineError::agent_not_found(name))?;

            match record.status {
                AgentStatus::Built => {}
                AgentStatus::Failed => {
                    let reason = record.failure.as_deref().unwrap_or("build failed");
                    return Err(EngineError::agent_not_ready(name, reason));
                }
                AgentStatus::Pending => {
                    if let Some(builder) = &record.builder {
                        if !self.owner.is_alive(builder) {
                            return Err(EngineError::agent_not_ready(
                                name,
                                "build was interrupted; resubmit the agent",
                            ));
                        }
                    }
                    debug!("Agent '{}' is still building; waiting", name);
                    self.await_build(&record, deadline, wait, cancel).await?;
                    continue;
                }
            }

            if let Some(lease) = record.image.as_ref().and_then(|image| self.builder.lease(image)) {
                return Ok((record, lease));
            }
            if retried {
                return Err(EngineError::agent_not_ready(name, "image is not available"));
            }
            debug!("Image of agent '{}' changed while leasing; reading it again", name);
            retried = true;
        }
    }

    /// Wait until the build of `record` may have finished: the in-flight
    /// build of this process, or one poll interval for another process's.
    async fn await_build(
        &self,
        record: &AgentRecord,
        deadline: Instant,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let progress = async {
            if self.builder.wait_for(&record.fingerprint).await.is_none() {
                tokio::time::sleep(PENDING_POLL).await;
            }
        };

        tokio::select! {
            () = cancel.cancelled() => Err(EngineError::Cancelled),
            waited = tokio::time::timeout_at(deadline, progress) => waited.map_err(|_| {
                EngineError::agent_not_ready(
                    &record.name,
                    format!("build still running after {}s", wait.as_secs()),
                )
            }),
        }
    }

    /// Per-call override, then agent default, then configuration.
    fn resolve_limits(
        &self,
        agent: &LimitOverrides,
        call: Option<&LimitOverrides>,
    ) -> Result<ResolvedLimits, EngineError> {
        let merged = call.map_or_else(|| agent.clone(), |call| call.or(agent));

        let timeout = merged
            .timeout_seconds
            .map_or_else(|| self.limits.timeout(), Duration::from_secs);
        if timeout.is_zero() {
            return Err(EngineError::definition_invalid("timeout must be at least 1 second"));
        }

        let memory_bytes = match &merged.max_memory {
            Some(limit) => parse_memory_limit(limit).map_err(|e| {
                EngineError::definition_invalid(format!("invalid memory limit '{limit}': {e}"))
            })?,
            None => self.default_memory,
        };
        if memory_bytes <= 0 {
            return Err(EngineError::definition_invalid("memory limit must be positive"));
        }

        Ok(ResolvedLimits {
            timeout,
            memory_bytes,
        })
    }

    /// Delete an agent. Returns whether it existed. Invocations already
    /// running keep their image until they finish.
    pub async fn remove(&self, name: &str) -> bool {
        match self.store.remove(name).await {
            Ok(Some(_)) => {
                info!("Removed agent '{}'", name);
                self.collect_garbage().await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to remove agent '{}': {}", name, e);
                false
            }
        }
    }

    /// Names of all registered agents.
    pub fn list(&self) -> Vec<String> {
        self.store.list()
    }

    /// All agent records, sorted by name.
    pub fn records(&self) -> Vec<AgentRecord> {
        self.store.records()
    }

    /// The record of agent `name`.
    pub fn get(&self, name: &str) -> Option<AgentRecord> {
        self.store.get(name)
    }

    /// Usage of agent `name` since `since`, as far as this process has seen.
    pub fn usage_since(&self, name: &str, since: DateTime<Utc>) -> UsageSummary {
        self.meter.usage_since(name, since)
    }

    /// The latest `limit` invocations of agent `name`, newest first.
    pub fn history(&self, name: &str, limit: usize) -> Vec<InvocationRecord> {
        self.meter.history(name, limit)
    }

    /// Sandboxes currently owned by this engine.
    pub fn live_instances(&self) -> usize {
        self.sandbox.live_instances()
    }

    /// Remove orphaned sandboxes and unreferenced images. Sandboxes of
    /// other running engine processes are left alone.
    pub async fn prune(&self) -> Result<PruneReport, EngineError> {
        let orphans_removed = match self.sandbox.sweep_orphans().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Orphan sweep failed: {}", e);
                0
            }
        };
        let images_removed = self
            .builder
            .collect_garbage(|| self.store.pinned_fingerprints())
            .await?;
        Ok(PruneReport {
            orphans_removed,
            images_removed,
        })
    }

    async fn collect_garbage(&self) {
        match self
            .builder
            .collect_garbage(|| self.store.pinned_fingerprints())
            .await
        {
            Ok(evicted) if !evicted.is_empty() => debug!("Evicted {} image(s)", evicted.len()),
            Ok(_) => {}
            Err(e) => warn!("Image garbage collection failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Fingerprint, ImageHandle};
    use crate::sandbox::{InstanceId, OutputStream};
    use crate::testing::{FakeImageBackend, FakeModelSource, FakeSandbox};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const FINANCE: &str = r#"{
        "schema_version": 1,
        "name": "KratosFinance",
        "model": { "provider": "ollama", "id": "qwen3:4b" },
        "tools": [{ "name": "yfinance" }],
        "instructions": "You are a finance agent. Answer with current prices."
    }"#;

    struct Harness {
        backend: Arc<FakeImageBackend>,
        models: Arc<FakeModelSource>,
        sandbox: Arc<FakeSandbox>,
        dispatcher: Arc<Dispatcher>,
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.limits.boot_timeout_secs = 2;
        config.limits.grace_period_secs = 1;
        config.limits.build_wait_secs = 5;
        config
    }

    async fn harness_with(backend: FakeImageBackend, state_dir: Option<&Path>) -> Harness {
        let backend = Arc::new(backend);
        let models = Arc::new(FakeModelSource::new());
        let sandbox = Arc::new(FakeSandbox::new());
        let dispatcher = Dispatcher::with_components(
            &config(),
            state_dir,
            backend.clone(),
            models.clone(),
            sandbox.clone(),
        )
        .await
        .unwrap();
        Harness {
            backend,
            models,
            sandbox,
            dispatcher: Arc::new(dispatcher),
        }
    }

    async fn harness() -> Harness {
        harness_with(FakeImageBackend::new(), None).await
    }

    /// A second engine process on the same state directory and daemon.
    async fn peer(h: &Harness, state_dir: &Path) -> Arc<Dispatcher> {
        let dispatcher = Dispatcher::with_components(
            &config(),
            Some(state_dir),
            h.backend.clone(),
            h.models.clone(),
            h.sandbox.clone(),
        )
        .await
        .unwrap();
        Arc::new(dispatcher)
    }

    fn definition(instructions: &str) -> Vec<u8> {
        json!({
            "schema_version": 1,
            "model": { "provider": "ollama", "id": "qwen3:4b" },
            "instructions": instructions,
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_submit_and_invoke_finance_agent() {
        let h = harness().await;

        let name = h
            .dispatcher
            .submit(FINANCE.as_bytes().to_vec(), "agent-finance", vec!["yfinance".to_string()])
            .await
            .unwrap();
        assert_eq!(name, "agent-finance");

        let record = h.dispatcher.get("agent-finance").unwrap();
        assert_eq!(record.status, AgentStatus::Built);
        assert_eq!(record.dependencies, vec!["yfinance".to_string()]);
        assert!(h.backend.dockerfiles()[0].contains("RUN uv add yfinance"));
        assert_eq!(h.models.pulls().len(), 1);

        let result = h
            .dispatcher
            .invoke("agent-finance", "price:AAPL", None)
            .await
            .unwrap();
        assert_eq!(result, json!({"ticker": "AAPL", "price": 187.23}));

        assert_eq!(h.sandbox.live(), 0);
        assert_eq!(h.dispatcher.live_instances(), 0);
        let usage = h
            .dispatcher
            .usage_since("agent-finance", Utc::now() - ChronoDuration::hours(1));
        assert_eq!(usage.invocations, 1);
        assert_eq!(usage.failures, 0);
    }

    #[tokio::test]
    async fn test_resubmit_replaces_definition() {
        let h = harness().await;

        h.dispatcher.submit(definition("v1"), "agent", vec![]).await.unwrap();
        let first = h.dispatcher.invoke("agent", "image", None).await.unwrap();

        h.dispatcher.submit(definition("v2"), "agent", vec![]).await.unwrap();
        let second = h.dispatcher.invoke("agent", "image", None).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(h.backend.build_count(), 2);
        assert_eq!(h.dispatcher.list(), vec!["agent".to_string()]);

        // The old image lost its last reference and was reclaimed.
        let old_tag = first["image"].as_str().unwrap().to_string();
        assert!(h.backend.removed().contains(&old_tag));
    }

    #[tokio::test]
    async fn test_identical_resubmit_reuses_image() {
        let h = harness().await;

        h.dispatcher.submit(definition("same"), "agent", vec![]).await.unwrap();
        h.dispatcher.submit(definition("same"), "agent", vec![]).await.unwrap();

        assert_eq!(h.backend.build_count(), 1);
        assert!(h.backend.removed().is_empty());
        assert!(h.dispatcher.invoke("agent", "echo:ok", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_then_invoke_is_not_found() {
        let h = harness().await;
        h.dispatcher.submit(definition("x"), "agent", vec![]).await.unwrap();

        assert!(h.dispatcher.remove("agent").await);
        let err = h.dispatcher.invoke("agent", "echo:hi", None).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.backend.removed().len(), 1);

        assert!(!h.dispatcher.remove("agent").await);
        assert!(!h.dispatcher.remove("never-existed").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_submits_build_once() {
        let h = harness_with(FakeImageBackend::with_delay(Duration::from_millis(200)), None).await;

        let mut tasks = Vec::new();
        for i in 0..5 {
            let dispatcher = Arc::clone(&h.dispatcher);
            tasks.push(tokio::spawn(async move {
                dispatcher
                    .submit(definition("shared"), &format!("agent-{i}"), vec!["ddgs".to_string()])
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(h.backend.build_count(), 1);
        let tags: Vec<String> = h
            .dispatcher
            .records()
            .into_iter()
            .map(|r| r.image.unwrap().tag)
            .collect();
        assert_eq!(tags.len(), 5);
        assert!(tags.iter().all(|t| t == &tags[0]));
    }

    #[tokio::test]
    async fn test_invalid_definition_registers_nothing() {
        let h = harness().await;

        let err = h
            .dispatcher
            .submit(b"not json".to_vec(), "agent", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DefinitionInvalid { .. }));

        let err = h
            .dispatcher
            .submit(definition("x"), "agent", vec!["--index-url=http://evil".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DefinitionInvalid { .. }));

        let err = h
            .dispatcher
            .submit(definition("x"), "Bad Name", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidName { .. }));

        assert!(h.dispatcher.list().is_empty());
        assert_eq!(h.backend.build_count(), 0);
    }

    #[tokio::test]
    async fn test_build_failure_marks_agent_not_ready() {
        let h = harness_with(FakeImageBackend::failing("package 'nope' not found"), None).await;

        let err = h
            .dispatcher
            .submit(definition("x"), "agent", vec!["nope".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BuildFailed { .. }));
        assert!(err.is_infrastructure());

        let record = h.dispatcher.get("agent").unwrap();
        assert_eq!(record.status, AgentStatus::Failed);

        match h.dispatcher.invoke("agent", "echo:hi", None).await.unwrap_err() {
            EngineError::AgentNotReady { reason, .. } => assert!(reason.contains("not found")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.sandbox.created(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_reported_and_metered() {
        let h = harness().await;
        h.dispatcher.submit(definition("slow"), "agent", vec![]).await.unwrap();

        let limits = LimitOverrides {
            timeout_seconds: Some(1),
            max_memory: None,
        };
        let err = h
            .dispatcher
            .invoke("agent", "sleep:10000", Some(&limits))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(h.sandbox.live(), 0);

        let usage = h
            .dispatcher
            .usage_since("agent", Utc::now() - ChronoDuration::hours(1));
        assert_eq!(usage.timeouts, 1);
        assert_eq!(usage.failures, 1);
        assert!(usage.billed_seconds >= 1);
    }

    #[tokio::test]
    async fn test_cancellation_reclaims_sandbox() {
        let h = harness().await;
        h.dispatcher.submit(definition("x"), "agent", vec![]).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = h
            .dispatcher
            .invoke_with_cancel("agent", "sleep:10000", None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
        assert_eq!(h.sandbox.live(), 0);
        assert_eq!(h.dispatcher.live_instances(), 0);
    }

    #[tokio::test]
    async fn test_limits_resolution_order() {
        let h = harness().await;
        let def = json!({
            "schema_version": 1,
            "model": { "provider": "ollama", "id": "qwen3:4b" },
            "limits": { "max_memory": "1g", "timeout_seconds": 60 }
        });
        h.dispatcher
            .submit(def.to_string().into_bytes(), "agent", vec![])
            .await
            .unwrap();

        // Agent default.
        h.dispatcher.invoke("agent", "echo:a", None).await.unwrap();
        // Per-call override wins.
        let call = LimitOverrides {
            timeout_seconds: None,
            max_memory: Some("512m".to_string()),
        };
        h.dispatcher.invoke("agent", "echo:b", Some(&call)).await.unwrap();

        let history = h.dispatcher.history("agent", 10);
        assert_eq!(history[0].usage.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(history[1].usage.memory_bytes, 1024 * 1024 * 1024);

        // Config default when neither is set.
        h.dispatcher.submit(definition("plain"), "plain", vec![]).await.unwrap();
        h.dispatcher.invoke("plain", "echo:c", None).await.unwrap();
        assert_eq!(
            h.dispatcher.history("plain", 1)[0].usage.memory_bytes,
            2 * 1024 * 1024 * 1024
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_invocations_are_isolated() {
        let h = harness().await;
        h.dispatcher.submit(definition("x"), "agent", vec![]).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..6 {
            let dispatcher = Arc::clone(&h.dispatcher);
            tasks.push(tokio::spawn(async move {
                dispatcher
                    .invoke("agent", &format!("set:TOKEN={i}"), None)
                    .await
                    .unwrap();
                dispatcher.invoke("agent", "get:TOKEN", None).await.unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), json!({"TOKEN": null}));
        }
        assert_eq!(h.sandbox.created(), 12);
        assert_eq!(h.sandbox.live(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_invoke_waits_for_pending_build() {
        let h = harness_with(FakeImageBackend::with_delay(Duration::from_millis(300)), None).await;

        let submitter = {
            let dispatcher = Arc::clone(&h.dispatcher);
            tokio::spawn(async move { dispatcher.submit(definition("x"), "agent", vec![]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.dispatcher.get("agent").unwrap().status, AgentStatus::Pending);

        let result = h.dispatcher.invoke("agent", "echo:ready", None).await.unwrap();
        assert_eq!(result, json!({"echo": "ready"}));
        submitter.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remove_during_invocation_completes() {
        let h = harness().await;
        h.dispatcher.submit(definition("x"), "agent", vec![]).await.unwrap();

        let running = {
            let dispatcher = Arc::clone(&h.dispatcher);
            tokio::spawn(async move { dispatcher.invoke("agent", "sleep:300", None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.dispatcher.remove("agent").await);
        // Still leased by the running invocation.
        assert!(h.backend.removed().is_empty());

        assert_eq!(running.await.unwrap().unwrap(), json!({"slept_ms": 300}));
        let report = h.dispatcher.prune().await.unwrap();
        assert_eq!(report.images_removed.len(), 1);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempdir().unwrap();

        {
            let h = harness_with(FakeImageBackend::new(), Some(dir.path())).await;
            h.dispatcher
                .submit(FINANCE.as_bytes().to_vec(), "agent-finance", vec![])
                .await
                .unwrap();
            h.dispatcher.invoke("agent-finance", "price:MSFT", None).await.unwrap();
        }

        let h = harness_with(FakeImageBackend::new(), Some(dir.path())).await;
        assert_eq!(h.dispatcher.list(), vec!["agent-finance".to_string()]);
        let result = h
            .dispatcher
            .invoke("agent-finance", "price:MSFT", None)
            .await
            .unwrap();
        assert_eq!(result["ticker"], "MSFT");
        assert_eq!(h.backend.build_count(), 0);

        let usage = h
            .dispatcher
            .usage_since("agent-finance", Utc::now() - ChronoDuration::hours(1));
        assert_eq!(usage.invocations, 2);

        // Still referenced by the record, so nothing to collect.
        assert!(h.dispatcher.prune().await.unwrap().images_removed.is_empty());
    }

    #[tokio::test]
    async fn test_prune_removes_orphans() {
        let h = harness().await;
        h.sandbox
            .insert_orphan(InstanceId::new("kratos-invoke-agent-0badf00d"));

        let report = h.dispatcher.prune().await.unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(h.sandbox.live(), 0);
    }

    #[tokio::test]
    async fn test_processes_sharing_state_keep_each_others_agents() {
        let dir = tempdir().unwrap();
        let h = harness_with(FakeImageBackend::new(), Some(dir.path())).await;
        let other = peer(&h, dir.path()).await;

        h.dispatcher.submit(definition("alpha"), "alpha", vec![]).await.unwrap();
        other.submit(definition("beta"), "beta", vec![]).await.unwrap();

        let index: Value =
            serde_json::from_slice(&fs::read(dir.path().join("images.json")).unwrap()).unwrap();
        assert_eq!(index.as_object().unwrap().len(), 2);

        // A process started afterwards runs both without building.
        let third = peer(&h, dir.path()).await;
        assert_eq!(third.list(), vec!["alpha".to_string(), "beta".to_string()]);
        assert!(third.invoke("alpha", "echo:a", None).await.is_ok());
        assert!(third.invoke("beta", "echo:b", None).await.is_ok());
        assert_eq!(h.backend.build_count(), 2);
        assert!(h.backend.removed().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_build_in_another_process_stays_pending_and_is_awaited() {
        let dir = tempdir().unwrap();
        let h = harness_with(
            FakeImageBackend::with_delay(Duration::from_millis(300)),
            Some(dir.path()),
        )
        .await;

        let submitter = {
            let dispatcher = Arc::clone(&h.dispatcher);
            tokio::spawn(async move { dispatcher.submit(definition("x"), "agent", vec![]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let other = peer(&h, dir.path()).await;
        assert_eq!(other.get("agent").unwrap().status, AgentStatus::Pending);

        let result = other.invoke("agent", "echo:ready", None).await.unwrap();
        assert_eq!(result, json!({"echo": "ready"}));
        submitter.await.unwrap().unwrap();
        assert_eq!(h.backend.build_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_removal_by_another_process_during_build_sticks() {
        let dir = tempdir().unwrap();
        let h = harness_with(
            FakeImageBackend::with_delay(Duration::from_millis(300)),
            Some(dir.path()),
        )
        .await;

        let submitter = {
            let dispatcher = Arc::clone(&h.dispatcher);
            tokio::spawn(async move { dispatcher.submit(definition("x"), "agent", vec![]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let other = peer(&h, dir.path()).await;
        assert!(other.remove("agent").await);
        submitter.await.unwrap().unwrap();

        assert!(h.dispatcher.get("agent").is_none());
        assert!(other.list().is_empty());
        // The finished build had nothing pointing at it.
        assert_eq!(h.backend.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_build_of_stopped_process_is_failed_on_open() {
        let dir = tempdir().unwrap();
        {
            let paths = StatePaths::new(dir.path());
            let store = AgentStore::open(&paths.agents, StateLock::new(dir.path())).unwrap();
            let mut record = AgentRecord::pending(
                "agent",
                definition("x"),
                vec![],
                BTreeSet::new(),
                Fingerprint::compute("kratos-agent-base:test", &[], b"x"),
                LimitOverrides::default(),
            );
            record.builder = Some("deadbeef".to_string());
            store.put(record).await.unwrap();
        }

        let h = harness_with(FakeImageBackend::new(), Some(dir.path())).await;
        assert_eq!(h.dispatcher.get("agent").unwrap().status, AgentStatus::Failed);
        match h.dispatcher.invoke("agent", "echo:hi", None).await.unwrap_err() {
            EngineError::AgentNotReady { reason, .. } => assert!(reason.contains("interrupted")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_prune_spares_sandboxes_of_other_processes() {
        let dir = tempdir().unwrap();
        let h = harness_with(FakeImageBackend::new(), Some(dir.path())).await;
        h.dispatcher.submit(definition("x"), "agent", vec![]).await.unwrap();
        let other = peer(&h, dir.path()).await;

        let running = {
            let dispatcher = Arc::clone(&h.dispatcher);
            tokio::spawn(async move { dispatcher.invoke("agent", "sleep:400", None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = other.prune().await.unwrap();
        assert_eq!(report.orphans_removed, 0);
        assert!(report.images_removed.is_empty());
        assert_eq!(running.await.unwrap().unwrap(), json!({"slept_ms": 400}));
    }

    #[tokio::test]
    async fn test_invoke_after_removal_elsewhere_is_not_found() {
        let dir = tempdir().unwrap();
        let h = harness_with(FakeImageBackend::new(), Some(dir.path())).await;
        h.dispatcher.submit(definition("x"), "agent", vec![]).await.unwrap();
        let other = peer(&h, dir.path()).await;

        assert!(other.remove("agent").await);
        let err = h.dispatcher.invoke("agent", "echo:hi", None).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.sandbox.created(), 0);
    }

    #[tokio::test]
    async fn test_invoke_of_unpublished_image_is_not_ready() {
        let h = harness().await;
        let fingerprint = Fingerprint::compute("kratos-agent-base:test", &[], b"ghost");
        let record = AgentRecord::pending(
            "agent",
            definition("ghost"),
            vec![],
            BTreeSet::new(),
            fingerprint.clone(),
            LimitOverrides::default(),
        );
        let revision = record.revision;
        h.dispatcher.store.put(record).await.unwrap();
        let image = ImageHandle::new(fingerprint, "kratos-agent", vec![]);
        assert!(h.dispatcher.store.complete("agent", revision, image).await.unwrap());

        match h.dispatcher.invoke("agent", "echo:hi", None).await.unwrap_err() {
            EngineError::AgentNotReady { reason, .. } => assert!(reason.contains("not available")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.sandbox.created(), 0);
    }

    #[tokio::test]
    async fn test_invoke_streaming_forwards_output() {
        let h = harness().await;
        h.dispatcher.submit(definition("x"), "agent", vec![]).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: OutputSink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |stream: OutputStream, text: &str| {
                seen.lock().unwrap().push((stream, text.to_string()));
            })
        };

        let result = h
            .dispatcher
            .invoke_streaming("agent", "stream:a,b,c", None, &CancellationToken::new(), &sink)
            .await
            .unwrap();
        assert_eq!(result, json!({"lines": 3}));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], (OutputStream::Stderr, "a\n".to_string()));
        assert_eq!(seen[3].0, OutputStream::Stdout);
        assert_eq!(h.dispatcher.history("agent", 1).len(), 1);
    }
}
