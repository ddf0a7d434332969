//! Per-invocation sandbox lifecycle.
//!
//! ```text
//! Creating ──> Running ──> Draining ──> Destroyed
//!    │            │            │
//!    └────────────┴────────────┴──────> Failed
//! ```
//!
//! Every instance is wrapped in a guard the moment its id is chosen.
//! Explicit teardown destroys it within the grace period and falls back
//! to forced reclamation in the background; dropping the guard without
//! teardown (panic, dropped future) takes the forced path directly.
//!
//! Instances are labelled with the engine process that created them, so
//! an orphan sweep only touches instances whose owner is gone.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ExecOutput, InstanceId, InstanceSpec, OutputSink, SandboxError, SandboxProvider,
    MAX_CAPTURE_BYTES,
};
use crate::config::Config;
use crate::error::EngineError;
use crate::image::ImageHandle;
use crate::lock::ProcessOwner;
use crate::meter::ResourceUsage;

const FORCED_ATTEMPTS: u32 = 3;
const FORCED_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Id assigned; the instance is being created and started.
    Creating,
    /// Booted and able to run the task.
    Running,
    /// Task finished or was stopped; teardown in progress.
    Draining,
    /// Torn down after a successful run.
    Destroyed,
    /// Destroyed after a failure.
    Failed,
}

impl SandboxState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SandboxState::{Creating, Destroyed, Draining, Failed, Running};
        matches!(
            (self, next),
            (Creating, Running)
                | (Running, Draining)
                | (Draining, Destroyed)
                | (Creating | Running | Draining, Failed)
        )
    }

    /// Destroyed or failed; nothing more happens to the instance.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }
}

/// How an instance was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reclamation {
    /// Destroyed within the grace period.
    Clean,
    /// Handed to the background kill-and-remove path.
    Forced,
}

/// Limits applied to one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLimits {
    /// Wall-clock limit of the task itself, boot excluded.
    pub timeout: Duration,
    /// Hard memory cap of the instance.
    pub memory_bytes: i64,
}

/// Settings the sandbox manager needs from configuration.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Runner command; the task is appended as its last argument.
    pub command: Vec<String>,
    /// Working directory inside the instance.
    pub workdir: String,
    /// Environment every instance gets, before the per-instance variables.
    pub env: Vec<(String, String)>,
    /// CPU quota in billionths of a CPU.
    pub nano_cpus: i64,
    /// Limit on create plus start of one boot attempt.
    pub boot_timeout: Duration,
    /// Extra boot attempts after the first one fails.
    pub boot_retries: u32,
    /// Time allowed for kill and for destroy before forcing reclamation.
    pub grace_period: Duration,
}

impl LifecycleSettings {
    /// Read the runtime, model and limits sections of `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.runtime.command.clone(),
            workdir: config.runtime.workdir.clone(),
            env: vec![
                (
                    "OLLAMA_HOST".to_string(),
                    container_endpoint(&config.models.ollama_endpoint),
                ),
                (
                    "LMSTUDIO_BASE_URL".to_string(),
                    container_endpoint(&config.models.lmstudio_endpoint),
                ),
            ],
            nano_cpus: config.limits.nano_cpus(),
            boot_timeout: config.limits.boot_timeout(),
            boot_retries: config.limits.boot_retries,
            grace_period: config.limits.grace_period(),
        }
    }
}

/// Model servers on the host are reached through the Docker host gateway.
fn container_endpoint(endpoint: &str) -> String {
    endpoint
        .replace("://localhost", "://host.docker.internal")
        .replace("://127.0.0.1", "://host.docker.internal")
}

/// Result of one `run`, with the usage to be metered.
#[derive(Debug)]
pub struct RunOutcome {
    /// Id of the last instance tried, if any was created.
    pub instance_id: Option<InstanceId>,
    /// The task's result or the reason there is none.
    pub result: Result<Value, EngineError>,
    /// Time and memory consumed, successful or not.
    pub usage: ResourceUsage,
}

type LiveSet = Arc<Mutex<HashMap<InstanceId, i64>>>;

fn lock(live: &LiveSet) -> MutexGuard<'_, HashMap<InstanceId, i64>> {
    live.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Guard owning one instance from id assignment to teardown.
struct Instance {
    id: InstanceId,
    state: SandboxState,
    provider: Arc<dyn SandboxProvider>,
    live: LiveSet,
    released: bool,
}

impl Instance {
    fn register(id: InstanceId, memory_bytes: i64, provider: Arc<dyn SandboxProvider>, live: LiveSet) -> Self {
        lock(&live).insert(id.clone(), memory_bytes);
        Self {
            id,
            state: SandboxState::Creating,
            provider,
            live,
            released: false,
        }
    }

    fn transition(&mut self, next: SandboxState) {
        if self.state.can_transition_to(next) {
            debug!("Instance {}: {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        } else {
            warn!(
                "Instance {}: ignoring invalid transition {:?} -> {:?}",
                self.id, self.state, next
            );
        }
    }

    /// Stop whatever is running, bounded by `grace`.
    async fn kill(&self, grace: Duration) {
        match tokio::time::timeout(grace, self.provider.kill(&self.id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Kill of {} failed: {}", self.id, e),
            Err(_) => debug!("Kill of {} did not return within the grace period", self.id),
        }
    }

    async fn teardown(mut self, grace: Duration, failed: bool) -> Reclamation {
        if self.state == SandboxState::Running {
            self.transition(SandboxState::Draining);
        }

        let mode = match tokio::time::timeout(grace, self.provider.destroy(&self.id)).await {
            Ok(Ok(())) => Reclamation::Clean,
            Ok(Err(e)) => {
                warn!("Destroying {} failed: {}; forcing reclamation", self.id, e);
                spawn_forced_reclaim(Arc::clone(&self.provider), self.id.clone());
                Reclamation::Forced
            }
            Err(_) => {
                warn!(
                    "Instance {} not destroyed within {}s; forcing reclamation",
                    self.id,
                    grace.as_secs()
                );
                spawn_forced_reclaim(Arc::clone(&self.provider), self.id.clone());
                Reclamation::Forced
            }
        };

        self.transition(if failed {
            SandboxState::Failed
        } else {
            SandboxState::Destroyed
        });
        self.release();
        mode
    }

    fn release(&mut self) {
        self.released = true;
        lock(&self.live).remove(&self.id);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            "Instance {} dropped in state {:?} without teardown; forcing reclamation",
            self.id, self.state
        );
        self.state = SandboxState::Failed;
        self.release();
        spawn_forced_reclaim(Arc::clone(&self.provider), self.id.clone());
    }
}

fn spawn_forced_reclaim(provider: Arc<dyn SandboxProvider>, id: InstanceId) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("No runtime to reclaim {}; `kratos prune` will remove it", id);
        return;
    };
    handle.spawn(async move { forced_reclaim(provider.as_ref(), &id).await });
}

async fn forced_reclaim(provider: &dyn SandboxProvider, id: &InstanceId) {
    for attempt in 0..FORCED_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
        }

        if let Ok(Err(e)) = tokio::time::timeout(FORCED_STEP_TIMEOUT, provider.kill(id)).await {
            debug!("Forced kill of {} failed: {}", id, e);
        }

        match tokio::time::timeout(FORCED_STEP_TIMEOUT, provider.destroy(id)).await {
            Ok(Ok(())) => {
                info!("Forced reclamation of {} complete", id);
                return;
            }
            Ok(Err(e)) => warn!("Forced removal of {} failed: {}", id, e),
            Err(_) => warn!("Forced removal of {} timed out", id),
        }
    }
    warn!("Giving up on {}; `kratos prune` will remove it", id);
}

enum BootStep {
    Ready,
    Failed(String),
    Cancelled,
}

enum ExecStep {
    Finished(Result<ExecOutput, SandboxError>),
    TimedOut,
    Cancelled,
}

/// Runs tasks in fresh instances, one instance per call.
pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    settings: LifecycleSettings,
    owner: Arc<ProcessOwner>,
    live: LiveSet,
}

impl SandboxManager {
    /// A manager whose instances belong to a process-private owner.
    pub fn new(provider: Arc<dyn SandboxProvider>, settings: LifecycleSettings) -> Self {
        Self {
            provider,
            settings,
            owner: Arc::new(ProcessOwner::ephemeral()),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Label instances with `owner` and consult it when sweeping orphans.
    #[must_use]
    pub fn with_owner(mut self, owner: Arc<ProcessOwner>) -> Self {
        self.owner = owner;
        self
    }

    /// Settings this manager was created with.
    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Instances created by this manager and not yet reclaimed.
    pub fn live_instances(&self) -> usize {
        lock(&self.live).len()
    }

    /// Memory reserved by live instances, in bytes.
    pub fn reserved_memory(&self) -> i64 {
        lock(&self.live).values().sum()
    }

    /// Create an instance from `image`, run `task` once and tear the
    /// instance down, whatever happens.
    pub async fn run(
        &self,
        agent_name: &str,
        image: &ImageHandle,
        task: &str,
        limits: &ResolvedLimits,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        self.run_streaming(agent_name, image, task, limits, cancel, None)
            .await
    }

    /// [`SandboxManager::run`] that also hands task output to `sink` while
    /// the task runs.
    pub async fn run_streaming(
        &self,
        agent_name: &str,
        image: &ImageHandle,
        task: &str,
        limits: &ResolvedLimits,
        cancel: &CancellationToken,
        sink: Option<&OutputSink>,
    ) -> RunOutcome {
        let started = Instant::now();
        let mut usage = ResourceUsage {
            memory_bytes: limits.memory_bytes,
            ..ResourceUsage::default()
        };
        let mut instance_id = None;

        let boot_started = Instant::now();
        let booted = self
            .boot(agent_name, image, limits, cancel, &mut usage, &mut instance_id)
            .await;
        usage.boot_ms = millis(boot_started.elapsed());

        let result = match booted {
            Ok(instance) => {
                let exec_started = Instant::now();
                let (result, reclamation) =
                    self.execute(instance, task, limits, cancel, sink).await;
                usage.exec_ms = millis(exec_started.elapsed());
                usage.reclamation = Some(reclamation);
                result
            }
            Err(e) => Err(e),
        };

        usage.wall_clock_ms = millis(started.elapsed());
        RunOutcome {
            instance_id,
            result,
            usage,
        }
    }

    async fn boot(
        &self,
        agent_name: &str,
        image: &ImageHandle,
        limits: &ResolvedLimits,
        cancel: &CancellationToken,
        usage: &mut ResourceUsage,
        instance_id: &mut Option<InstanceId>,
    ) -> Result<Instance, EngineError> {
        let attempts = self.settings.boot_retries + 1;
        let grace = self.settings.grace_period;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            usage.boot_attempts = attempt;
            let spec = self.instance_spec(agent_name, image, limits);
            *instance_id = Some(spec.id.clone());

            let mut instance = Instance::register(
                spec.id.clone(),
                spec.memory_bytes,
                Arc::clone(&self.provider),
                Arc::clone(&self.live),
            );
            debug!("Booting {} (attempt {}/{})", spec.id, attempt, attempts);

            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => BootStep::Cancelled,
                booted = tokio::time::timeout(self.settings.boot_timeout, self.create_and_start(&spec)) => {
                    match booted {
                        Ok(Ok(())) => BootStep::Ready,
                        Ok(Err(e)) => BootStep::Failed(e.to_string()),
                        Err(_) => BootStep::Failed(format!(
                            "boot timed out after {} seconds",
                            self.settings.boot_timeout.as_secs()
                        )),
                    }
                }
            };

            match step {
                BootStep::Ready => {
                    instance.transition(SandboxState::Running);
                    return Ok(instance);
                }
                BootStep::Cancelled => {
                    info!("Invocation cancelled while booting {}", spec.id);
                    usage.reclamation = Some(instance.teardown(grace, true).await);
                    return Err(EngineError::Cancelled);
                }
                BootStep::Failed(reason) => {
                    warn!(
                        "Boot attempt {}/{} for {} failed: {}",
                        attempt, attempts, spec.id, reason
                    );
                    usage.reclamation = Some(instance.teardown(grace, true).await);
                    last_error = reason;
                }
            }
        }

        Err(EngineError::boot_failure(attempts, last_error))
    }

    async fn create_and_start(&self, spec: &InstanceSpec) -> Result<(), SandboxError> {
        self.provider.create(spec).await?;
        self.provider.start(&spec.id).await
    }

    async fn execute(
        &self,
        instance: Instance,
        task: &str,
        limits: &ResolvedLimits,
        cancel: &CancellationToken,
        sink: Option<&OutputSink>,
    ) -> (Result<Value, EngineError>, Reclamation) {
        let grace = self.settings.grace_period;
        let mut command = self.settings.command.clone();
        command.push(task.to_string());

        let step = tokio::select! {
            biased;
            () = cancel.cancelled() => ExecStep::Cancelled,
            finished = tokio::time::timeout(limits.timeout, self.provider.exec(&instance.id, &command, sink)) => {
                finished.map_or(ExecStep::TimedOut, ExecStep::Finished)
            }
        };

        let result = match step {
            ExecStep::Finished(Ok(output)) => {
                if output.truncated {
                    warn!(
                        "Output of {} exceeded {} bytes and was truncated",
                        instance.id, MAX_CAPTURE_BYTES
                    );
                }
                capture(output)
            }
            ExecStep::Finished(Err(e)) => {
                warn!("Exec in {} failed: {}", instance.id, e);
                Err(EngineError::sandbox_failure(e.to_string()))
            }
            ExecStep::TimedOut => {
                info!(
                    "Task in {} exceeded {}s; stopping instance",
                    instance.id,
                    limits.timeout.as_secs()
                );
                instance.kill(grace).await;
                Err(EngineError::timeout(limits.timeout))
            }
            ExecStep::Cancelled => {
                info!("Invocation cancelled; stopping instance {}", instance.id);
                instance.kill(grace).await;
                Err(EngineError::Cancelled)
            }
        };

        let reclamation = instance.teardown(grace, result.is_err()).await;
        (result, reclamation)
    }

    fn instance_spec(&self, agent_name: &str, image: &ImageHandle, limits: &ResolvedLimits) -> InstanceSpec {
        let id = InstanceId::generate(agent_name);
        let mut env = self.settings.env.clone();
        env.push(("KRATOS_AGENT_NAME".to_string(), agent_name.to_string()));
        env.push(("KRATOS_INSTANCE_ID".to_string(), id.to_string()));

        InstanceSpec {
            id,
            agent_name: agent_name.to_string(),
            owner: self.owner.id().to_string(),
            image: image.tag.clone(),
            workdir: self.settings.workdir.clone(),
            env,
            memory_bytes: limits.memory_bytes,
            nano_cpus: self.settings.nano_cpus,
        }
    }

    /// Destroy labelled instances nobody is running any more: those of an
    /// engine process that has exited, unlabelled ones, and those of this
    /// process that are no longer live here.
    pub async fn sweep_orphans(&self) -> Result<usize, SandboxError> {
        let listed = self.provider.list().await?;
        let owned: HashSet<InstanceId> = lock(&self.live).keys().cloned().collect();
        let grace = self.settings.grace_period;

        let orphans: Vec<InstanceId> = listed
            .into_iter()
            .filter(|info| !owned.contains(&info.id))
            .filter(|info| match info.owner.as_deref() {
                Some(owner) if owner != self.owner.id() => {
                    let alive = self.owner.is_alive(owner);
                    if alive {
                        debug!("Leaving {} to live engine process {}", info.id, owner);
                    }
                    !alive
                }
                _ => true,
            })
            .map(|info| info.id)
            .collect();

        let mut swept = 0;
        for id in orphans {
            info!("Removing orphaned instance {}", id);
            match tokio::time::timeout(grace, self.provider.destroy(&id)).await {
                Ok(Ok(())) => swept += 1,
                Ok(Err(e)) => warn!("Failed to remove orphan {}: {}", id, e),
                Err(_) => {
                    spawn_forced_reclaim(Arc::clone(&self.provider), id);
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }
}

/// Exit 0: stdout as JSON, or wrapped as `{"output": ...}`.
/// Otherwise: the task failed, with stderr verbatim.
fn capture(output: ExecOutput) -> Result<Value, EngineError> {
    if output.exit_code != 0 {
        let message = if output.stderr.trim().is_empty() {
            output.stdout
        } else {
            output.stderr
        };
        return Err(EngineError::task_failed(output.exit_code, message));
    }

    let stdout = output.stdout.trim();
    Ok(serde_json::from_str(stdout).unwrap_or_else(|_| json!({ "output": stdout })))
}

#[allow(clippy::cast_possible_truncation)]
fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
