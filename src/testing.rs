//! In-process fakes of the external collaborators, for tests.
//!
//! [`FakeSandbox`] interprets the task argument as a tiny command
//! language so tests can script agent behavior:
//!
//! | task            | behavior                                        |
//! |-----------------|-------------------------------------------------|
//! | `echo:<s>`      | `{"echo": s}`                                   |
//! | `text:<s>`      | plain, non-JSON stdout                          |
//! | `sleep:<ms>`    | sleeps, then `{"slept_ms": ms}`                 |
//! | `fail:<msg>`    | exit 1 with `msg` on stderr                     |
//! | `set:<K>=<V>`   | writes instance-local state                     |
//! | `get:<K>`       | `{K: value-or-null}` from instance-local state  |
//! | `image`         | `{"image": tag}` of the instance's image        |
//! | `price:<T>`     | `{"ticker": T, "price": ...}`                   |
//! | `stream:<a,b>`  | each item on stderr, then `{"lines": n}`        |
//! | `crash`         | the exec itself fails                           |

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::agent::ModelRef;
use crate::image::{BuildContext, ImageBackend, MaterializedModel, ModelSource};
use crate::sandbox::{
    ExecOutput, InstanceId, InstanceInfo, InstanceSpec, OutputSink, OutputStream, SandboxError,
    SandboxProvider,
};

/// Image backend that records builds instead of running them.
#[derive(Debug, Default)]
pub(crate) struct FakeImageBackend {
    delay: Duration,
    failure: Option<String>,
    builds: Mutex<Vec<(String, BuildContext)>>,
    removed: Mutex<Vec<String>>,
    refuse_removal: AtomicBool,
}

impl FakeImageBackend {
    /// Backend whose builds succeed at once.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every build takes `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Every build fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Builds run so far.
    pub fn build_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }

    /// Dockerfiles of every build, in order.
    pub fn dockerfiles(&self) -> Vec<String> {
        self.builds
            .lock()
            .unwrap()
            .iter()
            .map(|(_, ctx)| ctx.dockerfile.clone())
            .collect()
    }

    /// Tags removed so far.
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    /// While set, `remove` fails as if the image were still in use.
    pub fn refuse_removal(&self, refuse: bool) {
        self.refuse_removal.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageBackend for FakeImageBackend {
    async fn build(&self, tag: &str, context: BuildContext) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.failure {
            bail!("{message}");
        }
        self.builds.lock().unwrap().push((tag.to_string(), context));
        Ok(())
    }

    async fn remove(&self, tag: &str) -> Result<()> {
        if self.refuse_removal.load(Ordering::SeqCst) {
            bail!("image {tag} is being used by a running container");
        }
        self.removed.lock().unwrap().push(tag.to_string());
        Ok(())
    }
}

/// Model source that records what it was asked to pull.
#[derive(Debug, Default)]
pub(crate) struct FakeModelSource {
    failure: Option<String>,
    pulls: Mutex<Vec<ModelRef>>,
}

impl FakeModelSource {
    /// Source that materializes every model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Source whose pulls fail with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Models materialized so far.
    pub fn pulls(&self) -> Vec<ModelRef> {
        self.pulls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelSource for FakeModelSource {
    async fn materialize(&self, model: &ModelRef) -> Result<MaterializedModel> {
        self.pulls.lock().unwrap().push(model.clone());
        if let Some(message) = &self.failure {
            bail!("{message}");
        }
        Ok(MaterializedModel {
            reference: model.clone(),
            size_bytes: Some(2_500_000_000),
        })
    }
}

#[derive(Debug)]
struct FakeInstance {
    image: String,
    owner: Option<String>,
    env: HashMap<String, String>,
    killed: bool,
}

/// Sandbox provider that keeps instances in memory.
#[derive(Debug, Default)]
pub(crate) struct FakeSandbox {
    instances: Mutex<HashMap<InstanceId, FakeInstance>>,
    commands: Mutex<Vec<Vec<String>>>,
    owners: Mutex<Vec<String>>,
    created: AtomicUsize,
    started: AtomicUsize,
    kills: AtomicUsize,
    boot_failures: usize,
    hanging_boots: usize,
    unresponsive: bool,
}

impl FakeSandbox {
    /// Sandbox whose instances boot at once.
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` creates fail.
    pub fn with_boot_failures(mut self, n: usize) -> Self {
        self.boot_failures = n;
        self
    }

    /// The first `n` starts never return.
    pub fn with_hanging_boots(mut self, n: usize) -> Self {
        self.hanging_boots = n;
        self
    }

    /// Instances ignore `destroy` until they have been killed.
    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    /// Instances not yet destroyed.
    pub fn live(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Instances created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Instances killed after ignoring a stop.
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Commands run so far, in order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    /// Simulate an unlabelled instance left behind by an older engine.
    pub fn insert_orphan(&self, id: InstanceId) {
        self.insert(id, None);
    }

    /// Simulate an instance created by the engine process `owner`.
    pub fn insert_owned(&self, id: InstanceId, owner: &str) {
        self.insert(id, Some(owner.to_string()));
    }

    fn insert(&self, id: InstanceId, owner: Option<String>) {
        self.instances.lock().unwrap().insert(
            id,
            FakeInstance {
                image: "kratos-agent:orphan".to_string(),
                owner,
                env: HashMap::new(),
                killed: false,
            },
        );
    }

    /// Ids of instances not yet destroyed, sorted.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.instances.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Owners recorded on every instance ever created, in order.
    pub fn owners(&self) -> Vec<String> {
        self.owners.lock().unwrap().clone()
    }

    fn respond(&self, id: &InstanceId, task: &str) -> Result<ExecOutput, SandboxError> {
        let ok = |value: Value| ExecOutput {
            stdout: format!("{value}\n"),
            ..ExecOutput::default()
        };

        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| SandboxError::instance_not_found(id.as_str()))?;

        let (verb, arg) = task.split_once(':').unwrap_or((task, ""));
        let output = match verb {
            "echo" => ok(json!({ "echo": arg })),
            "text" => ExecOutput {
                stdout: arg.to_string(),
                ..ExecOutput::default()
            },
            "fail" => ExecOutput {
                stderr: arg.to_string(),
                exit_code: 1,
                ..ExecOutput::default()
            },
            "set" => {
                let (key, value) = arg.split_once('=').unwrap_or((arg, ""));
                instance.env.insert(key.to_string(), value.to_string());
                ok(json!({ "set": key }))
            }
            "get" => {
                let mut map = serde_json::Map::new();
                map.insert(arg.to_string(), json!(instance.env.get(arg)));
                ok(Value::Object(map))
            }
            "image" => ok(json!({ "image": instance.image })),
            "price" => ok(json!({ "ticker": arg, "price": 187.23 })),
            _ => ok(json!({ "task": task })),
        };
        Ok(output)
    }
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    async fn create(&self, spec: &InstanceSpec) -> Result<(), SandboxError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        if n < self.boot_failures {
            return Err(SandboxError::container_failed("simulated create failure"));
        }
        self.owners.lock().unwrap().push(spec.owner.clone());
        self.instances.lock().unwrap().insert(
            spec.id.clone(),
            FakeInstance {
                image: spec.image.clone(),
                owner: Some(spec.owner.clone()),
                env: spec.env.iter().cloned().collect(),
                killed: false,
            },
        );
        Ok(())
    }

    async fn start(&self, id: &InstanceId) -> Result<(), SandboxError> {
        let n = self.started.fetch_add(1, Ordering::SeqCst);
        if n < self.hanging_boots {
            std::future::pending::<()>().await;
        }
        if self.instances.lock().unwrap().contains_key(id) {
            Ok(())
        } else {
            Err(SandboxError::instance_not_found(id.as_str()))
        }
    }

    async fn exec(
        &self,
        id: &InstanceId,
        command: &[String],
        sink: Option<&OutputSink>,
    ) -> Result<ExecOutput, SandboxError> {
        self.commands.lock().unwrap().push(command.to_vec());
        let task = command.last().map(String::as_str).unwrap_or_default();
        let emit = |stream: OutputStream, text: &str| {
            if let (Some(sink), false) = (sink, text.is_empty()) {
                sink(stream, text);
            }
        };

        if let Some(ms) = task.strip_prefix("sleep:") {
            let ms: u64 = ms.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(ExecOutput {
                stdout: json!({ "slept_ms": ms }).to_string(),
                ..ExecOutput::default()
            });
        }
        if task == "crash" {
            return Err(SandboxError::container_unhealthy("exec stream broke"));
        }
        if let Some(items) = task.strip_prefix("stream:") {
            let mut stderr = String::new();
            for item in items.split(',') {
                let line = format!("{item}\n");
                emit(OutputStream::Stderr, &line);
                stderr.push_str(&line);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let stdout = format!("{}\n", json!({ "lines": items.split(',').count() }));
            emit(OutputStream::Stdout, &stdout);
            return Ok(ExecOutput {
                stdout,
                stderr,
                ..ExecOutput::default()
            });
        }

        let output = self.respond(id, task)?;
        emit(OutputStream::Stdout, &output.stdout);
        emit(OutputStream::Stderr, &output.stderr);
        Ok(output)
    }

    async fn kill(&self, id: &InstanceId) -> Result<(), SandboxError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if let Some(instance) = self.instances.lock().unwrap().get_mut(id) {
            instance.killed = true;
        }
        Ok(())
    }

    async fn destroy(&self, id: &InstanceId) -> Result<(), SandboxError> {
        let hangs = self.unresponsive
            && self
                .instances
                .lock()
                .unwrap()
                .get(id)
                .is_some_and(|instance| !instance.killed);
        if hangs {
            std::future::pending::<()>().await;
        }
        self.instances.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstanceInfo>, SandboxError> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|(id, instance)| InstanceInfo {
                id: id.clone(),
                owner: instance.owner.clone(),
            })
            .collect())
    }
}
