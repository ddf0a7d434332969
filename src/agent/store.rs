//! Durable registry of submitted agents.
//!
//! One JSON file per agent under `<state_dir>/agents/`. Writes go to a
//! temp file that is renamed over the target, so a crash leaves either
//! the old or the new record, never a mix. Within a process, writers are
//! queued per name; across processes, the state lock serializes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{LimitOverrides, ModelRef};
use crate::error::EngineError;
use crate::image::{Fingerprint, ImageHandle};
use crate::lock::StateLock;

const MAX_NAME_LEN: usize = 63;
const INTERRUPTED: &str = "build interrupted; resubmit the agent";

/// Build state of an agent's environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Submitted; the image build has not finished.
    Pending,
    /// The image is built and invocations can run.
    Built,
    /// The build failed or was interrupted; see [`AgentRecord::failure`].
    Failed,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Built => write!(f, "built"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Everything the engine keeps about one submitted agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique key; see [`validate_name`].
    pub name: String,
    /// Identifies the submission that produced this record.
    pub revision: Uuid,
    /// Definition bytes exactly as submitted.
    #[serde(with = "hex::serde")]
    pub definition: Vec<u8>,
    /// Sorted and de-duplicated.
    pub dependencies: Vec<String>,
    /// Models the definition declares.
    pub model_refs: BTreeSet<ModelRef>,
    /// Image fingerprint of this submission.
    pub fingerprint: Fingerprint,
    /// Set once the build succeeds.
    pub image: Option<ImageHandle>,
    /// Build state.
    pub status: AgentStatus,
    /// Why the agent is `Failed`.
    #[serde(default)]
    pub failure: Option<String>,
    /// Engine process running the build while `Pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<String>,
    /// Agent-level limit defaults declared in the definition.
    #[serde(default)]
    pub limits: LimitOverrides,
    /// When the name was first registered in this revision.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    /// A fresh record whose image has not been built yet.
    pub fn pending(
        name: impl Into<String>,
        definition: Vec<u8>,
        dependencies: Vec<String>,
        model_refs: BTreeSet<ModelRef>,
        fingerprint: Fingerprint,
        limits: LimitOverrides,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            revision: Uuid::new_v4(),
            definition,
            dependencies: normalize_dependencies(dependencies),
            model_refs,
            fingerprint,
            image: None,
            status: AgentStatus::Pending,
            failure: None,
            builder: None,
            limits,
            created_at: now,
            updated_at: now,
        }
    }

    /// Built with an image to run.
    pub fn is_built(&self) -> bool {
        self.status == AgentStatus::Built && self.image.is_some()
    }
}

/// Sort, trim and de-duplicate a dependency list.
pub fn normalize_dependencies(dependencies: Vec<String>) -> Vec<String> {
    let set: BTreeSet<String> = dependencies
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect();
    set.into_iter().collect()
}

/// Check that a name is usable as a file name and a container label.
pub fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::invalid_name(name, "name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::invalid_name(
            name,
            format!("name is longer than {MAX_NAME_LEN} characters"),
        ));
    }

    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c));

    if first_ok && rest_ok {
        Ok(())
    } else {
        Err(EngineError::invalid_name(
            name,
            "use lowercase letters, digits, '.', '_' or '-', starting with a letter or digit",
        ))
    }
}

/// Agent registry with optional on-disk persistence.
///
/// With a directory, the files are the source of truth: every read goes
/// to disk and every write is a read-modify-write under the [`StateLock`],
/// so several engine processes can share one directory.
#[derive(Debug, Default)]
pub struct AgentStore {
    dir: Option<PathBuf>,
    lock: StateLock,
    /// Only consulted without a directory.
    records: RwLock<HashMap<String, AgentRecord>>,
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

enum Change {
    Keep,
    Write(AgentRecord),
    Delete,
}

impl AgentStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) a store rooted at `dir`, coordinating with other
    /// processes through `lock`. Leftover temp files from interrupted
    /// writes are deleted.
    pub fn open(dir: &Path, lock: StateLock) -> Result<Self, EngineError> {
        fs::create_dir_all(dir).map_err(|e| {
            EngineError::storage(format!("Failed to create {}: {e}", dir.display()))
        })?;

        let count = lock.with(|| {
            remove_temp_files(dir);
            Ok(read_records(dir)?.len())
        })?;
        info!("Loaded {} agent record(s) from {}", count, dir.display());

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            lock,
            records: RwLock::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        })
    }

    /// Read the records under `dir` without taking ownership of it:
    /// nothing is repaired or rewritten. Missing directories read as empty.
    pub fn snapshot(dir: &Path) -> Result<Vec<AgentRecord>, EngineError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = read_records(dir)?;
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Mark `Pending` records whose builder is no longer running as
    /// `Failed`. Returns the names that were repaired.
    pub fn repair_interrupted(
        &self,
        is_alive: impl Fn(&str) -> bool,
    ) -> Result<Vec<String>, EngineError> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };

        self.lock.with(|| {
            let mut repaired = Vec::new();
            for mut record in read_records(dir)? {
                if record.status != AgentStatus::Pending
                    || record.builder.as_deref().is_some_and(&is_alive)
                {
                    continue;
                }
                warn!(
                    "Agent '{}' was still building when its engine stopped; marking it failed",
                    record.name
                );
                record.status = AgentStatus::Failed;
                record.failure = Some(INTERRUPTED.to_string());
                record.builder = None;
                record.updated_at = Utc::now();
                self.persist(&record)?;
                repaired.push(record.name);
            }
            Ok(repaired)
        })
    }

    /// The current record of `name`. Unreadable records are logged and
    /// read as missing.
    pub fn get(&self, name: &str) -> Option<AgentRecord> {
        self.load(name).unwrap_or_else(|e| {
            warn!("Failed to read agent '{}': {}", name, e);
            None
        })
    }

    /// Names of all live agents, sorted.
    pub fn list(&self) -> Vec<String> {
        self.records().into_iter().map(|record| record.name).collect()
    }

    /// Snapshot of all records, sorted by name.
    pub fn records(&self) -> Vec<AgentRecord> {
        self.load_all().unwrap_or_else(|e| {
            warn!("Failed to read agent records: {}", e);
            Vec::new()
        })
    }

    /// Every fingerprint a record points at, building or built.
    ///
    /// Reads without taking the [`StateLock`]; call it from inside one.
    pub fn pinned_fingerprints(&self) -> Result<HashSet<Fingerprint>, EngineError> {
        let mut pinned = HashSet::new();
        for record in self.load_all()? {
            if let Some(image) = record.image {
                pinned.insert(image.fingerprint);
            }
            pinned.insert(record.fingerprint);
        }
        Ok(pinned)
    }

    /// Create or replace a record. Returns the record it replaced.
    pub async fn put(&self, record: AgentRecord) -> Result<Option<AgentRecord>, EngineError> {
        validate_name(&record.name)?;
        let writer = self.writer(&record.name);
        let _guard = writer.lock().await;

        let name = record.name.clone();
        self.update(&name, |previous| (Change::Write(record), previous))
    }

    /// Mark `revision` of `name` as built. No-op if the record was replaced
    /// or removed in the meantime; returns whether it applied.
    pub async fn complete(
        &self,
        name: &str,
        revision: Uuid,
        image: ImageHandle,
    ) -> Result<bool, EngineError> {
        self.transition(name, revision, |record| {
            record.status = AgentStatus::Built;
            record.image = Some(image);
            record.failure = None;
        })
        .await
    }

    /// Mark `revision` of `name` as failed. Same compare-and-set rule as
    /// [`AgentStore::complete`].
    pub async fn fail(
        &self,
        name: &str,
        revision: Uuid,
        reason: impl Into<String>,
    ) -> Result<bool, EngineError> {
        let reason = reason.into();
        self.transition(name, revision, |record| {
            record.status = AgentStatus::Failed;
            record.image = None;
            record.failure = Some(reason);
        })
        .await
    }

    /// Delete a record. Returns it if it existed.
    pub async fn remove(&self, name: &str) -> Result<Option<AgentRecord>, EngineError> {
        let writer = self.writer(name);
        let _guard = writer.lock().await;

        self.update(name, |current| match current {
            Some(record) => (Change::Delete, Some(record)),
            None => (Change::Keep, None),
        })
    }

    async fn transition<F>(&self, name: &str, revision: Uuid, apply: F) -> Result<bool, EngineError>
    where
        F: FnOnce(&mut AgentRecord),
    {
        let writer = self.writer(name);
        let _guard = writer.lock().await;

        self.update(name, |current| match current {
            Some(mut record) if record.revision == revision => {
                apply(&mut record);
                record.builder = None;
                record.updated_at = Utc::now();
                (Change::Write(record), true)
            }
            Some(_) => {
                debug!(
                    "Agent '{}' was resubmitted during the build; dropping stale result",
                    name
                );
                (Change::Keep, false)
            }
            None => {
                debug!("Agent '{}' was removed during the build", name);
                (Change::Keep, false)
            }
        })
    }

    /// Read the current record, decide, and write the outcome, all under
    /// the state lock.
    fn update<T>(
        &self,
        name: &str,
        apply: impl FnOnce(Option<AgentRecord>) -> (Change, T),
    ) -> Result<T, EngineError> {
        self.lock.with(|| {
            let (change, result) = apply(self.load(name)?);
            match change {
                Change::Keep => {}
                Change::Write(record) => {
                    self.persist(&record)?;
                    if self.dir.is_none() {
                        self.cache().insert(name.to_string(), record);
                    }
                }
                Change::Delete => {
                    if let Some(path) = self.record_path(name) {
                        match fs::remove_file(&path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => {
                                return Err(EngineError::storage(format!(
                                    "Failed to delete {}: {e}",
                                    path.display()
                                )))
                            }
                        }
                    }
                    if self.dir.is_none() {
                        self.cache().remove(name);
                    }
                }
            }
            Ok(result)
        })
    }

    fn load(&self, name: &str) -> Result<Option<AgentRecord>, EngineError> {
        match self.record_path(name) {
            Some(path) => read_record(&path),
            None => Ok(self
                .records
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned()),
        }
    }

    fn load_all(&self) -> Result<Vec<AgentRecord>, EngineError> {
        let mut records = match &self.dir {
            Some(dir) => read_records(dir)?,
            None => self
                .records
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect(),
        };
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn cache(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AgentRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn record_path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{name}.json")))
    }

    fn persist(&self, record: &AgentRecord) -> Result<(), EngineError> {
        if let Some(path) = self.record_path(&record.name) {
            write_atomic(&path, &serde_json::to_vec_pretty(record)?)?;
        }
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<Option<AgentRecord>, EngineError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(EngineError::storage(format!(
                "Failed to read {}: {e}",
                path.display()
            )))
        }
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| EngineError::storage(format!("Failed to parse {}: {e}", path.display())))
}

fn read_records(dir: &Path) -> Result<Vec<AgentRecord>, EngineError> {
    let mut records = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        // Removed between listing and reading.
        if let Some(record) = read_record(&path)? {
            records.push(record);
        }
    }
    Ok(records)
}

fn remove_temp_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for path in entries.filter_map(Result::ok).map(|entry| entry.path()) {
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            debug!("Removing stale temp file {}", path.display());
            let _ = fs::remove_file(&path);
        }
    }
}

/// Write `bytes` to a sibling temp file, sync it, then rename it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(EngineError::storage(format!(
            "Failed to write {}: {e}",
            path.display()
        )));
    }
    Ok(())
}
