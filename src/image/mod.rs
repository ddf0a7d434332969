//! Agent image building and caching.
//!
//! Images are keyed by a content fingerprint over the base runtime, the
//! sorted dependency list and the definition bytes. The cache is the one
//! place where concurrent callers must coordinate:
//! - a hit hands out a lease on the existing image, no work done;
//! - a miss starts exactly one build task per fingerprint, and every
//!   caller that arrives while it runs awaits the same shared result;
//! - nothing is published until the build has fully succeeded.
//!
//! An image stays alive while an agent record points at it or a running
//! invocation holds an [`ImageLease`] on it. Records are read from disk at
//! eviction time, so a record written by another engine process protects
//! an image just as well as one of this process.
//! [`ImageBuilder::collect_garbage`] removes everything else.

mod context;
pub mod docker;
pub mod model;

pub use context::{validate_dependency, BuildContext};
pub use model::{HttpModelSource, MaterializedModel, ModelSource};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::store::write_atomic;
use crate::agent::ModelRef;
use crate::config::Config;
use crate::error::EngineError;
use crate::lock::StateLock;

/// Content digest identifying one buildable environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digest over (base runtime, sorted dependencies, definition bytes).
    ///
    /// Every field is length-prefixed so no two distinct inputs can
    /// produce the same byte stream.
    pub fn compute(base_runtime: &str, dependencies: &[String], definition: &[u8]) -> Self {
        let mut deps: Vec<&str> = dependencies
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .collect();
        deps.sort_unstable();
        deps.dedup();

        let mut hasher = Sha256::new();
        hasher.update(b"kratos-image-v1");
        update_field(&mut hasher, base_runtime.as_bytes());
        hasher.update((deps.len() as u64).to_le_bytes());
        for dep in deps {
            update_field(&mut hasher, dep.as_bytes());
        }
        update_field(&mut hasher, definition);

        Self(hex::encode(hasher.finalize()))
    }

    /// The full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex characters, enough to tell images apart in tags and logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(16)]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// A built, runnable agent environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHandle {
    /// Content fingerprint the image was built for.
    pub fingerprint: Fingerprint,
    /// Image tag in the backend. Each build gets its own tag so evicting an
    /// old image can never delete a rebuild of the same fingerprint.
    pub tag: String,
    /// Models baked into the image.
    pub models: Vec<MaterializedModel>,
    /// When the build finished.
    pub built_at: DateTime<Utc>,
}

impl ImageHandle {
    /// A handle with a fresh, unique tag under `tag_prefix`.
    pub fn new(fingerprint: Fingerprint, tag_prefix: &str, models: Vec<MaterializedModel>) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        let tag = format!("{tag_prefix}:{}-{}", fingerprint.short(), &nonce[..8]);
        Self {
            fingerprint,
            tag,
            models,
            built_at: Utc::now(),
        }
    }
}

/// Inputs of one image build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Agent the build is for; used in logs only.
    pub agent_name: String,
    /// Definition bytes, copied into the image.
    pub definition: Vec<u8>,
    /// Extra packages to install.
    pub dependencies: Vec<String>,
    /// Models to materialize into the image.
    pub model_refs: BTreeSet<ModelRef>,
}

/// Backend that turns a build context into a tagged image.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Build and tag an image. Must not leave the tag behind on failure
    /// where the backend can avoid it.
    async fn build(&self, tag: &str, context: BuildContext) -> anyhow::Result<()>;

    /// Remove a tagged image. Removing a missing image is not an error.
    async fn remove(&self, tag: &str) -> anyhow::Result<()>;
}

/// Settings the builder needs from configuration.
#[derive(Debug, Clone)]
pub struct BuilderSettings {
    /// Image every agent image starts from.
    pub base_image: String,
    /// Repository part of agent image tags.
    pub tag_prefix: String,
    /// Directory inside the image holding the agent.
    pub workdir: String,
    /// Command dependencies are appended to.
    pub install_command: String,
    /// Limit on one backend build.
    pub build_timeout: Duration,
}

impl BuilderSettings {
    /// Read the runtime and build sections of `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_image: config.runtime.base_image.clone(),
            tag_prefix: config.build.tag_prefix.clone(),
            workdir: config.runtime.workdir.clone(),
            install_command: config.runtime.install_command.clone(),
            build_timeout: Duration::from_secs(config.build.timeout_secs),
        }
    }
}

type SharedBuild = Shared<BoxFuture<'static, Result<ImageHandle, EngineError>>>;

type Index = BTreeMap<Fingerprint, ImageHandle>;

#[derive(Debug)]
struct CacheEntry {
    handle: ImageHandle,
    /// Leases held in this process.
    refs: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Fingerprint, CacheEntry>,
    inflight: HashMap<Fingerprint, SharedBuild>,
    /// Leases taken by callers waiting on an in-flight build. They become
    /// entry references when the build publishes.
    waiters: HashMap<Fingerprint, usize>,
}

type Cache = Arc<Mutex<CacheState>>;

fn lock(cache: &Cache) -> MutexGuard<'_, CacheState> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    backend: Arc<dyn ImageBackend>,
    models: Arc<dyn ModelSource>,
    settings: BuilderSettings,
    cache: Cache,
    index_path: Option<PathBuf>,
    state_lock: StateLock,
}

/// Fingerprint-keyed, single-flight image cache.
#[derive(Clone)]
pub struct ImageBuilder {
    inner: Arc<Inner>,
}

impl ImageBuilder {
    /// Create a builder. With an `index_path`, published images are shared
    /// through that file: it is merged under `state_lock` on every publish
    /// and eviction, and read again whenever a fingerprint is not cached
    /// in memory.
    pub fn new(
        backend: Arc<dyn ImageBackend>,
        models: Arc<dyn ModelSource>,
        settings: BuilderSettings,
        index_path: Option<PathBuf>,
        state_lock: StateLock,
    ) -> Result<Self, EngineError> {
        let mut state = CacheState::default();

        if let Some(path) = &index_path {
            let index = read_index(path)?;
            debug!("Loaded {} cached image(s) from {}", index.len(), path.display());
            state.entries = index
                .into_iter()
                .map(|(fp, handle)| (fp, CacheEntry { handle, refs: 0 }))
                .collect();
        }

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                models,
                settings,
                cache: Arc::new(Mutex::new(state)),
                index_path,
                state_lock,
            }),
        })
    }

    /// Settings this builder was created with.
    pub fn settings(&self) -> &BuilderSettings {
        &self.inner.settings
    }

    /// Fingerprint a request against this builder's base runtime.
    pub fn fingerprint(&self, request: &BuildRequest) -> Fingerprint {
        Fingerprint::compute(
            &self.inner.settings.base_image,
            &request.dependencies,
            &request.definition,
        )
    }

    /// Build the image for `request`, or reuse a cached or in-flight one.
    ///
    /// The returned lease holds one reference on the image.
    pub async fn build(&self, request: BuildRequest) -> Result<ImageLease, EngineError> {
        let fingerprint = self.fingerprint(&request);

        let (guard, pending) = {
            let mut state = lock(&self.inner.cache);
            if !state.inflight.contains_key(&fingerprint) {
                self.inner.adopt(&mut state, &fingerprint);
            }

            if let Some(entry) = state.entries.get_mut(&fingerprint) {
                entry.refs += 1;
                debug!("Image cache hit for {}", fingerprint.short());
                return Ok(ImageLease {
                    handle: entry.handle.clone(),
                    guard: RefGuard::new(fingerprint, Arc::clone(&self.inner.cache)),
                });
            }

            let pending = if let Some(inflight) = state.inflight.get(&fingerprint) {
                debug!("Joining in-flight build for {}", fingerprint.short());
                inflight.clone()
            } else {
                let shared = self.spawn_build(fingerprint.clone(), request);
                state.inflight.insert(fingerprint.clone(), shared.clone());
                shared
            };

            *state.waiters.entry(fingerprint.clone()).or_default() += 1;
            (
                RefGuard::new(fingerprint, Arc::clone(&self.inner.cache)),
                pending,
            )
        };

        let handle = pending.await?;
        Ok(ImageLease { handle, guard })
    }

    /// Await the in-flight build for `fingerprint`, if this process is
    /// running one.
    pub async fn wait_for(&self, fingerprint: &Fingerprint) -> Option<Result<ImageHandle, EngineError>> {
        let pending = lock(&self.inner.cache).inflight.get(fingerprint).cloned()?;
        Some(pending.await)
    }

    /// Take a lease on the published image `image`, including one
    /// published by another process.
    ///
    /// The caller's handle wins over the cached one: another process may
    /// have evicted and rebuilt the fingerprint under a new tag since it
    /// was cached here.
    pub fn lease(&self, image: &ImageHandle) -> Option<ImageLease> {
        let fingerprint = &image.fingerprint;
        let mut state = lock(&self.inner.cache);
        self.inner.adopt(&mut state, fingerprint);
        let entry = state.entries.get_mut(fingerprint)?;
        if entry.handle.tag != image.tag && entry.refs == 0 {
            debug!("Cached image {} was replaced by {}", entry.handle.tag, image.tag);
            entry.handle = image.clone();
        }
        entry.refs += 1;
        Some(ImageLease {
            handle: image.clone(),
            guard: RefGuard::new(fingerprint.clone(), Arc::clone(&self.inner.cache)),
        })
    }

    /// Whether a published image exists for `fingerprint`.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let mut state = lock(&self.inner.cache);
        self.inner.adopt(&mut state, fingerprint)
    }

    /// Leases currently held on a published image in this process.
    pub fn ref_count(&self, fingerprint: &Fingerprint) -> Option<usize> {
        lock(&self.inner.cache)
            .entries
            .get(fingerprint)
            .map(|entry| entry.refs)
    }

    /// Published images with their lease counts, ordered by tag.
    pub fn cached(&self) -> Vec<(ImageHandle, usize)> {
        let mut images: Vec<(ImageHandle, usize)> = lock(&self.inner.cache)
            .entries
            .values()
            .map(|entry| (entry.handle.clone(), entry.refs))
            .collect();
        images.sort_by(|a, b| a.0.tag.cmp(&b.0.tag));
        images
    }

    /// Evict every image that is neither leased here nor in `pinned`, and
    /// remove it from the backend.
    ///
    /// `pinned` runs under the state lock, so it sees the agent records as
    /// they are at the moment of eviction; it must not take that lock
    /// itself. Images the backend refuses to remove go back into the index
    /// for a later attempt. Returns the tags that were removed.
    pub async fn collect_garbage<F>(&self, pinned: F) -> Result<Vec<String>, EngineError>
    where
        F: FnOnce() -> Result<HashSet<Fingerprint>, EngineError>,
    {
        let doomed: Vec<ImageHandle> = {
            let mut state = lock(&self.inner.cache);
            let candidates: Vec<Fingerprint> = state
                .entries
                .iter()
                .filter(|(fp, entry)| entry.refs == 0 && !state.inflight.contains_key(*fp))
                .map(|(fp, _)| fp.clone())
                .collect();
            if candidates.is_empty() {
                return Ok(Vec::new());
            }

            let fingerprints = self.inner.state_lock.with(|| {
                let pinned = pinned()?;
                let doomed: Vec<Fingerprint> = candidates
                    .into_iter()
                    .filter(|fp| !pinned.contains(fp))
                    .collect();
                if !doomed.is_empty() {
                    self.inner.modify_index_locked(|index| {
                        for fp in &doomed {
                            index.remove(fp);
                        }
                    })?;
                }
                Ok(doomed)
            })?;

            fingerprints
                .iter()
                .filter_map(|fp| state.entries.remove(fp))
                .map(|entry| entry.handle)
                .collect()
        };

        let mut evicted = Vec::with_capacity(doomed.len());
        for handle in doomed {
            info!("Evicting unreferenced image {}", handle.tag);
            match self.inner.backend.remove(&handle.tag).await {
                Ok(()) => evicted.push(handle.tag),
                Err(e) => {
                    warn!("Failed to remove image {}: {:#}", handle.tag, e);
                    self.inner.restore(handle)?;
                }
            }
        }
        Ok(evicted)
    }

    fn spawn_build(&self, fingerprint: Fingerprint, request: BuildRequest) -> SharedBuild {
        let inner = Arc::clone(&self.inner);
        // Run detached so a cancelled caller cannot abandon a half-done build.
        let task = tokio::spawn(async move {
            let result = inner.execute(&fingerprint, &request).await;
            inner.publish(&fingerprint, result)
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(EngineError::build_failed(format!("build task aborted: {e}")))
            })
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    async fn execute(
        &self,
        fingerprint: &Fingerprint,
        request: &BuildRequest,
    ) -> Result<ImageHandle, EngineError> {
        info!(
            "Building image {} for agent '{}'",
            fingerprint.short(),
            request.agent_name
        );
        let started = Instant::now();

        // Only the models the definition declares, never more.
        let mut models = Vec::with_capacity(request.model_refs.len());
        for model in &request.model_refs {
            let materialized = self.models.materialize(model).await.map_err(|e| {
                EngineError::build_failed(format!("Failed to materialize model {model}: {e:#}"))
            })?;
            models.push(materialized);
        }

        let handle = ImageHandle::new(fingerprint.clone(), &self.settings.tag_prefix, models);
        let context = BuildContext::assemble(&self.settings, &handle, request)
            .map_err(|e| EngineError::build_failed(format!("{e:#}")))?;

        let outcome = tokio::time::timeout(
            self.settings.build_timeout,
            self.backend.build(&handle.tag, context),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some(format!(
                "build timed out after {} seconds",
                self.settings.build_timeout.as_secs()
            )),
        };

        if let Some(reason) = failure {
            if let Err(e) = self.backend.remove(&handle.tag).await {
                debug!("No partial image to clean up for {}: {:#}", handle.tag, e);
            }
            warn!("Image build {} failed: {}", fingerprint.short(), reason);
            return Err(EngineError::build_failed(reason));
        }

        info!(
            "Built image {} in {:.1}s",
            handle.tag,
            started.elapsed().as_secs_f64()
        );
        Ok(handle)
    }

    /// Finish an in-flight build: persist and publish on success.
    fn publish(
        &self,
        fingerprint: &Fingerprint,
        result: Result<ImageHandle, EngineError>,
    ) -> Result<ImageHandle, EngineError> {
        let mut state = lock(&self.cache);
        state.inflight.remove(fingerprint);

        let handle = result?;
        self.state_lock.with(|| {
            self.modify_index_locked(|index| {
                index.insert(fingerprint.clone(), handle.clone());
            })
        })?;

        let refs = state.waiters.remove(fingerprint).unwrap_or(0);
        state.entries.insert(
            fingerprint.clone(),
            CacheEntry {
                handle: handle.clone(),
                refs,
            },
        );
        Ok(handle)
    }

    /// Put back an image the backend would not remove.
    fn restore(&self, handle: ImageHandle) -> Result<(), EngineError> {
        let mut state = lock(&self.cache);
        self.state_lock.with(|| {
            self.modify_index_locked(|index| {
                index.insert(handle.fingerprint.clone(), handle.clone());
            })
        })?;
        state
            .entries
            .entry(handle.fingerprint.clone())
            .or_insert(CacheEntry { handle, refs: 0 });
        Ok(())
    }

    /// Make sure `fingerprint` is cached if any process published it.
    /// Returns whether it is cached now.
    fn adopt(&self, state: &mut CacheState, fingerprint: &Fingerprint) -> bool {
        if state.entries.contains_key(fingerprint) {
            return true;
        }
        let Some(path) = &self.index_path else {
            return false;
        };

        match read_index(path) {
            Ok(mut index) => match index.remove(fingerprint) {
                Some(handle) => {
                    debug!("Adopting image {} published elsewhere", handle.tag);
                    state
                        .entries
                        .insert(fingerprint.clone(), CacheEntry { handle, refs: 0 });
                    true
                }
                None => false,
            },
            Err(e) => {
                warn!("Failed to read image index: {}", e);
                false
            }
        }
    }

    /// Re-read the index, apply `change` and write it back. The caller
    /// holds the state lock.
    fn modify_index_locked(&self, change: impl FnOnce(&mut Index)) -> Result<(), EngineError> {
        let Some(path) = &self.index_path else {
            return Ok(());
        };

        let mut index = read_index(path)?;
        change(&mut index);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(path, &serde_json::to_vec_pretty(&index)?)
    }
}

fn read_index(path: &Path) -> Result<Index, EngineError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Index::new()),
        Err(e) => {
            return Err(EngineError::storage(format!(
                "Failed to read {}: {e}",
                path.display()
            )))
        }
    };
    serde_json::from_slice(&content)
        .map_err(|e| EngineError::storage(format!("Failed to parse {}: {e}", path.display())))
}

fn release_ref(cache: &Cache, fingerprint: &Fingerprint) {
    let mut state = lock(cache);
    if let Some(entry) = state.entries.get_mut(fingerprint) {
        entry.refs = entry.refs.saturating_sub(1);
    } else if let Some(waiting) = state.waiters.get_mut(fingerprint) {
        *waiting = waiting.saturating_sub(1);
        if *waiting == 0 {
            state.waiters.remove(fingerprint);
        }
    }
}

/// One counted reference, released on drop.
struct RefGuard {
    fingerprint: Fingerprint,
    cache: Cache,
}

impl RefGuard {
    fn new(fingerprint: Fingerprint, cache: Cache) -> Self {
        Self { fingerprint, cache }
    }
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        release_ref(&self.cache, &self.fingerprint);
    }
}

/// A counted reference on a published image.
///
/// Invocations hold a lease for the whole sandbox run, so removing or
/// replacing the agent meanwhile cannot evict the image under them.
pub struct ImageLease {
    handle: ImageHandle,
    guard: RefGuard,
}

impl ImageLease {
    /// The leased image.
    pub fn handle(&self) -> &ImageHandle {
        &self.handle
    }

    /// Fingerprint of the leased image.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.guard.fingerprint
    }
}

impl std::fmt::Debug for ImageLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLease")
            .field("tag", &self.handle.tag)
            .finish()
    }
}
