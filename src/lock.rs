//! Cross-process coordination over one state directory.
//!
//! Several engine processes may share a state directory. Two kinds of
//! advisory file lock keep them from trampling each other:
//! - [`StateLock`] serializes every read-modify-write of the agent records
//!   and the image index. It is held for a few file operations at a time
//!   and never across an `.await`.
//! - [`ProcessOwner`] is held for the lifetime of a process. Other
//!   processes check it to tell a live owner from a dead one before they
//!   repair its half-finished builds or reclaim its sandboxes.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineError;

const LOCK_FILE: &str = ".lock";
const OWNERS_DIR: &str = "owners";

/// Exclusive lock on a state directory.
#[derive(Debug, Clone, Default)]
pub struct StateLock {
    path: Option<PathBuf>,
}

impl StateLock {
    /// Lock guarding `state_dir`. The lock file is created on first use.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: Some(state_dir.join(LOCK_FILE)),
        }
    }

    /// A lock for in-memory state: `with` just runs the closure.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock. Blocks the calling thread until the
    /// lock is free, so `f` must be short and synchronous.
    pub fn with<T>(&self, f: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
        let Some(path) = &self.path else {
            return f();
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_lock_file(path)?;
        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock.write().map_err(|e| {
            EngineError::storage(format!("Failed to lock {}: {e}", path.display()))
        })?;
        f()
    }
}

/// This process's claim on a state directory.
///
/// The claim is a locked file `owners/<id>.lock`. The operating system
/// drops the lock when the process exits, however it exits, so a lock
/// file that can be locked again belongs to a dead process.
pub struct ProcessOwner {
    id: String,
    path: Option<PathBuf>,
    // Locked until the file is closed.
    _lock: Option<fd_lock::RwLock<File>>,
}

impl ProcessOwner {
    /// Register a new owner under `state_dir`.
    pub fn register(state_dir: &Path) -> Result<Self, EngineError> {
        let id = Uuid::new_v4().simple().to_string();
        let dir = state_dir.join(OWNERS_DIR);
        fs::create_dir_all(&dir).map_err(|e| {
            EngineError::storage(format!("Failed to create {}: {e}", dir.display()))
        })?;

        let path = dir.join(format!("{id}.lock"));
        let mut lock = fd_lock::RwLock::new(open_lock_file(&path)?);
        let guard = lock.try_write().map_err(|e| {
            EngineError::storage(format!("Failed to lock {}: {e}", path.display()))
        })?;
        std::mem::forget(guard);

        debug!("Registered engine process {}", id);
        Ok(Self {
            id,
            path: Some(path),
            _lock: Some(lock),
        })
    }

    /// An owner that other processes cannot see. Used with in-memory state.
    pub fn ephemeral() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            path: None,
            _lock: None,
        }
    }

    /// Identifier recorded on builds and sandboxes this process starts.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the process registered as `owner` is still running.
    ///
    /// Unknown owners are dead. When the answer cannot be determined the
    /// owner is assumed alive, so nothing of a live process is reclaimed.
    pub fn is_alive(&self, owner: &str) -> bool {
        if owner == self.id {
            return true;
        }
        let Some(dir) = self.path.as_deref().and_then(Path::parent) else {
            return false;
        };
        if owner.is_empty() || !owner.chars().all(|c| c.is_ascii_hexdigit()) {
            return false;
        }

        let path = dir.join(format!("{owner}.lock"));
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return false,
            Err(e) => {
                warn!("Cannot check engine process {}: {}", owner, e);
                return true;
            }
        };

        let mut lock = fd_lock::RwLock::new(file);
        let alive = match lock.try_write() {
            Ok(guard) => {
                drop(guard);
                debug!("Engine process {} is gone; removing its lock file", owner);
                let _ = fs::remove_file(&path);
                false
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(e) => {
                warn!("Cannot check engine process {}: {}", owner, e);
                true
            }
        };
        alive
    }
}

impl std::fmt::Debug for ProcessOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessOwner")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for ProcessOwner {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = fs::remove_file(path);
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File, EngineError> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| EngineError::storage(format!("Failed to open {}: {e}", path.display())))
}
