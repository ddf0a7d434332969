//! Resource metering and the invocation audit log.
//!
//! Every invocation, successful or not, is appended as one JSON line to
//! `invocations.jsonl`. Usage summaries are computed from the in-memory
//! copy, which is reloaded from the log on open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, ErrorCode};
use crate::sandbox::{InstanceId, Reclamation};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Resources one invocation consumed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Submission to teardown.
    pub wall_clock_ms: u64,
    /// Time to a running instance, all attempts included.
    pub boot_ms: u64,
    /// Time spent running the task.
    pub exec_ms: u64,
    /// Instances created before one booted.
    pub boot_attempts: u32,
    /// Memory reserved for the instance, in bytes.
    pub memory_bytes: i64,
    /// How the instance was torn down, if one was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclamation: Option<Reclamation>,
}

impl ResourceUsage {
    /// Whole seconds billed: wall clock rounded up.
    pub fn billed_seconds(&self) -> u64 {
        self.wall_clock_ms.div_ceil(1000)
    }

    /// Reserved memory times wall clock.
    #[allow(clippy::cast_precision_loss)]
    pub fn memory_gb_seconds(&self) -> f64 {
        let gb = self.memory_bytes.max(0) as f64 / BYTES_PER_GB;
        gb * self.wall_clock_ms as f64 / 1000.0
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The task returned `result`.
    Success { result: Value },
    /// The invocation failed with `code`.
    Failure { code: ErrorCode, message: String },
}

impl InvocationOutcome {
    /// Outcome of `result`, keeping the error code only.
    pub fn from_result(result: &Result<Value, EngineError>) -> Self {
        match result {
            Ok(value) => Self::Success {
                result: value.clone(),
            },
            Err(e) => Self::Failure {
                code: e.code(),
                message: e.to_string(),
            },
        }
    }
}

/// Audit entry for one `invoke` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    /// Unique id of the invocation.
    pub id: Uuid,
    /// Agent invoked.
    pub agent_name: String,
    /// Task as submitted.
    pub task: String,
    /// Instance that ran it, if one was created.
    pub instance_id: Option<InstanceId>,
    /// When `invoke` was called.
    pub started_at: DateTime<Utc>,
    /// When the outcome was known.
    pub finished_at: DateTime<Utc>,
    /// Resources consumed.
    pub usage: ResourceUsage,
    /// Result or error.
    pub outcome: InvocationOutcome,
}

impl InvocationRecord {
    /// Ended with an error.
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Failure { .. })
    }

    /// Ended by hitting its wall-clock limit.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.outcome,
            InvocationOutcome::Failure {
                code: ErrorCode::Timeout,
                ..
            }
        )
    }
}

/// Aggregated usage of one agent over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    /// Agent summarized.
    pub agent_name: String,
    /// Invocations in the window.
    pub invocations: usize,
    /// Invocations that ended with an error.
    pub failures: usize,
    /// Invocations that hit their wall-clock limit.
    pub timeouts: usize,
    /// Total wall clock.
    pub wall_clock_ms: u64,
    /// Total billed seconds.
    pub billed_seconds: u64,
    /// Total reserved memory times wall clock.
    pub memory_gb_seconds: f64,
}

/// Append-only invocation log.
pub struct ResourceMeter {
    path: Option<PathBuf>,
    records: Mutex<Vec<InvocationRecord>>,
}

impl ResourceMeter {
    /// A meter that keeps records only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Open the log at `path`, loading every readable entry.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let mut records = Vec::new();

        if path.exists() {
            let content = fs::read_to_string(path)?;
            for (lineno, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<InvocationRecord>(line) {
                    Ok(record) => records.push(record),
                    // A crash mid-append can leave a torn final line.
                    Err(e) => warn!(
                        "Skipping unreadable entry at {}:{}: {}",
                        path.display(),
                        lineno + 1,
                        e
                    ),
                }
            }
            debug!("Loaded {} invocation record(s)", records.len());
        } else if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(Self {
            path: Some(path.to_path_buf()),
            records: Mutex::new(records),
        })
    }

    /// Append one record.
    pub fn record(&self, record: InvocationRecord) -> Result<(), EngineError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(path) = &self.path {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(&line)?;
        }

        records.push(record);
        Ok(())
    }

    /// Usage of `agent_name` for invocations started at or after `since`.
    pub fn usage_since(&self, agent_name: &str, since: DateTime<Utc>) -> UsageSummary {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        records
            .iter()
            .filter(|r| r.agent_name == agent_name && r.started_at >= since)
            .fold(
                UsageSummary {
                    agent_name: agent_name.to_string(),
                    ..UsageSummary::default()
                },
                |mut summary, r| {
                    summary.invocations += 1;
                    summary.failures += usize::from(r.is_failure());
                    summary.timeouts += usize::from(r.is_timeout());
                    summary.wall_clock_ms += r.usage.wall_clock_ms;
                    summary.billed_seconds += r.usage.billed_seconds();
                    summary.memory_gb_seconds += r.usage.memory_gb_seconds();
                    summary
                },
            )
    }

    /// Most recent records for `agent_name`, newest first.
    pub fn history(&self, agent_name: &str, limit: usize) -> Vec<InvocationRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .iter()
            .rev()
            .filter(|r| r.agent_name == agent_name)
            .take(limit)
            .cloned()
            .collect()
    }
}
