//! Outcome ledger for batch runs.
//!
//! Every target of a run ends up in exactly one of three collections:
//! `success`, `skipped` or `failed`. The ledger is shared by all executor
//! tasks, is guarded by a single lock, and can be persisted as a JSON report
//! that a later run resumes from.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::FunctionName;

/// Why a target failed, and whether a later run may try it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub error: String,
    pub retryable: bool,
}

/// The serialized form of a ledger. Field order is the on-disk order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub success: Vec<FunctionName>,
    #[serde(default)]
    pub skipped: Vec<FunctionName>,
    #[serde(default)]
    pub failed: BTreeMap<FunctionName, FailureRecord>,
}

impl LedgerSnapshot {
    fn remove(&mut self, name: &FunctionName) {
        self.success.retain(|n| n != name);
        self.skipped.retain(|n| n != name);
        self.failed.remove(name);
    }

    pub fn len(&self) -> usize {
        self.success.len() + self.skipped.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of failures a later run may retry, in name order.
    pub fn retryable_names(&self) -> Vec<FunctionName> {
        self.failed
            .iter()
            .filter(|(_, record)| record.retryable)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        let all = self
            .success
            .iter()
            .chain(self.skipped.iter())
            .chain(self.failed.keys());
        for name in all {
            if !seen.insert(name) {
                return Err(format!("function `{}` is recorded more than once", name));
            }
        }
        Ok(())
    }
}

/// Outcome of a single target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Skipped,
    Failed { message: String, retryable: bool },
}

/// Errors reading or writing a persisted ledger.
#[derive(Debug)]
pub enum LedgerError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Malformed {
        path: PathBuf,
        reason: String,
    },
    Serialize(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "Failed to access report {}: {}", path.display(), source)
            }
            Self::Malformed { path, reason } => {
                write!(f, "Malformed report {}: {}", path.display(), reason)
            }
            Self::Serialize(msg) => write!(f, "Failed to serialize report: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Thread-safe record of per-target outcomes.
#[derive(Debug, Default)]
pub struct Ledger {
    state: Mutex<LedgerSnapshot>,
    /// Serializes saves so the newest snapshot is always the one renamed last.
    save_lock: Mutex<()>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
            save_lock: Mutex::new(()),
        }
    }

    pub async fn add_success(&self, name: &FunctionName) {
        let mut state = self.state.lock().await;
        state.remove(name);
        state.success.push(name.clone());
    }

    pub async fn add_skipped(&self, name: &FunctionName) {
        let mut state = self.state.lock().await;
        state.remove(name);
        state.skipped.push(name.clone());
    }

    pub async fn add_failure(
        &self,
        name: &FunctionName,
        error: impl fmt::Display,
        retryable: bool,
    ) {
        let record = FailureRecord {
            error: error.to_string(),
            retryable,
        };
        let mut state = self.state.lock().await;
        state.remove(name);
        state.failed.insert(name.clone(), record);
    }

    /// Record a failure only if the target has no outcome yet.
    ///
    /// Returns `true` when the failure was recorded.
    pub async fn add_failure_if_absent(
        &self,
        name: &FunctionName,
        error: impl fmt::Display,
        retryable: bool,
    ) -> bool {
        let mut state = self.state.lock().await;
        let present = state.success.contains(name)
            || state.skipped.contains(name)
            || state.failed.contains_key(name);
        if present {
            return false;
        }
        state.failed.insert(
            name.clone(),
            FailureRecord {
                error: error.to_string(),
                retryable,
            },
        );
        true
    }

    pub async fn outcome(&self, name: &FunctionName) -> Option<Outcome> {
        let state = self.state.lock().await;
        if state.success.contains(name) {
            Some(Outcome::Success)
        } else if state.skipped.contains(name) {
            Some(Outcome::Skipped)
        } else {
            state.failed.get(name).map(|record| Outcome::Failed {
                message: record.error.clone(),
                retryable: record.retryable,
            })
        }
    }

    pub async fn get_retryable_names(&self) -> Vec<FunctionName> {
        self.state.lock().await.retryable_names()
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.state.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Write the ledger as pretty JSON, replacing `path` atomically.
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), LedgerError> {
        let path = path.as_ref();
        let _guard = self.save_lock.lock().await;
        let snapshot = self.snapshot().await;
        let mut bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| LedgerError::Serialize(e.to_string()))?;
        bytes.push(b'\n');
        write_atomic(path, &bytes).await
    }

    /// Load a previously saved ledger. A missing or malformed file is an error.
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path).await.map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let snapshot: LedgerSnapshot =
            serde_json::from_slice(&raw).map_err(|e| LedgerError::Malformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        snapshot.validate().map_err(|reason| LedgerError::Malformed {
            path: path.to_path_buf(),
            reason,
        })?;

        Ok(Self::from_snapshot(snapshot))
    }

    /// Log the run report: successes, skips, then one line per failure.
    pub async fn log_summary(&self) {
        let snapshot = self.snapshot().await;

        info!(
            count = snapshot.success.len(),
            "Succeeded: [{}]",
            join_names(&snapshot.success)
        );
        info!(
            count = snapshot.skipped.len(),
            "Skipped: [{}]",
            join_names(&snapshot.skipped)
        );

        if snapshot.failed.is_empty() {
            info!("Failed: none");
            return;
        }
        for (name, record) in &snapshot.failed {
            warn!(
                function = %name,
                retryable = record.retryable,
                "Failed: {}",
                record.error
            );
        }
    }
}

fn join_names(names: &[FunctionName]) -> String {
    names
        .iter()
        .map(FunctionName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), LedgerError> {
    let io_err = |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            io_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "report path has no file name",
            ))
        })?;
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    let write = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    };

    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(io_err(e));
    }
    Ok(())
}
