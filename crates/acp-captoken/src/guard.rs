// SPDX-License-Identifier: MIT OR Apache-2.0
//! Replay guards: at-most-once consumption of token ids.
//!
//! A guard is an atomic `insert_if_absent` store of `(jti, expires_at)`
//! pairs. The first successful insert wins; any later insert of the same jti
//! before its expiry fails. The durable [`FileReplayGuard`] is the production
//! backend; [`MemoryReplayGuard`] exists for tests and ephemeral tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

/// Errors from replay-guard operations.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The backing store could not be read or written.
    #[error("replay guard storage failure: {0}")]
    Storage(String),
}

/// Outcome of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The jti was not present; it is now recorded.
    Inserted,
    /// The jti was already present and unexpired.
    AlreadyPresent,
}

/// Atomic at-most-once store for token ids.
///
/// Implementations must make `insert_if_absent` atomic: concurrent callers
/// with the same jti observe exactly one `Inserted`.
pub trait ReplayGuard: Send + Sync {
    /// Record `jti` unless it is already present and unexpired.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if the backing store fails.
    fn insert_if_absent(
        &self,
        jti: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, GuardError>;

    /// Returns `true` if `jti` is present and unexpired.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if the backing store fails.
    fn contains(&self, jti: &str) -> Result<bool, GuardError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Purely in-memory guard. Suitable only for tests: restarts forget every
/// consumed jti.
#[derive(Debug, Default)]
pub struct MemoryReplayGuard {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryReplayGuard {
    /// Create an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplayGuard for MemoryReplayGuard {
    fn insert_if_absent(
        &self,
        jti: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, GuardError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let now = Utc::now();
        entries.retain(|_, exp| *exp > now);
        if entries.contains_key(jti) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        entries.insert(jti.to_string(), expires_at);
        Ok(InsertOutcome::Inserted)
    }

    fn contains(&self, jti: &str) -> Result<bool, GuardError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries.get(jti).is_some_and(|exp| *exp > Utc::now()))
    }
}

fn poisoned() -> GuardError {
    GuardError::Storage("guard lock poisoned".into())
}

// ---------------------------------------------------------------------------
// Durable file-backed backend
// ---------------------------------------------------------------------------

/// One persisted guard entry.
#[derive(Debug, Serialize, Deserialize)]
struct GuardRecord {
    jti: String,
    expires_at: DateTime<Utc>,
}

struct FileGuardInner {
    entries: HashMap<String, DateTime<Utc>>,
    file: std::fs::File,
}

/// Durable guard backed by an append-only JSONL file.
///
/// Every accepted insert is appended and flushed before the outcome is
/// returned, so a restart replays the full consumption history. Expired
/// entries are compacted away on load.
pub struct FileReplayGuard {
    path: PathBuf,
    inner: Mutex<FileGuardInner>,
}

impl FileReplayGuard {
    /// Open (or create) a guard file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if the file cannot be opened or an
    /// existing file cannot be parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, GuardError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GuardError::Storage(format!("create {}: {e}", parent.display())))?;
        }

        let mut entries = HashMap::new();
        let now = Utc::now();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| GuardError::Storage(format!("read {}: {e}", path.display())))?;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                let record: GuardRecord = serde_json::from_str(line)
                    .map_err(|e| GuardError::Storage(format!("parse guard entry: {e}")))?;
                if record.expires_at > now {
                    entries.insert(record.jti, record.expires_at);
                }
            }
        }

        // Compact: rewrite only the live entries, then reopen for append.
        let mut tmp = String::new();
        for (jti, expires_at) in &entries {
            let record = GuardRecord {
                jti: jti.clone(),
                expires_at: *expires_at,
            };
            tmp.push_str(&serde_json::to_string(&record).map_err(storage_err)?);
            tmp.push('\n');
        }
        std::fs::write(&path, tmp)
            .map_err(|e| GuardError::Storage(format!("compact {}: {e}", path.display())))?;

        let file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| GuardError::Storage(format!("open {}: {e}", path.display())))?;

        Ok(Self {
            path,
            inner: Mutex::new(FileGuardInner { entries, file }),
        })
    }

    /// The path of the backing file.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

fn storage_err(e: impl std::fmt::Display) -> GuardError {
    GuardError::Storage(e.to_string())
}

impl ReplayGuard for FileReplayGuard {
    fn insert_if_absent(
        &self,
        jti: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, GuardError> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let now = Utc::now();
        if inner.entries.get(jti).is_some_and(|exp| *exp > now) {
            return Ok(InsertOutcome::AlreadyPresent);
        }

        let record = GuardRecord {
            jti: jti.to_string(),
            expires_at,
        };
        let mut line = serde_json::to_string(&record).map_err(storage_err)?;
        line.push('\n');
        inner.file.write_all(line.as_bytes()).map_err(storage_err)?;
        inner.file.sync_data().map_err(storage_err)?;
        inner.entries.insert(jti.to_string(), expires_at);
        Ok(InsertOutcome::Inserted)
    }

    fn contains(&self, jti: &str) -> Result<bool, GuardError> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.entries.get(jti).is_some_and(|exp| *exp > Utc::now()))
    }
}
