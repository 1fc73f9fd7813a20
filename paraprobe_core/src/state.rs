use crate::runner::InvocationStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the durable state store. All of these are fatal: silently
/// losing state would corrupt the resume guarantees.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state I/O error for {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("state file {path:?} is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },
}

/// Terminal outcome record for one work item identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub status: InvocationStatus,
    pub timestamp: DateTime<Utc>,
}

/// Durable, crash-consistent record of which work items reached a terminal
/// status.
///
/// Only terminal outcomes are ever written; an item interrupted mid-retry
/// therefore reappears as pending on the next run and restarts with a fresh
/// retry budget. The store is the single writer of its backing file; every
/// `flush` replaces the file atomically (write to a sibling temp file, then
/// rename), so a record observable after `flush()` survives any process
/// termination.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    records: HashMap<String, StateRecord>,
    dirty: bool,
}

impl StateStore {
    /// Opens the store at `path`, loading existing records if the file is
    /// present. A missing file is an empty store, not an error.
    pub fn open(path: PathBuf) -> Result<Self, StateError> {
        let records = if path.is_file() {
            let file = File::open(&path).map_err(|e| StateError::Io {
                path: path.clone(),
                source: e,
            })?;
            if file
                .metadata()
                .map_err(|e| StateError::Io {
                    path: path.clone(),
                    source: e,
                })?
                .len()
                == 0
            {
                HashMap::new()
            } else {
                serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                    StateError::Corrupted {
                        path: path.clone(),
                        reason: e.to_string(),
                    }
                })?
            }
        } else {
            HashMap::new()
        };

        if !records.is_empty() {
            info!(
                records = records.len(),
                path = %path.display(),
                "loaded prior run state"
            );
        }
        Ok(Self {
            path,
            records,
            dirty: false,
        })
    }

    /// Whether `identity` already has a terminal record.
    pub fn is_complete(&self, identity: &str) -> bool {
        self.records.contains_key(identity)
    }

    /// Records a terminal outcome for `identity`. Durable only after the
    /// next [`flush`](Self::flush).
    pub fn mark_complete(&mut self, identity: &str, status: InvocationStatus) {
        self.records.insert(
            identity.to_string(),
            StateRecord {
                status,
                timestamp: Utc::now(),
            },
        );
        self.dirty = true;
    }

    /// All identities with a terminal record, used to seed the enumerator's
    /// exclusion set when resuming.
    pub fn load_all(&self) -> HashSet<String> {
        self.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Atomically persists all records: serialize to a temp file in the same
    /// directory, then rename over the real file.
    pub fn flush(&mut self) -> Result<(), StateError> {
        if !self.dirty {
            return Ok(());
        }
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| StateError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        serde_json::to_writer_pretty(&mut tmp, &self.records).map_err(|e| StateError::Io {
            path: self.path.clone(),
            source: std::io::Error::other(e),
        })?;
        tmp.flush().map_err(|e| StateError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        tmp.persist(&self.path).map_err(|e| StateError::Io {
            path: self.path.clone(),
            source: e.error,
        })?;
        self.dirty = false;
        debug!(records = self.records.len(), "state flushed");
        Ok(())
    }

    /// Drops every record and removes the backing file. Explicit opt-out of
    /// resume.
    pub fn reset(&mut self) -> Result<(), StateError> {
        self.records.clear();
        self.dirty = false;
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| StateError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}
