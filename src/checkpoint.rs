// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Resumable run progress.
//!
//! Each run keeps a __checkpoint__ file at the top-level of the sync target,
//! recording the last known terminal status of every repository it touched.
//! A later run with resume enabled skips repositories already settled.
//!
//! # Checkpoint Layout
//!
//! The checkpoint is a JSON object keyed by repository key:
//!
//! ```json
//! {
//!   "github:acme/api": {
//!     "status": "success",
//!     "timestamp": "2025-06-01T12:00:00Z",
//!     "message": "fast-forwarded to origin/main at 1a2b3c4"
//!   }
//! }
//! ```
//!
//! Every update rewrites the whole file atomically through a temporary file
//! in the same directory, so a crash mid-write leaves the previous checkpoint
//! intact.

use crate::model::{RepoKey, Status, SyncResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{self, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

/// Name of checkpoint file inside sync target.
pub const CHECKPOINT_FILE: &str = ".sync-checkpoint.json";

/// Last recorded outcome for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub status: Status,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Persistent record of per-repository outcomes.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    entries: BTreeMap<RepoKey, CheckpointEntry>,
}

impl CheckpointStore {
    /// Open checkpoint of a sync target.
    ///
    /// When resuming, previously recorded entries are loaded. A missing file
    /// yields an empty store. An unreadable or corrupt file is reported as a
    /// warning and also yields an empty store, so the run starts fresh.
    /// Without resume, the existing file is ignored.
    #[instrument(skip(target), level = "debug")]
    pub fn open(target: impl AsRef<Path>, resume: bool) -> Self {
        let path = target.as_ref().join(CHECKPOINT_FILE);
        let entries = if resume {
            load(&path)
        } else {
            BTreeMap::new()
        };

        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn entries(&self) -> &BTreeMap<RepoKey, CheckpointEntry> {
        &self.entries
    }

    pub fn get(&self, key: &RepoKey) -> Option<&CheckpointEntry> {
        self.entries.get(key)
    }

    /// Keys whose last status was success or skipped.
    pub fn settled_keys(&self) -> BTreeSet<RepoKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.status.is_settled())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn is_settled(&self, key: &RepoKey) -> bool {
        self.get(key).is_some_and(|entry| entry.status.is_settled())
    }

    /// Record status for key, overwriting any earlier entry.
    pub fn record(&mut self, key: RepoKey, status: Status, message: impl Into<String>) {
        self.entries.insert(
            key,
            CheckpointEntry {
                status,
                timestamp: Utc::now(),
                message: message.into(),
            },
        );
    }

    /// Record terminal outcome of a task.
    pub fn record_result(&mut self, result: &SyncResult) {
        self.record(result.key.clone(), result.status, result.reason.clone());
    }

    /// Write checkpoint to disk atomically.
    ///
    /// # Errors
    ///
    /// - Return [`CheckpointError::Io`] if temporary file cannot be written,
    ///   synced, or renamed over the checkpoint.
    /// - Return [`CheckpointError::Serialize`] if entries cannot be encoded.
    pub fn persist(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let mut file = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(file.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, &self.entries)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|err| err.error)?;

        debug!("persisted {} checkpoint entries", self.entries.len());
        Ok(())
    }
}

fn load(path: &Path) -> BTreeMap<RepoKey, CheckpointEntry> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("no checkpoint at {}", path.display());
            return BTreeMap::new();
        }
        Err(err) => {
            warn!("cannot read checkpoint {}, starting fresh: {err}", path.display());
            return BTreeMap::new();
        }
    };

    match serde_json::from_str::<BTreeMap<RepoKey, CheckpointEntry>>(&data) {
        Ok(entries) => {
            info!("resume from checkpoint with {} entries", entries.len());
            entries
        }
        Err(err) => {
            warn!("checkpoint {} is corrupt, starting fresh: {err}", path.display());
            BTreeMap::new()
        }
    }
}

/// Checkpoint error types.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Checkpoint file cannot be written.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Checkpoint entries cannot be encoded.
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Friendly result alias :3
type Result<T, E = CheckpointError> = std::result::Result<T, E>;
