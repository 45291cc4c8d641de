// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! A portable archive of everything that was recorded, for attaching to a bug report.
//!
//! The archive is a single pretty printed JSON document holding the journal, the retained boot sessions, the events
//! captured for each session, the backup index, and the end of the log file. Building it only ever reads the stores.
//! Reading it back and passing its operations to [`crate::journal::OperationJournal::import`] rebuilds the journal.

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    backup::Backup,
    journal::{Operation, Outcome},
    session::BootSession,
    system::{
        events::BootEvent,
        fs::{FsError, write_atomic},
        log_backend::{LOG_DIR, LOG_FILE},
    },
};

/// The version of the archive format that is written, and the only one that can be read.
pub const FORMAT_VERSION: u32 = 1;

/// The most lines of the log file that are included.
const LOG_TAIL_LINES: usize = 200;

/// An error that may result from writing or reading an archive.
#[derive(Error, Debug)]
pub enum ExportError {
    /// The archive could not be encoded or decoded.
    #[error("Archive JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The archive was written by an incompatible version.
    #[error("Unsupported archive format version {0}")]
    UnsupportedVersion(u32),

    /// The archive could not be read or written.
    #[error("Archive IO error: {0}")]
    Fs(#[from] FsError),
}

impl From<std::io::Error> for ExportError {
    fn from(e: std::io::Error) -> Self {
        Self::Fs(FsError::Io(e))
    }
}

/// A snapshot of every store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsArchive {
    /// The version of the archive format.
    pub format_version: u32,

    /// When the archive was built.
    pub exported_at: DateTime<Utc>,

    /// Every operation in the journal, ascending.
    pub operations: Vec<Operation>,

    /// Every retained boot session, most recent first.
    pub sessions: Vec<BootSession>,

    /// The events captured for each session that has any.
    pub events: BTreeMap<String, Vec<BootEvent>>,

    /// Every backup, most recent first.
    pub backups: Vec<Backup>,

    /// The last lines of the log file.
    pub log_tail: Vec<String>,
}

impl DiagnosticsArchive {
    /// Constructs a new [`DiagnosticsArchive`] at the current format version.
    #[must_use = "Has no effect if the result is unused"]
    pub fn new(exported_at: DateTime<Utc>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            exported_at,
            operations: Vec::new(),
            sessions: Vec::new(),
            events: BTreeMap::new(),
            backups: Vec::new(),
            log_tail: Vec::new(),
        }
    }

    /// Atomically writes the archive to a file.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the archive could not be encoded or written.
    pub fn write(&self, path: &Path) -> Result<(), ExportError> {
        let content = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &content)?;
        info!(
            "[EXPORT]: Wrote {} operations and {} sessions to {}",
            self.operations.len(),
            self.sessions.len(),
            path.display()
        );
        Ok(())
    }

    /// Reads an archive from a file.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the file could not be read or decoded, or was written in another format version.
    pub fn read(path: &Path) -> Result<Self, ExportError> {
        let archive: Self = serde_json::from_slice(&fs::read(path)?)?;
        if archive.format_version != FORMAT_VERSION {
            return Err(ExportError::UnsupportedVersion(archive.format_version));
        }
        Ok(archive)
    }

    /// Returns the number of operations with each outcome.
    #[must_use = "Has no effect if the result is unused"]
    pub fn outcome_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for outcome in [Outcome::Pending, Outcome::Succeeded, Outcome::Failed] {
            let count = self.operations.iter().filter(|op| op.outcome == outcome).count();
            counts.insert(outcome.as_str(), count);
        }
        counts
    }
}

/// Reads the last lines of the log file in a data directory. A missing or unreadable log is an empty tail.
#[must_use = "Has no effect if the result is unused"]
pub fn read_log_tail(data_dir: &Path) -> Vec<String> {
    let Ok(content) = fs::read(data_dir.join(LOG_DIR).join(LOG_FILE)) else {
        return Vec::new();
    };
    let content = String::from_utf8_lossy(&content);
    let lines: Vec<&str> = content.lines().collect();
    lines[lines.len().saturating_sub(LOG_TAIL_LINES)..]
        .iter()
        .map(ToString::to_string)
        .collect()
}
