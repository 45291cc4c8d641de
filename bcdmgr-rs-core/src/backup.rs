// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Snapshots of the boot configuration store.
//!
//! Every mutation of the boot configuration is preceded by an automatic backup, and if that backup cannot be taken,
//! the mutation does not happen. Backups are `bcdedit /export` files under `backups/`, described by an index that is
//! rewritten atomically. The SHA-256 digest of each file is recorded when it is taken, and checked before it is
//! restored, so that a damaged or replaced file is never imported.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::system::{
    command::{CommandError, CommandOutput, CommandRunner},
    fs::{FsError, load, read_optional, remove_if_exists, save},
};

/// The name of the directory that holds backups inside of the data directory.
pub const BACKUPS_DIR: &str = "backups";

/// The name of the backup index inside of the backups directory.
const INDEX_FILE: &str = "backups.idx";

/// The extension of an exported boot configuration store.
const BACKUP_EXT: &str = "bcd";

/// An error that may result from taking or restoring a backup.
#[derive(Error, Debug)]
pub enum BackupError {
    /// The export or import command could not be run.
    #[error("Backup command could not be run: {0}")]
    Command(#[from] CommandError),

    /// The export command ran, but did not produce a backup.
    #[error("Export failed with exit code {exit_code:?}: {output}")]
    ExportFailed {
        /// The exit code of the export.
        exit_code: Option<i32>,

        /// What the export printed.
        output: String,
    },

    /// No backup has the given id.
    #[error("Unknown backup {0}")]
    UnknownBackup(String),

    /// The backup file is gone.
    #[error("Backup file \"{}\" is missing", .0.display())]
    Missing(PathBuf),

    /// The backup file is not the file that was exported.
    #[error("Backup {0} does not match its recorded digest")]
    DigestMismatch(String),

    /// The backup store could not be read or written.
    #[error("Backup store IO error: {0}")]
    Fs(#[from] FsError),
}

impl From<std::io::Error> for BackupError {
    fn from(e: std::io::Error) -> Self {
        Self::Fs(FsError::Io(e))
    }
}

/// Why a backup was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupKind {
    /// Taken automatically before a mutation.
    Automatic,

    /// Asked for by the user.
    Manual,
}

impl BackupKind {
    /// Returns the prefix of the ids of this kind of backup.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Automatic => "auto",
            Self::Manual => "manual",
        }
    }
}

/// A snapshot of the boot configuration store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    /// The unique identifier.
    pub backup_id: String,

    /// When the backup was taken.
    pub created_at: DateTime<Utc>,

    /// A description of the backup.
    pub label: String,

    /// Why the backup was taken.
    pub kind: BackupKind,

    /// Where the exported store is.
    pub store_path: PathBuf,

    /// The hex encoded SHA-256 digest of the exported store.
    pub sha256: String,

    /// The size of the exported store in bytes.
    pub size: u64,
}

impl fmt::Display for Backup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {} bytes): {}",
            self.backup_id,
            self.created_at.format("%Y-%m-%d %H:%M:%S"),
            self.size,
            self.label
        )
    }
}

/// A store of boot configuration snapshots.
pub trait BackupStore {
    /// Takes a backup of the current boot configuration.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the backup could not be taken. Nothing is kept of a backup that failed.
    fn snapshot(&mut self, label: &str, kind: BackupKind, at: DateTime<Utc>) -> Result<Backup, BackupError>;

    /// Checks that a backup can be restored.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the backup file is missing or damaged.
    fn verify(&self, backup: &Backup) -> Result<(), BackupError>;

    /// Restores a backup over the current boot configuration, returning the output of the import.
    ///
    /// The backup is verified first, and if that fails the boot configuration is not touched.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the backup could not be verified, or the import could not be run.
    fn restore(&self, backup: &Backup) -> Result<CommandOutput, BackupError>;

    /// Returns every backup, most recent first.
    fn list(&self) -> Vec<Backup>;

    /// Deletes a backup.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the backup does not exist, or could not be removed.
    fn delete(&mut self, backup_id: &str) -> Result<(), BackupError>;

    /// Returns a backup by its id.
    fn get(&self, backup_id: &str) -> Option<Backup> {
        self.list().into_iter().find(|backup| backup.backup_id == backup_id)
    }
}

/// A [`BackupStore`] that uses `bcdedit /export` and `bcdedit /import`.
pub struct BcdBackupStore {
    /// The backups directory.
    dir: PathBuf,

    /// The runner that will run `bcdedit`.
    runner: Rc<dyn CommandRunner>,

    /// The `bcdedit` program.
    program: String,

    /// How long an export or import may take.
    timeout: Duration,

    /// The backups, ascending by creation time.
    backups: Vec<Backup>,
}

impl BcdBackupStore {
    /// Opens the backup store in a data directory, creating it if it does not exist.
    ///
    /// Exported files that are not in the index were left behind by an interrupted backup, and are deleted.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the index could not be read.
    pub fn open(
        data_dir: &Path,
        runner: Rc<dyn CommandRunner>,
        program: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackupError> {
        let dir = data_dir.join(BACKUPS_DIR);
        fs::create_dir_all(&dir)?;
        let backups: Vec<Backup> = load(&dir.join(INDEX_FILE))?.unwrap_or_default();

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let indexed = backups
                .iter()
                .any(|backup| backup.store_path.file_name() == path.file_name());
            if path.extension().is_some_and(|ext| ext == BACKUP_EXT) && !indexed {
                warn!("[BACKUP]: Removing unindexed backup {}", path.display());
                remove_if_exists(&path)?;
            }
        }

        Ok(Self {
            dir,
            runner,
            program: program.into(),
            timeout,
            backups,
        })
    }

    /// Returns an id for a new backup that does not clash with an existing one.
    fn unique_id(&self, kind: BackupKind, at: DateTime<Utc>) -> String {
        let base = format!("{}_{}", kind.prefix(), at.format("%Y%m%d_%H%M%S"));
        let taken = |id: &str| {
            self.backups.iter().any(|backup| backup.backup_id == id) || self.path_of(id).exists()
        };
        if !taken(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{base}_{n}"))
            .find(|id| !taken(id))
            .unwrap_or_else(|| base.clone())
    }

    /// Returns the path of the exported store of a backup.
    fn path_of(&self, backup_id: &str) -> PathBuf {
        self.dir.join(backup_id).with_extension(BACKUP_EXT)
    }

    /// Writes the index with a new list of backups, then makes it current.
    fn commit(&mut self, backups: Vec<Backup>) -> Result<(), BackupError> {
        save(&self.dir.join(INDEX_FILE), &backups)?;
        self.backups = backups;
        Ok(())
    }
}

impl BackupStore for BcdBackupStore {
    fn snapshot(&mut self, label: &str, kind: BackupKind, at: DateTime<Utc>) -> Result<Backup, BackupError> {
        let backup_id = self.unique_id(kind, at);
        let store_path = self.path_of(&backup_id);
        let args = vec!["/export".to_owned(), store_path.display().to_string()];

        let content = match self.runner.run(&self.program, &args, self.timeout) {
            Ok(output) if output.is_success() => read_optional(&store_path)?,
            Ok(output) => {
                remove_if_exists(&store_path)?;
                return Err(BackupError::ExportFailed {
                    exit_code: output.exit_code,
                    output: format!("{}{}", output.stdout, output.stderr).trim().to_owned(),
                });
            }
            Err(e) => {
                remove_if_exists(&store_path)?;
                return Err(e.into());
            }
        };
        let Some(content) = content.filter(|content| !content.is_empty()) else {
            remove_if_exists(&store_path)?;
            return Err(BackupError::ExportFailed {
                exit_code: Some(0),
                output: "export produced no file".to_owned(),
            });
        };

        let backup = Backup {
            backup_id,
            created_at: at,
            label: label.to_owned(),
            kind,
            store_path,
            sha256: hex_digest(&content),
            size: content.len() as u64,
        };

        let mut backups = self.backups.clone();
        backups.push(backup.clone());
        if let Err(e) = self.commit(backups) {
            remove_if_exists(&backup.store_path)?;
            return Err(e);
        }

        info!("[BACKUP]: Took backup {}", backup.backup_id);
        Ok(backup)
    }

    fn verify(&self, backup: &Backup) -> Result<(), BackupError> {
        let content =
            read_optional(&backup.store_path)?.ok_or_else(|| BackupError::Missing(backup.store_path.clone()))?;
        if hex_digest(&content) == backup.sha256 {
            Ok(())
        } else {
            Err(BackupError::DigestMismatch(backup.backup_id.clone()))
        }
    }

    fn restore(&self, backup: &Backup) -> Result<CommandOutput, BackupError> {
        self.verify(backup)?;
        let args = vec!["/import".to_owned(), backup.store_path.display().to_string()];
        let output = self.runner.run(&self.program, &args, self.timeout)?;
        info!("[BACKUP]: Imported backup {} with exit code {:?}", backup.backup_id, output.exit_code);
        Ok(output)
    }

    fn list(&self) -> Vec<Backup> {
        self.backups.iter().rev().cloned().collect()
    }

    fn delete(&mut self, backup_id: &str) -> Result<(), BackupError> {
        let Some(backup) = self.get(backup_id) else {
            return Err(BackupError::UnknownBackup(backup_id.to_owned()));
        };

        let backups = self
            .backups
            .iter()
            .filter(|existing| existing.backup_id != backup_id)
            .cloned()
            .collect();
        self.commit(backups)?;
        remove_if_exists(&backup.store_path)?;

        info!("[BACKUP]: Deleted backup {backup_id}");
        Ok(())
    }
}

/// Returns the hex encoded SHA-256 digest of some bytes.
fn hex_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
