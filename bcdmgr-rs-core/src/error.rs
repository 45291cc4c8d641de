// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Provides [`BootError`], which encapsulates other errors

use thiserror::Error;

/// An `Error` resulting from the program.
#[derive(Error, Debug)]
pub enum BootError {
    /// The boot manager listing did not have the expected structure.
    #[error("Malformed Listing Error: {0}")]
    MalformedListing(#[from] crate::listing::ListingError),

    /// A boot manager command could not be executed, or did not complete in time.
    #[error("Command Execution Error: {0}")]
    CommandExecution(#[from] crate::system::command::CommandError),

    /// The operation journal rejected a write or could not be read.
    #[error("Journal Error: {0}")]
    Journal(#[from] crate::journal::JournalError),

    /// The boot session store rejected a write or could not be read.
    #[error("Session Store Error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// A backup could not be taken or restored. A mutation is never attempted after this.
    #[error("Backup Failed: {0}")]
    BackupFailed(#[from] crate::backup::BackupError),

    /// The diagnostics archive could not be written or read.
    #[error("Export Error: {0}")]
    Export(#[from] crate::export::ExportError),

    /// An error occurred while performing filesystem operations.
    #[error("Filesystem Error: {0}")]
    FsError(#[from] crate::system::fs::FsError),

    /// The system boot time could not be obtained.
    #[error("Clock Error: {0}")]
    Clock(#[from] crate::system::clock::ClockError),

    /// The configuration file could not be read.
    #[error("Config Error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A user action was rejected before anything was recorded or changed.
    #[error("Invalid Action: {0}")]
    InvalidAction(String),
}
