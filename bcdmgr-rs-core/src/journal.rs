// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! The durable, append-only journal of user operations.
//!
//! Every mutating action is recorded here before it is executed, and its outcome is recorded after. The two halves
//! happen in the same process, but the reboot that the action is about happens after that process exits, so the
//! journal is what a later launch reads to find out what was asked for.
//!
//! # Format
//!
//! The journal file is a sequence of [`postcard`] encoded records, each COBS framed and terminated with a `0x00` byte.
//! Since a COBS frame never contains `0x00` except at its end, a crash in the middle of an append leaves a final frame
//! without a terminator, which is detected and truncated the next time the journal is opened. Any frame before that
//! which fails to decode means the file was damaged some other way, and opening fails rather than guessing.
//!
//! Every append is synced to disk before the call that made it returns. Pruning rewrites the whole file through
//! [`write_atomic`].

use std::{
    collections::BTreeMap,
    fmt,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::system::{
    command::{CommandError, CommandOutput},
    fs::{FsError, read_optional, write_atomic},
};

/// The name of the journal file inside of the data directory.
pub const JOURNAL_FILE: &str = "operations.journal";

/// The most characters of each output stream that are kept in a [`RawResult`].
pub const MAX_OUTPUT_CHARS: usize = 500;

/// The byte that terminates every frame.
const FRAME_END: u8 = 0x00;

/// An error that may result from using the journal.
#[derive(Error, Debug)]
pub enum JournalError {
    /// An operation was completed that was never begun.
    #[error("Unknown operation {0}")]
    UnknownOperation(OperationId),

    /// An operation was completed twice.
    #[error("Operation {0} is already {1}")]
    AlreadyTerminal(OperationId, Outcome),

    /// An operation was completed with an outcome that is not terminal.
    #[error("Operation {0} cannot be completed as PENDING")]
    NotTerminal(OperationId),

    /// A frame before the end of the journal could not be decoded.
    #[error("Journal is corrupt at frame {frame}: {reason}")]
    Corrupt {
        /// The index of the offending frame.
        frame: usize,

        /// What was wrong with the frame.
        reason: String,
    },

    /// The journal already exists, so it cannot be imported into.
    #[error("Journal \"{}\" already exists", .0.display())]
    AlreadyExists(PathBuf),

    /// The journal file could not be read or written.
    #[error("Journal IO error: {0}")]
    Fs(#[from] FsError),
}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        Self::Fs(FsError::Io(e))
    }
}

impl From<postcard::Error> for JournalError {
    fn from(e: postcard::Error) -> Self {
        Self::Fs(FsError::Codec(e))
    }
}

/// The kind of a user operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// A one-time override of the next boot's entry.
    BootOnce,

    /// A change to the persistent default entry.
    SetDefault,

    /// A change to the boot menu timeout.
    SetTimeout,

    /// A backup of the boot configuration.
    Backup,

    /// A restore of the boot configuration from a backup.
    Restore,
}

impl OperationKind {
    /// Returns the name of the kind, as it appears in exports.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BootOnce => "BOOT_ONCE",
            Self::SetDefault => "SET_DEFAULT",
            Self::SetTimeout => "SET_TIMEOUT",
            Self::Backup => "BACKUP",
            Self::Restore => "RESTORE",
        }
    }

    /// Returns `true` if the operation decides which entry the next boot will use.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn selects_entry(self) -> bool {
        matches!(self, Self::BootOnce | Self::SetDefault)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// The operation was begun, but its outcome was never recorded.
    Pending,

    /// The operation completed.
    Succeeded,

    /// The operation did not complete.
    Failed,
}

impl Outcome {
    /// Returns the name of the outcome, as it appears in exports.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Returns `true` if no further transition is possible.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unique identifier of an operation.
///
/// Ids order by the time an operation was begun, then by a sequence number that never repeats within a journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId {
    /// Milliseconds since the Unix epoch.
    millis: i64,

    /// The sequence number.
    seq: u64,
}

impl OperationId {
    /// Constructs an [`OperationId`] from its parts.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn new(millis: i64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Returns the sequence number of the id.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn seq(self) -> u64 {
        self.seq
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}-{}", self.millis, self.seq)
    }
}

/// What a command printed and returned, kept so that a failure can be explained later.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResult {
    /// The command line that was run. Empty if the operation did not run a command.
    pub command: Vec<String>,

    /// The exit code, if the command exited.
    pub exit_code: Option<i32>,

    /// The start of what the command printed to stdout.
    pub stdout: String,

    /// The start of what the command printed to stderr.
    pub stderr: String,

    /// Why the command could not be run, if it could not.
    pub error: Option<String>,
}

impl RawResult {
    /// Constructs a [`RawResult`] from the output of a command.
    #[must_use = "Has no effect if the result is unused"]
    pub fn from_output(command: Vec<String>, output: &CommandOutput) -> Self {
        Self {
            command,
            exit_code: output.exit_code,
            stdout: truncate_chars(&output.stdout),
            stderr: truncate_chars(&output.stderr),
            error: None,
        }
    }

    /// Constructs a [`RawResult`] for a command that could not be run.
    #[must_use = "Has no effect if the result is unused"]
    pub fn from_error(command: Vec<String>, error: &CommandError) -> Self {
        Self {
            command,
            error: Some(truncate_chars(&error.to_string())),
            ..Self::default()
        }
    }

    /// Constructs a [`RawResult`] for an operation that did not run a command.
    #[must_use = "Has no effect if the result is unused"]
    pub fn note(message: &str) -> Self {
        Self {
            stdout: truncate_chars(message),
            ..Self::default()
        }
    }

    /// Constructs a [`RawResult`] for an operation that failed without running a command.
    #[must_use = "Has no effect if the result is unused"]
    pub fn failure(message: &str) -> Self {
        Self {
            error: Some(truncate_chars(message)),
            ..Self::default()
        }
    }

    /// Returns the failure code of the result, if there is one.
    ///
    /// This is a non-zero exit code, a note that the command could not be run, or an HRESULT style error code
    /// (`0x8xxxxxxx`) printed by the command. `bcdedit` is known to print such codes while still exiting with `0`, so
    /// an operation that succeeded may still carry a failure code.
    #[must_use = "Has no effect if the result is unused"]
    pub fn failure_code(&self) -> Option<String> {
        if let Some(code) = self.exit_code
            && code != 0
        {
            return Some(format!("exit code {code}"));
        }
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        find_hresult(&self.stderr).or_else(|| find_hresult(&self.stdout))
    }
}

/// A user operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// The unique identifier.
    pub id: OperationId,

    /// What the operation does.
    pub kind: OperationKind,

    /// The boot entry, backup id, or timeout the operation targets.
    pub target: Option<String>,

    /// When the operation was begun.
    pub timestamp: DateTime<Utc>,

    /// The outcome.
    pub outcome: Outcome,

    /// What the operation's command returned, once it has completed.
    pub raw_result: Option<RawResult>,

    /// When the operation completed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Returns the failure code of the operation's result, if there is one.
    #[must_use = "Has no effect if the result is unused"]
    pub fn failure_code(&self) -> Option<String> {
        self.raw_result.as_ref().and_then(RawResult::failure_code)
    }
}

/// A single frame of the journal file.
#[derive(Debug, Serialize, Deserialize)]
enum Record {
    /// Keeps ids from being reused after the operations that held them are pruned.
    Watermark {
        /// The next sequence number to hand out.
        next_seq: u64,

        /// The latest timestamp that was handed out.
        last_millis: i64,
    },

    /// An operation as of the time it was written. This is either a newly begun operation, or a compacted one.
    Entry(Operation),

    /// The terminal transition of an operation.
    Completion {
        /// The completed operation.
        id: OperationId,

        /// The terminal outcome.
        outcome: Outcome,

        /// What the operation's command returned.
        raw_result: RawResult,

        /// When the operation completed.
        completed_at: DateTime<Utc>,
    },
}

/// The durable journal of user operations.
#[derive(Debug)]
pub struct OperationJournal {
    /// The path of the journal file.
    path: PathBuf,

    /// The journal file, opened for appending.
    file: File,

    /// Every operation in the journal, by id.
    operations: BTreeMap<OperationId, Operation>,

    /// The next sequence number to hand out.
    next_seq: u64,

    /// The latest timestamp that was handed out.
    last_millis: i64,
}

impl OperationJournal {
    /// Opens the journal at a path, creating it if it does not exist.
    ///
    /// A torn final frame left behind by a crash is truncated.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the file could not be read, or is corrupt before its final frame.
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let content = read_optional(path)?.unwrap_or_default();

        let mut journal = Self {
            path: path.to_path_buf(),
            file: OpenOptions::new().create(true).append(true).open(path)?,
            operations: BTreeMap::new(),
            next_seq: 0,
            last_millis: i64::MIN,
        };

        let total_len = content.len();
        let valid_len = journal.replay(content)?;
        if valid_len < total_len {
            warn!(
                "[JOURNAL]: Truncating {} bytes of torn frame from {}",
                total_len - valid_len,
                path.display()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        debug!(
            "[JOURNAL]: Opened {} with {} operations",
            path.display(),
            journal.operations.len()
        );
        Ok(journal)
    }

    /// Builds a new journal at a path from operations, such as those of an exported archive.
    ///
    /// # Errors
    ///
    /// May return an `Error` if a journal already exists at the path, or if it could not be written.
    pub fn import(path: &Path, operations: &[Operation]) -> Result<Self, JournalError> {
        if path.exists() {
            return Err(JournalError::AlreadyExists(path.to_path_buf()));
        }

        let next_seq = operations
            .iter()
            .map(|op| op.id.seq.saturating_add(1))
            .max()
            .unwrap_or(0);
        let last_millis = operations.iter().map(|op| op.id.millis).max().unwrap_or(i64::MIN);
        write_atomic(path, &encode_snapshot(next_seq, last_millis, operations.iter())?)?;
        info!("[JOURNAL]: Imported {} operations into {}", operations.len(), path.display());
        Self::open(path)
    }

    /// Begins an operation now. See [`Self::begin_at`].
    ///
    /// # Errors
    ///
    /// May return an `Error` if the operation could not be written to disk.
    pub fn begin(&mut self, kind: OperationKind, target: Option<String>) -> Result<OperationId, JournalError> {
        self.begin_at(kind, target, Utc::now())
    }

    /// Begins an operation at a point in time, recording it as [`Outcome::Pending`].
    ///
    /// The operation is on disk before this returns. Timestamps are clamped so that they never go backwards, so a
    /// clock that steps back cannot reorder the journal.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the operation could not be written to disk.
    pub fn begin_at(
        &mut self,
        kind: OperationKind,
        target: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<OperationId, JournalError> {
        let millis = at.timestamp_millis().max(self.last_millis);
        let id = OperationId::new(millis, self.next_seq);
        let operation = Operation {
            id,
            kind,
            target,
            timestamp: DateTime::from_timestamp_millis(millis).unwrap_or(at),
            outcome: Outcome::Pending,
            raw_result: None,
            completed_at: None,
        };

        self.append(&Record::Entry(operation.clone()))?;
        info!(
            "[JOURNAL]: Began {id} {kind} {}",
            operation.target.as_deref().unwrap_or("-")
        );

        self.next_seq = self.next_seq.saturating_add(1);
        self.last_millis = millis;
        self.operations.insert(id, operation);
        Ok(id)
    }

    /// Completes a pending operation with a terminal outcome.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the operation was never begun, has already completed, if the outcome is
    /// [`Outcome::Pending`], or if the completion could not be written to disk.
    pub fn complete(&mut self, id: OperationId, outcome: Outcome, raw_result: RawResult) -> Result<(), JournalError> {
        let current = self
            .operations
            .get(&id)
            .ok_or(JournalError::UnknownOperation(id))?
            .outcome;
        if current.is_terminal() {
            return Err(JournalError::AlreadyTerminal(id, current));
        }
        if !outcome.is_terminal() {
            return Err(JournalError::NotTerminal(id));
        }

        let completed_at = Utc::now();
        self.append(&Record::Completion {
            id,
            outcome,
            raw_result: raw_result.clone(),
            completed_at,
        })?;

        if let Some(operation) = self.operations.get_mut(&id) {
            operation.outcome = outcome;
            operation.raw_result = Some(raw_result);
            operation.completed_at = Some(completed_at);
        }

        info!("[JOURNAL]: Completed {id} as {outcome}");
        Ok(())
    }

    /// Returns the operations with `since <= timestamp < before`, ascending by timestamp then id.
    #[must_use = "Has no effect if the result is unused"]
    pub fn query(&self, since: DateTime<Utc>, before: DateTime<Utc>) -> Vec<Operation> {
        let mut operations: Vec<_> = self
            .operations
            .values()
            .filter(|op| since <= op.timestamp && op.timestamp < before)
            .cloned()
            .collect();
        operations.sort_by_key(|op| (op.timestamp, op.id));
        operations
    }

    /// Returns an operation by its id.
    #[must_use = "Has no effect if the result is unused"]
    pub fn get(&self, id: OperationId) -> Option<&Operation> {
        self.operations.get(&id)
    }

    /// Returns every operation, ascending by id.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    /// Returns every operation that has not completed.
    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values().filter(|op| op.outcome == Outcome::Pending)
    }

    /// Returns the number of operations in the journal.
    #[must_use = "Has no effect if the result is unused"]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns `true` if the journal has no operations.
    #[must_use = "Has no effect if the result is unused"]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Removes terminal operations that began before a cutoff, then compacts the journal file.
    ///
    /// Pending operations are never removed. Returns the number of operations that were removed.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the compacted journal could not be written.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> Result<usize, JournalError> {
        let doomed: Vec<_> = self
            .operations
            .values()
            .filter(|op| op.outcome.is_terminal() && op.timestamp < cutoff)
            .map(|op| op.id)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let kept = self.operations.values().filter(|op| !doomed.contains(&op.id));
        write_atomic(&self.path, &encode_snapshot(self.next_seq, self.last_millis, kept)?)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        for id in &doomed {
            self.operations.remove(id);
        }

        info!("[JOURNAL]: Pruned {} operations before {cutoff}", doomed.len());
        Ok(doomed.len())
    }

    /// Appends a record to the journal file and syncs it.
    fn append(&mut self, record: &Record) -> Result<(), JournalError> {
        let frame = postcard::to_stdvec_cobs(record)?;
        self.file.write_all(&frame)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Applies every complete frame of the journal, returning the length of the valid prefix.
    fn replay(&mut self, mut content: Vec<u8>) -> Result<usize, JournalError> {
        let mut start = 0;
        let mut frame = 0;

        while let Some(len) = content[start..].iter().position(|b| *b == FRAME_END) {
            let end = start + len + 1;
            if len > 0 {
                let record: Record = postcard::from_bytes_cobs(&mut content[start..end]).map_err(|e| {
                    JournalError::Corrupt {
                        frame,
                        reason: e.to_string(),
                    }
                })?;
                self.apply(record, frame)?;
            }
            start = end;
            frame += 1;
        }

        Ok(start)
    }

    /// Applies a single decoded record to the in-memory state.
    fn apply(&mut self, record: Record, frame: usize) -> Result<(), JournalError> {
        let corrupt = |reason: String| JournalError::Corrupt { frame, reason };

        match record {
            Record::Watermark { next_seq, last_millis } => {
                self.next_seq = self.next_seq.max(next_seq);
                self.last_millis = self.last_millis.max(last_millis);
            }
            Record::Entry(operation) => {
                let id = operation.id;
                if self.operations.contains_key(&id) {
                    return Err(corrupt(format!("duplicate operation {id}")));
                }
                self.next_seq = self.next_seq.max(id.seq.saturating_add(1));
                self.last_millis = self.last_millis.max(id.millis);
                self.operations.insert(id, operation);
            }
            Record::Completion {
                id,
                outcome,
                raw_result,
                completed_at,
            } => {
                let operation = self
                    .operations
                    .get_mut(&id)
                    .ok_or_else(|| corrupt(format!("completion of unknown operation {id}")))?;
                if operation.outcome.is_terminal() || !outcome.is_terminal() {
                    return Err(corrupt(format!("invalid transition of {id} to {outcome}")));
                }
                operation.outcome = outcome;
                operation.raw_result = Some(raw_result);
                operation.completed_at = Some(completed_at);
            }
        }

        Ok(())
    }
}

/// Encodes a complete journal holding a watermark followed by operations.
fn encode_snapshot<'a>(
    next_seq: u64,
    last_millis: i64,
    operations: impl Iterator<Item = &'a Operation>,
) -> Result<Vec<u8>, JournalError> {
    let mut content = postcard::to_stdvec_cobs(&Record::Watermark { next_seq, last_millis })?;
    for operation in operations {
        content.extend(postcard::to_stdvec_cobs(&Record::Entry(operation.clone()))?);
    }
    Ok(content)
}

/// Truncates a string to at most [`MAX_OUTPUT_CHARS`] characters.
fn truncate_chars(text: &str) -> String {
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((idx, _)) => text[..idx].to_owned(),
        None => text.to_owned(),
    }
}

/// Finds the first HRESULT style error code (`0x8` followed by seven hex digits) in some text.
fn find_hresult(text: &str) -> Option<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .find(|word| {
            word.len() == 10
                && (word.starts_with("0x8") || word.starts_with("0X8"))
                && word[2..].chars().all(|c| c.is_ascii_hexdigit())
        })
        .map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::TimeDelta;
    use proptest::prelude::*;

    use super::*;

    /// Returns a fixed point in time, offset by some minutes.
    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_740_000_000, 0).unwrap_or_default() + TimeDelta::minutes(minutes)
    }

    /// Opens a journal inside of a fresh temporary directory.
    fn temp_journal() -> Result<(tempfile::TempDir, OperationJournal), JournalError> {
        let dir = tempfile::tempdir()?;
        let journal = OperationJournal::open(&dir.path().join(JOURNAL_FILE))?;
        Ok((dir, journal))
    }

    #[test]
    fn test_begin_complete_survives_reopen() -> Result<(), JournalError> {
        let (dir, mut journal) = temp_journal()?;
        let id = journal.begin_at(OperationKind::BootOnce, Some("{linux}".to_owned()), at(0))?;
        journal.complete(id, Outcome::Succeeded, RawResult::note("ok"))?;
        let pending = journal.begin_at(OperationKind::SetDefault, Some("{win}".to_owned()), at(1))?;
        drop(journal);

        let journal = OperationJournal::open(&dir.path().join(JOURNAL_FILE))?;
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.get(id).map(|op| op.outcome), Some(Outcome::Succeeded));
        assert_eq!(journal.get(pending).map(|op| op.outcome), Some(Outcome::Pending));
        assert_eq!(journal.pending().count(), 1);
        Ok(())
    }

    #[test]
    fn test_contract_violations() -> Result<(), JournalError> {
        let (_dir, mut journal) = temp_journal()?;
        let id = journal.begin_at(OperationKind::SetTimeout, Some("5".to_owned()), at(0))?;

        assert!(matches!(
            journal.complete(id, Outcome::Pending, RawResult::default()),
            Err(JournalError::NotTerminal(_))
        ));
        journal.complete(id, Outcome::Failed, RawResult::default())?;
        assert!(matches!(
            journal.complete(id, Outcome::Succeeded, RawResult::default()),
            Err(JournalError::AlreadyTerminal(_, Outcome::Failed))
        ));
        assert!(matches!(
            journal.complete(OperationId::new(0, 99), Outcome::Succeeded, RawResult::default()),
            Err(JournalError::UnknownOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_ids_are_ordered_when_clock_steps_back() -> Result<(), JournalError> {
        let (_dir, mut journal) = temp_journal()?;
        let first = journal.begin_at(OperationKind::Backup, None, at(10))?;
        let second = journal.begin_at(OperationKind::Backup, None, at(5))?;
        assert!(first < second);
        assert_eq!(journal.get(first).map(|op| op.timestamp), journal.get(second).map(|op| op.timestamp));
        Ok(())
    }

    #[test]
    fn test_query_is_half_open() -> Result<(), JournalError> {
        let (_dir, mut journal) = temp_journal()?;
        for minute in 0..4 {
            journal.begin_at(OperationKind::BootOnce, None, at(minute))?;
        }
        let ops = journal.query(at(1), at(3));
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].timestamp, at(1));
        assert_eq!(ops[1].timestamp, at(2));
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_truncated() -> Result<(), JournalError> {
        let (dir, mut journal) = temp_journal()?;
        let path = dir.path().join(JOURNAL_FILE);
        journal.begin_at(OperationKind::BootOnce, None, at(0))?;
        drop(journal);

        let intact = fs::read(&path)?;
        let mut torn = intact.clone();
        torn.extend_from_slice(&[0x05, 0x01, 0x02]);
        fs::write(&path, &torn)?;

        let mut journal = OperationJournal::open(&path)?;
        assert_eq!(journal.len(), 1);
        assert_eq!(fs::read(&path)?, intact);

        journal.begin_at(OperationKind::BootOnce, None, at(1))?;
        drop(journal);
        assert_eq!(OperationJournal::open(&path)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_corruption_fails_closed() -> Result<(), JournalError> {
        let (dir, mut journal) = temp_journal()?;
        let path = dir.path().join(JOURNAL_FILE);
        journal.begin_at(OperationKind::BootOnce, None, at(0))?;
        journal.begin_at(OperationKind::BootOnce, None, at(1))?;
        drop(journal);

        let mut content = vec![0x03, 0xff, 0xff, FRAME_END];
        content.extend(fs::read(&path)?);
        fs::write(&path, &content)?;

        assert!(matches!(
            OperationJournal::open(&path),
            Err(JournalError::Corrupt { frame: 0, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_prune_keeps_pending_and_ids() -> Result<(), JournalError> {
        let (dir, mut journal) = temp_journal()?;
        let old = journal.begin_at(OperationKind::SetDefault, None, at(0))?;
        journal.complete(old, Outcome::Succeeded, RawResult::default())?;
        let stuck = journal.begin_at(OperationKind::BootOnce, None, at(1))?;
        let recent = journal.begin_at(OperationKind::SetDefault, None, at(100))?;
        journal.complete(recent, Outcome::Failed, RawResult::default())?;

        assert_eq!(journal.prune(at(50))?, 1);
        assert_eq!(journal.prune(at(50))?, 0);
        assert!(journal.get(old).is_none());
        assert!(journal.get(stuck).is_some());

        let next = journal.begin_at(OperationKind::Backup, None, at(101))?;
        drop(journal);

        let journal = OperationJournal::open(&dir.path().join(JOURNAL_FILE))?;
        assert_eq!(journal.len(), 3);
        assert_eq!(journal.get(recent).map(|op| op.outcome), Some(Outcome::Failed));
        assert!(next.seq() > recent.seq());
        Ok(())
    }

    #[test]
    fn test_import() -> Result<(), JournalError> {
        let (dir, mut journal) = temp_journal()?;
        let id = journal.begin_at(OperationKind::BootOnce, Some("{a}".to_owned()), at(0))?;
        journal.complete(id, Outcome::Succeeded, RawResult::default())?;
        journal.begin_at(OperationKind::Restore, None, at(1))?;
        let source: Vec<_> = journal.operations().cloned().collect();

        let path = dir.path().join("imported.journal");
        let mut imported = OperationJournal::import(&path, &source)?;
        assert_eq!(imported.operations().cloned().collect::<Vec<_>>(), source);
        assert!(imported.begin_at(OperationKind::Backup, None, at(2))?.seq() >= 2);
        assert!(matches!(
            OperationJournal::import(&path, &source),
            Err(JournalError::AlreadyExists(_))
        ));
        Ok(())
    }

    #[test]
    fn test_failure_code() {
        let ok = RawResult::from_output(vec![], &CommandOutput::success("The operation completed successfully."));
        assert_eq!(ok.failure_code(), None);

        let exit = RawResult::from_output(vec![], &CommandOutput::failure(1, "denied"));
        assert_eq!(exit.failure_code().as_deref(), Some("exit code 1"));

        let hresult = RawResult::from_output(
            vec![],
            &CommandOutput::success("An error occurred (0x800700C1) while setting the element data."),
        );
        assert_eq!(hresult.failure_code().as_deref(), Some("0x800700c1"));

        let not_hresult = RawResult::note("timeout 0x0000001e");
        assert_eq!(not_hresult.failure_code(), None);
    }

    #[test]
    fn test_output_is_truncated() {
        let long = "é".repeat(MAX_OUTPUT_CHARS + 20);
        let result = RawResult::from_output(vec![], &CommandOutput::success(long));
        assert_eq!(result.stdout.chars().count(), MAX_OUTPUT_CHARS);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(OperationId::new(1_740_000_000_000, 7).to_string(), "op-1740000000000-7");
    }

    proptest! {
        #[test]
        fn replay_doesnt_panic(x in proptest::collection::vec(any::<u8>(), 0..256)) {
            let dir = tempfile::tempdir().map_err(|e| TestCaseError::fail(e.to_string()))?;
            let path = dir.path().join(JOURNAL_FILE);
            fs::write(&path, &x).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let _ = OperationJournal::open(&path);
        }
    }
}
