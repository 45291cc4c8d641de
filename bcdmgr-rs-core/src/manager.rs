// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Provides [`BootManager`], a struct which ties the stores and the collaborators together.
//!
//! A frontend opens a [`BootManager`] once per launch, calls [`BootManager::observe_boot`] to correlate any boot that
//! happened since the last launch, then performs whatever the user asked for through
//! [`BootManager::record_and_execute`].

use std::{path::Path, rc::Rc};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::{
    BootResult,
    backup::{Backup, BackupError, BackupKind, BackupStore, BcdBackupStore},
    config::AppConfig,
    correlate::{CorrelationInput, collection_window, correlate, superseded},
    error::BootError,
    export::{DiagnosticsArchive, read_log_tail},
    journal::{JOURNAL_FILE, JournalError, Operation, OperationJournal, OperationKind, Outcome, RawResult},
    listing::{self, Listing},
    retention::journal_cutoff,
    session::{BootSession, detect_new_boot},
    store::SessionStore,
    system::{
        clock::{BootClock, SystemBootClock},
        command::{CommandError, CommandOutput, CommandRunner, ProcessRunner},
        events::{BootEvent, EventSource, WevtutilEvents},
        fs::DirLock,
    },
};

/// The largest boot menu timeout that `bcdedit` accepts.
pub const MAX_TIMEOUT: u32 = 999;

/// The collaborators that reach outside of the process.
pub struct Collaborators {
    /// Runs `bcdedit`, and anything else that needs running.
    pub runner: Rc<dyn CommandRunner>,

    /// Reads the time and the boot time.
    pub clock: Box<dyn BootClock>,

    /// Supplies boot events.
    pub events: Box<dyn EventSource>,
}

impl Collaborators {
    /// Constructs the collaborators for a real Windows system.
    #[must_use = "Has no effect if the result is unused"]
    pub fn system(config: &AppConfig) -> Self {
        let runner: Rc<dyn CommandRunner> = Rc::new(ProcessRunner);
        let events = WevtutilEvents::new(
            runner.clone(),
            config.wevtutil.clone(),
            config.event_timeout,
            config.max_events,
        );
        Self {
            runner,
            clock: Box::new(SystemBootClock),
            events: Box::new(events),
        }
    }
}

/// A user action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Boot an entry on the next boot only.
    BootOnce(String),

    /// Make an entry the default.
    SetDefault(String),

    /// Change the boot menu timeout, in seconds.
    SetTimeout(u32),

    /// Take a backup with a label.
    Backup(String),

    /// Restore a backup by its id.
    Restore(String),
}

impl Action {
    /// Returns the kind of operation that records this action.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::BootOnce(_) => OperationKind::BootOnce,
            Self::SetDefault(_) => OperationKind::SetDefault,
            Self::SetTimeout(_) => OperationKind::SetTimeout,
            Self::Backup(_) => OperationKind::Backup,
            Self::Restore(_) => OperationKind::Restore,
        }
    }

    /// Returns the target that is recorded for this action.
    #[must_use = "Has no effect if the result is unused"]
    pub fn target(&self) -> String {
        match self {
            Self::BootOnce(target) | Self::SetDefault(target) | Self::Backup(target) | Self::Restore(target) => {
                target.clone()
            }
            Self::SetTimeout(secs) => secs.to_string(),
        }
    }

    /// Returns `true` if the action changes the boot configuration.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn is_mutating(&self) -> bool {
        !matches!(self, Self::Backup(_))
    }
}

/// The result of a user action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationResult {
    /// The operation, as it was completed.
    pub operation: Operation,

    /// The automatic backup taken before the action, or the backup that the action took.
    pub backup: Option<Backup>,
}

impl OperationResult {
    /// Returns `true` if the operation succeeded.
    #[must_use = "Has no effect if the result is unused"]
    pub fn succeeded(&self) -> bool {
        self.operation.outcome == Outcome::Succeeded
    }
}

/// What [`BootManager::observe_boot`] found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observation {
    /// The session that was created for a new boot.
    pub new_session: Option<String>,

    /// The sessions that were correlated.
    pub correlated: Vec<BootSession>,

    /// The number of operations that were pruned from the journal.
    pub pruned: usize,
}

/// The boot manager, along with its durable history.
pub struct BootManager {
    /// The configuration of the application.
    config: AppConfig,

    /// Runs `bcdedit`.
    runner: Rc<dyn CommandRunner>,

    /// Reads the time and the boot time.
    clock: Box<dyn BootClock>,

    /// Supplies boot events.
    events: Box<dyn EventSource>,

    /// Takes and restores backups.
    backups: Box<dyn BackupStore>,

    /// The operation journal.
    journal: OperationJournal,

    /// The boot session store.
    sessions: SessionStore,

    /// Keeps other instances out of the data directory.
    _lock: DirLock,
}

impl BootManager {
    /// Opens the boot manager over a real Windows system.
    ///
    /// # Errors
    ///
    /// May return an `Error` if another instance owns the data directory, or any of the stores could not be opened.
    pub fn open(config: AppConfig) -> BootResult<Self> {
        let collaborators = Collaborators::system(&config);
        Self::with_collaborators(config, collaborators)
    }

    /// Opens the boot manager with the given collaborators.
    ///
    /// The data directory is locked before any store in it is opened.
    ///
    /// # Errors
    ///
    /// May return an `Error` if another instance owns the data directory, or any of the stores could not be opened.
    pub fn with_collaborators(config: AppConfig, collaborators: Collaborators) -> BootResult<Self> {
        let lock = DirLock::acquire(&config.data_dir)?;
        let journal = OperationJournal::open(&config.data_dir.join(JOURNAL_FILE))?;
        let sessions = SessionStore::open(&config.data_dir)?;
        let backups = BcdBackupStore::open(
            &config.data_dir,
            collaborators.runner.clone(),
            config.bcdedit.clone(),
            config.command_timeout,
        )?;

        info!("[MANAGER]: Opened data directory {}", config.data_dir.display());
        Ok(Self {
            config,
            runner: collaborators.runner,
            clock: collaborators.clock,
            events: collaborators.events,
            backups: Box::new(backups),
            journal,
            sessions,
            _lock: lock,
        })
    }

    /// Returns the configuration of the application.
    #[must_use = "Has no effect if the result is unused"]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Reads and parses the boot entries.
    ///
    /// The firmware applications are enumerated first, with `/enum firmware`. The store is then enumerated with `/v`,
    /// so that every identifier is a GUID that means the same thing from boot to boot, and the aliases that the plain
    /// listing prints in their place are learned from `/enum`. If the firmware enumeration fails, the listing is that
    /// of the store alone.
    ///
    /// # Errors
    ///
    /// May return an `Error` if `bcdedit` could not be run, failed, or printed a listing that could not be parsed.
    pub fn entries(&self) -> BootResult<Listing> {
        let firmware = self.enumerate(&["/enum", "firmware", "/v"]);

        let mut listing = listing::parse(&self.enumerate(&["/enum", "/v"])?)?;
        match self.enumerate(&["/enum"]) {
            Ok(plain) => match listing::parse(&plain) {
                Ok(plain) => listing.learn_aliases(&plain),
                Err(e) => warn!("[MANAGER]: Plain listing could not be parsed, aliases unknown: {e}"),
            },
            Err(e) => warn!("[MANAGER]: Plain listing unavailable, aliases unknown: {e}"),
        }

        match firmware {
            Ok(raw) => {
                let added = listing.merge_firmware(&raw);
                debug!("[MANAGER]: {added} firmware applications added to the listing");
            }
            Err(e) => debug!("[MANAGER]: Firmware enumeration unavailable, using /enum alone: {e}"),
        }
        Ok(listing)
    }

    /// Returns the boot menu timeout, if the listing has one.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the boot entries could not be read.
    pub fn timeout(&self) -> BootResult<Option<u32>> {
        Ok(self.entries()?.timeout)
    }

    /// Records and executes a user action.
    ///
    /// The action is validated first, and an entry it names through an alias such as `{current}` is replaced by the
    /// GUID the alias stands for right now. A mutating action then takes an automatic backup, and if that fails, nothing is
    /// recorded and the boot configuration is not touched. Otherwise the operation is begun in the journal, executed,
    /// and completed with its outcome. A command that fails or cannot be run is a failed operation, not an `Error`.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the action is invalid, the backup failed, or the journal could not be written.
    pub fn record_and_execute(&mut self, action: Action) -> BootResult<OperationResult> {
        let (action, restore_from) = self.validate(action)?;

        let backup = if action.is_mutating() {
            let label = format!("before {} {}", action.kind(), action.target());
            match self.backups.snapshot(&label, BackupKind::Automatic, self.clock.now()) {
                Ok(backup) => Some(backup),
                Err(e) => {
                    error!("[MANAGER]: Backup failed, not attempting {}: {e}", action.kind());
                    return Err(BootError::BackupFailed(e));
                }
            }
        } else {
            None
        };

        let id = self
            .journal
            .begin_at(action.kind(), Some(action.target()), self.clock.now())?;

        let (outcome, raw_result, backup) = match action {
            Action::BootOnce(entry) => {
                let (outcome, raw_result) = self.execute(&["/bootsequence", entry.as_str()]);
                (outcome, raw_result, backup)
            }
            Action::SetDefault(entry) => {
                let (outcome, raw_result) = self.execute(&["/default", entry.as_str()]);
                (outcome, raw_result, backup)
            }
            Action::SetTimeout(secs) => {
                let (outcome, raw_result) = self.execute(&["/timeout", secs.to_string().as_str()]);
                (outcome, raw_result, backup)
            }
            Action::Restore(_) => {
                let (outcome, raw_result) = restore_from.map_or_else(
                    || (Outcome::Failed, RawResult::failure("backup disappeared")),
                    |target| self.restore(&target),
                );
                (outcome, raw_result, backup)
            }
            Action::Backup(label) => match self.backups.snapshot(&label, BackupKind::Manual, self.clock.now()) {
                Ok(taken) => {
                    let note = format!("backup {} ({} bytes, sha256 {})", taken.backup_id, taken.size, taken.sha256);
                    (Outcome::Succeeded, RawResult::note(&note), Some(taken))
                }
                Err(e) => {
                    warn!("[MANAGER]: Manual backup failed: {e}");
                    (Outcome::Failed, RawResult::failure(&e.to_string()), None)
                }
            },
        };

        self.journal.complete(id, outcome, raw_result)?;
        let operation = self
            .journal
            .get(id)
            .cloned()
            .ok_or(JournalError::UnknownOperation(id))?;
        Ok(OperationResult { operation, backup })
    }

    /// Observes the current boot, and correlates every session that has not been correlated yet.
    ///
    /// Only the session of the current boot is correlated against the boot entries, since they are read now. A
    /// pending session of an earlier boot was superseded before its entries were read, and is settled as
    /// [`MatchStatus::Unknown`](crate::session::MatchStatus::Unknown) with no actual entry. If the boot entries
    /// cannot be read, the session of the current boot stays pending and is retried on the next launch. Events that
    /// cannot be collected only make diagnoses less specific.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the boot time could not be read, or the stores could not be written.
    pub fn observe_boot(&mut self) -> BootResult<Observation> {
        let mut observation = Observation::default();

        let boot_time = self.clock.boot_time()?;
        if let Some(boot_timestamp) =
            detect_new_boot(self.sessions.last_known_boot(), boot_time, self.config.boot_tolerance)
        {
            let session = self.sessions.create(boot_timestamp)?;
            info!("[MANAGER]: New boot detected at {boot_timestamp}");
            observation.new_session = Some(session.session_id);
        }

        let current = self.sessions.latest().map(|session| session.session_id.clone());
        let pending: Vec<(String, DateTime<Utc>)> = self
            .sessions
            .pending_correlation()
            .map(|session| (session.session_id.clone(), session.boot_timestamp))
            .collect();
        if pending.is_empty() {
            return Ok(observation);
        }

        let operations: Vec<Operation> = self.journal.operations().cloned().collect();
        for (session_id, boot_timestamp) in pending {
            let verdict = if current.as_deref() == Some(session_id.as_str()) {
                let listing = match self.entries() {
                    Ok(listing) => listing,
                    Err(e) => {
                        warn!("[MANAGER]: Boot entries unavailable, leaving {session_id} pending: {e}");
                        continue;
                    }
                };
                let events = self.collect_events(boot_timestamp);
                let verdict = correlate(&CorrelationInput {
                    boot_timestamp,
                    window: self.config.correlation_window,
                    operations: &operations,
                    listing: &listing,
                    events: events.as_deref(),
                });
                self.attach(&session_id, events.as_deref())?;
                verdict
            } else {
                info!("[MANAGER]: {session_id} was superseded by a later boot before it was correlated");
                let events = self.collect_events(boot_timestamp);
                self.attach(&session_id, events.as_deref())?;
                superseded(boot_timestamp, self.config.correlation_window, &operations)
            };

            self.sessions.record_verdict(&session_id, verdict, self.clock.now())?;
            if let Some(session) = self.sessions.get(&session_id) {
                observation.correlated.push(session.clone());
            }
        }

        if let Some(cutoff) = journal_cutoff(self.sessions.list(), self.config.correlation_window) {
            observation.pruned = self.journal.prune(cutoff)?;
        }

        Ok(observation)
    }

    /// Returns the most recent boot session.
    #[must_use = "Has no effect if the result is unused"]
    pub fn latest_session(&self) -> Option<&BootSession> {
        self.sessions.latest()
    }

    /// Returns every retained boot session, most recent first.
    #[must_use = "Has no effect if the result is unused"]
    pub fn list_sessions(&self) -> Vec<&BootSession> {
        self.sessions.list().collect()
    }

    /// Returns the events captured for a session.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the session does not exist, or its events could not be read.
    pub fn session_events(&self, session_id: &str) -> BootResult<Option<Vec<BootEvent>>> {
        Ok(self.sessions.events(session_id)?)
    }

    /// Returns the operations with `since <= timestamp < before`, ascending.
    #[must_use = "Has no effect if the result is unused"]
    pub fn query_operations(&self, since: DateTime<Utc>, before: DateTime<Utc>) -> Vec<Operation> {
        self.journal.query(since, before)
    }

    /// Returns every operation in the journal, ascending.
    #[must_use = "Has no effect if the result is unused"]
    pub fn operations(&self) -> Vec<&Operation> {
        self.journal.operations().collect()
    }

    /// Returns every backup, most recent first.
    #[must_use = "Has no effect if the result is unused"]
    pub fn backups(&self) -> Vec<Backup> {
        self.backups.list()
    }

    /// Deletes a backup.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the backup does not exist, or could not be removed.
    pub fn delete_backup(&mut self, backup_id: &str) -> BootResult<()> {
        Ok(self.backups.delete(backup_id)?)
    }

    /// Writes everything that was recorded into a diagnostics archive.
    ///
    /// This only reads the stores.
    ///
    /// # Errors
    ///
    /// May return an `Error` if captured events could not be read, or the archive could not be written.
    pub fn export_diagnostics(&self, path: &Path) -> BootResult<DiagnosticsArchive> {
        let mut archive = DiagnosticsArchive::new(self.clock.now());
        archive.operations = self.journal.operations().cloned().collect();
        archive.sessions = self.sessions.list().cloned().collect();
        for session in &archive.sessions {
            if let Some(events) = self.sessions.events(&session.session_id)? {
                archive.events.insert(session.session_id.clone(), events);
            }
        }
        archive.backups = self.backups.list();
        archive.log_tail = read_log_tail(&self.config.data_dir);

        archive.write(path)?;
        Ok(archive)
    }

    /// Checks that an action may be attempted, resolving the entry it names.
    ///
    /// Returns the action to record and execute, along with the backup to restore for a restore.
    fn validate(&self, action: Action) -> BootResult<(Action, Option<Backup>)> {
        match action {
            Action::BootOnce(ref entry) | Action::SetDefault(ref entry) => {
                if entry.trim().is_empty() {
                    return Err(BootError::InvalidAction("empty boot entry identifier".to_owned()));
                }
                let listing = self.entries()?;
                let Some(resolved) = listing.resolve(entry.trim()) else {
                    return Err(BootError::InvalidAction(format!("no boot entry {entry}")));
                };
                let resolved = resolved.identifier.clone();
                if !resolved.eq_ignore_ascii_case(entry) {
                    debug!("[MANAGER]: {entry} resolved to {resolved}");
                }
                let action = match action {
                    Action::BootOnce(_) => Action::BootOnce(resolved),
                    _ => Action::SetDefault(resolved),
                };
                Ok((action, None))
            }
            Action::SetTimeout(secs) => {
                if secs > MAX_TIMEOUT {
                    return Err(BootError::InvalidAction(format!(
                        "timeout {secs} is not within 0 to {MAX_TIMEOUT} seconds"
                    )));
                }
                Ok((action, None))
            }
            Action::Backup(_) => Ok((action, None)),
            Action::Restore(ref backup_id) => {
                let backup = self
                    .backups
                    .get(backup_id)
                    .ok_or_else(|| BackupError::UnknownBackup(backup_id.clone()))?;
                self.backups.verify(&backup)?;
                Ok((action, Some(backup)))
            }
        }
    }

    /// Runs a mutating `bcdedit` command, folding any failure into the outcome.
    fn execute(&self, args: &[&str]) -> (Outcome, RawResult) {
        let command = self.command_line(args);
        match self.bcdedit(args) {
            Ok(output) => (outcome_of(&output), RawResult::from_output(command, &output)),
            Err(e) => {
                warn!("[MANAGER]: {e}");
                (Outcome::Failed, RawResult::from_error(command, &e))
            }
        }
    }

    /// Restores a backup, folding any failure into the outcome.
    fn restore(&self, backup: &Backup) -> (Outcome, RawResult) {
        let command = self.command_line(&["/import", backup.store_path.display().to_string().as_str()]);
        match self.backups.restore(backup) {
            Ok(output) => (outcome_of(&output), RawResult::from_output(command, &output)),
            Err(e) => {
                warn!("[MANAGER]: Restore of {} failed: {e}", backup.backup_id);
                (Outcome::Failed, RawResult::failure(&e.to_string()))
            }
        }
    }

    /// Captures the events of a session, before its verdict is recorded.
    fn attach(&mut self, session_id: &str, events: Option<&[BootEvent]>) -> BootResult<()> {
        if let Some(events) = events {
            self.sessions.attach_events(session_id, events)?;
        }
        Ok(())
    }

    /// Collects the events for a boot, or [`None`] if they are unavailable.
    fn collect_events(&self, boot_timestamp: DateTime<Utc>) -> Option<Vec<BootEvent>> {
        let window = collection_window(boot_timestamp, self.config.correlation_window);
        match self.events.collect_boot_events(&window) {
            Ok(mut events) => {
                events.truncate(self.config.max_events);
                Some(events)
            }
            Err(e) => {
                warn!("[MANAGER]: Events unavailable for boot at {boot_timestamp}: {e}");
                None
            }
        }
    }

    /// Runs a `bcdedit` enumeration, returning what it printed.
    fn enumerate(&self, args: &[&str]) -> Result<String, CommandError> {
        Ok(self.bcdedit(args)?.check(&self.config.bcdedit)?.stdout)
    }

    /// Runs `bcdedit` with arguments.
    fn bcdedit(&self, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.runner.run(&self.config.bcdedit, &args, self.config.command_timeout)
    }

    /// Returns the full command line of a `bcdedit` invocation.
    fn command_line(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.config.bcdedit.clone())
            .chain(args.iter().map(ToString::to_string))
            .collect()
    }
}

/// Returns the outcome of a command by its exit code.
fn outcome_of(output: &CommandOutput) -> Outcome {
    if output.is_success() {
        Outcome::Succeeded
    } else {
        Outcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kinds() {
        let linux = "{9f3c1c52-8a1b-11ee-b9d1-0242ac120002}".to_owned();
        assert_eq!(Action::BootOnce(linux.clone()).kind(), OperationKind::BootOnce);
        assert_eq!(Action::SetDefault(linux.clone()).target(), linux);
        assert_eq!(Action::SetTimeout(5).target(), "5");
        assert_eq!(Action::Restore("auto_20250219_212000".to_owned()).kind(), OperationKind::Restore);
    }

    #[test]
    fn test_only_backups_do_not_mutate() {
        assert!(Action::BootOnce(String::new()).is_mutating());
        assert!(Action::SetTimeout(0).is_mutating());
        assert!(Action::Restore(String::new()).is_mutating());
        assert!(!Action::Backup("manual".to_owned()).is_mutating());
    }

    #[test]
    fn test_outcome_of_exit_code() {
        assert_eq!(outcome_of(&CommandOutput::success("")), Outcome::Succeeded);
        assert_eq!(outcome_of(&CommandOutput::failure(1, "denied")), Outcome::Failed);
        assert_eq!(outcome_of(&CommandOutput::default()), Outcome::Failed);
    }
}
