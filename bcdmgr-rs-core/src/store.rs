// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! The persisted store of recent boot sessions.
//!
//! The sessions and the last known boot time live in a single index file that is rewritten atomically on every
//! change. Events captured for a session live in their own file under `events/`, named after the session.
//!
//! Evicting a session commits the index without it first, and only then deletes its captured events. If the process
//! dies in between, the capture is left without an owner, and is deleted the next time the store is opened. A
//! session is therefore never visible with only part of what it owns.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    retention,
    session::{BootSession, SessionState, Verdict},
    system::{
        events::BootEvent,
        fs::{FsError, load, remove_if_exists, save},
    },
};

/// The name of the session index inside of the data directory.
pub const SESSIONS_FILE: &str = "sessions.idx";

/// The name of the directory that holds captured events.
pub const EVENTS_DIR: &str = "events";

/// The extension of a captured events file.
const EVENTS_EXT: &str = "events";

/// An error that may result from using the session store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No session has the given id.
    #[error("Unknown session {0}")]
    UnknownSession(String),

    /// A session with the same id already exists.
    #[error("Session {0} already exists")]
    DuplicateSession(String),

    /// A verdict was recorded for a session that already has one.
    #[error("Session {0} is already correlated")]
    AlreadyCorrelated(String),

    /// The store could not be read or written.
    #[error("Session store IO error: {0}")]
    Fs(#[from] FsError),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Fs(FsError::Io(e))
    }
}

/// The content of the index file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SessionIndex {
    /// The boot time of the latest boot that was observed.
    last_known_boot: Option<DateTime<Utc>>,

    /// The retained sessions, ascending by boot time.
    sessions: Vec<BootSession>,
}

/// The persisted store of recent boot sessions.
#[derive(Debug)]
pub struct SessionStore {
    /// The data directory.
    dir: PathBuf,

    /// The index as it is on disk.
    index: SessionIndex,
}

impl SessionStore {
    /// Opens the store in a data directory, creating it if it does not exist.
    ///
    /// Captured events that no session owns are deleted.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the index could not be read or decoded.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir.join(EVENTS_DIR))?;
        let index = load(&dir.join(SESSIONS_FILE))?.unwrap_or_default();
        let store = Self {
            dir: dir.to_path_buf(),
            index,
        };
        store.collect_orphans()?;

        debug!("[STORE]: Opened with {} sessions", store.index.sessions.len());
        Ok(store)
    }

    /// Returns the boot time of the latest boot that was observed.
    #[must_use = "Has no effect if the result is unused"]
    pub fn last_known_boot(&self) -> Option<DateTime<Utc>> {
        self.index.last_known_boot
    }

    /// Creates a session for a newly detected boot, evicting the oldest sessions beyond the retention cap.
    ///
    /// # Errors
    ///
    /// May return an `Error` if a session for the same boot exists, or the index could not be written.
    pub fn create(&mut self, boot_timestamp: DateTime<Utc>) -> Result<BootSession, StoreError> {
        let session = BootSession::new(boot_timestamp);
        if self.get(&session.session_id).is_some() {
            return Err(StoreError::DuplicateSession(session.session_id));
        }

        let mut next = self.index.clone();
        let position = next
            .sessions
            .partition_point(|existing| existing.boot_timestamp <= boot_timestamp);
        next.sessions.insert(position, session.clone());
        next.last_known_boot = next.last_known_boot.max(Some(boot_timestamp));
        let evicted = retention::evict(&mut next.sessions);

        self.commit(next)?;
        info!("[STORE]: Created session {}", session.session_id);

        for old in evicted {
            info!("[STORE]: Evicted session {}", old.session_id);
            remove_if_exists(&self.events_path(&old.session_id))?;
        }

        Ok(session)
    }

    /// Records the verdict of a session. This may only happen once per session.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the session does not exist, already has a verdict, or the index could not be written.
    pub fn record_verdict(
        &mut self,
        session_id: &str,
        verdict: Verdict,
        correlated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut next = self.index.clone();
        let session = next
            .sessions
            .iter_mut()
            .find(|session| session.session_id == session_id)
            .ok_or_else(|| StoreError::UnknownSession(session_id.to_owned()))?;
        if session.state == SessionState::Correlated {
            return Err(StoreError::AlreadyCorrelated(session_id.to_owned()));
        }

        info!("[STORE]: Session {session_id} is {}", verdict.match_status);
        session.state = SessionState::Correlated;
        session.verdict = Some(verdict);
        session.correlated_at = Some(correlated_at);
        self.commit(next)
    }

    /// Stores the events captured for a session, replacing any that were stored before.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the session does not exist, or the events could not be written.
    pub fn attach_events(&mut self, session_id: &str, events: &[BootEvent]) -> Result<(), StoreError> {
        if self.get(session_id).is_none() {
            return Err(StoreError::UnknownSession(session_id.to_owned()));
        }
        save(&self.events_path(session_id), &events)?;
        debug!("[STORE]: Attached {} events to {session_id}", events.len());
        Ok(())
    }

    /// Returns the events captured for a session, or [`None`] if none were captured.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the session does not exist, or its events could not be read.
    pub fn events(&self, session_id: &str) -> Result<Option<Vec<BootEvent>>, StoreError> {
        if self.get(session_id).is_none() {
            return Err(StoreError::UnknownSession(session_id.to_owned()));
        }
        Ok(load(&self.events_path(session_id))?)
    }

    /// Returns the most recent session.
    #[must_use = "Has no effect if the result is unused"]
    pub fn latest(&self) -> Option<&BootSession> {
        self.index.sessions.last()
    }

    /// Returns every retained session, most recent first.
    pub fn list(&self) -> impl Iterator<Item = &BootSession> {
        self.index.sessions.iter().rev()
    }

    /// Returns every session that has not been correlated, most recent first.
    pub fn pending_correlation(&self) -> impl Iterator<Item = &BootSession> {
        self.list()
            .filter(|session| session.state == SessionState::PendingCorrelation)
    }

    /// Returns a session by its id.
    #[must_use = "Has no effect if the result is unused"]
    pub fn get(&self, session_id: &str) -> Option<&BootSession> {
        self.index
            .sessions
            .iter()
            .find(|session| session.session_id == session_id)
    }

    /// Writes an index to disk, then makes it current.
    fn commit(&mut self, next: SessionIndex) -> Result<(), StoreError> {
        save(&self.dir.join(SESSIONS_FILE), &next)?;
        self.index = next;
        Ok(())
    }

    /// Returns the path of the captured events of a session.
    fn events_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(EVENTS_DIR)
            .join(session_id)
            .with_extension(EVENTS_EXT)
    }

    /// Deletes every file under `events/` that does not belong to a retained session.
    fn collect_orphans(&self) -> Result<(), StoreError> {
        let owned: HashSet<_> = self
            .index
            .sessions
            .iter()
            .map(|session| self.events_path(&session.session_id))
            .collect();

        for entry in fs::read_dir(self.dir.join(EVENTS_DIR))? {
            let path = entry?.path();
            if path.is_file() && !owned.contains(&path) {
                warn!("[STORE]: Removing orphaned capture {}", path.display());
                remove_if_exists(&path)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::session::MatchStatus;

    /// Returns a point in time some hours after a fixed boot.
    fn at(hours: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_740_000_000, 0).unwrap_or_default() + TimeDelta::hours(hours)
    }

    /// Constructs a verdict with nothing to compare against.
    fn unknown() -> Verdict {
        Verdict {
            prior_operations: Vec::new(),
            candidate: None,
            expected_entry: None,
            actual_entry: Some("{current}".to_owned()),
            match_status: MatchStatus::Unknown,
            diagnosis: None,
        }
    }

    /// Constructs an event.
    fn event(event_id: u32) -> BootEvent {
        BootEvent {
            event_id,
            timestamp: at(0),
            level: "Critical".to_owned(),
            source: "Microsoft-Windows-Kernel-Power".to_owned(),
            message: String::new(),
        }
    }

    #[test]
    fn test_retains_five_most_recent() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let mut store = SessionStore::open(dir.path())?;
        for hour in 0..7 {
            store.create(at(hour))?;
        }

        let boots: Vec<_> = store.list().map(|session| session.boot_timestamp).collect();
        assert_eq!(boots, vec![at(6), at(5), at(4), at(3), at(2)]);
        assert_eq!(store.latest().map(|session| session.boot_timestamp), Some(at(6)));
        assert_eq!(store.last_known_boot(), Some(at(6)));

        let reopened = SessionStore::open(dir.path())?;
        assert_eq!(reopened.list().count(), retention::MAX_SESSIONS);
        assert_eq!(reopened.last_known_boot(), Some(at(6)));
        Ok(())
    }

    #[test]
    fn test_eviction_removes_events() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let mut store = SessionStore::open(dir.path())?;
        let first = store.create(at(0))?;
        store.attach_events(&first.session_id, &[event(41)])?;
        assert!(store.events_path(&first.session_id).exists());

        for hour in 1..=5 {
            store.create(at(hour))?;
        }
        assert!(store.get(&first.session_id).is_none());
        assert!(!store.events_path(&first.session_id).exists());
        Ok(())
    }

    #[test]
    fn test_orphans_are_collected() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let mut store = SessionStore::open(dir.path())?;
        let session = store.create(at(0))?;
        store.attach_events(&session.session_id, &[event(6005)])?;
        let orphan = dir.path().join(EVENTS_DIR).join("boot_19990101_000000.events");
        fs::write(&orphan, b"left behind")?;

        let store = SessionStore::open(dir.path())?;
        assert!(!orphan.exists());
        assert_eq!(store.events(&session.session_id)?, Some(vec![event(6005)]));
        Ok(())
    }

    #[test]
    fn test_verdict_is_recorded_once() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let mut store = SessionStore::open(dir.path())?;
        let session = store.create(at(0))?;
        assert_eq!(store.pending_correlation().count(), 1);

        store.record_verdict(&session.session_id, unknown(), at(1))?;
        assert!(matches!(
            store.record_verdict(&session.session_id, unknown(), at(2)),
            Err(StoreError::AlreadyCorrelated(_))
        ));
        assert_eq!(store.pending_correlation().count(), 0);

        let store = SessionStore::open(dir.path())?;
        let session = store.get(&session.session_id);
        assert_eq!(session.map(|session| session.state), Some(SessionState::Correlated));
        assert_eq!(session.and_then(|session| session.correlated_at), Some(at(1)));
        Ok(())
    }

    #[test]
    fn test_unknown_and_duplicate_sessions() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let mut store = SessionStore::open(dir.path())?;
        store.create(at(0))?;
        assert!(matches!(store.create(at(0)), Err(StoreError::DuplicateSession(_))));
        assert!(matches!(
            store.record_verdict("boot_nope", unknown(), at(1)),
            Err(StoreError::UnknownSession(_))
        ));
        assert!(matches!(store.events("boot_nope"), Err(StoreError::UnknownSession(_))));
        Ok(())
    }
}
