// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Bounds on the state that would otherwise accumulate forever.
//!
//! Only the most recent [`MAX_SESSIONS`] boot sessions are kept. The journal keeps every operation that a retained
//! session could still be correlated against, which is everything inside of the correlation window of the oldest
//! retained session, along with any operation that never completed.

use chrono::{DateTime, TimeDelta, Utc};

use crate::session::BootSession;

/// The most boot sessions that are retained.
pub const MAX_SESSIONS: usize = 5;

/// Removes the oldest sessions beyond [`MAX_SESSIONS`], returning them.
///
/// The sessions must be sorted by ascending boot time. The evicted sessions are returned oldest first.
pub fn evict(sessions: &mut Vec<BootSession>) -> Vec<BootSession> {
    let excess = sessions.len().saturating_sub(MAX_SESSIONS);
    sessions.drain(..excess).collect()
}

/// Returns the time before which terminal operations may be pruned from the journal.
///
/// This is the boot time of the oldest retained session, less the correlation window. With no sessions retained,
/// nothing may be pruned.
#[must_use = "Has no effect if the result is unused"]
pub fn journal_cutoff<'a>(
    sessions: impl IntoIterator<Item = &'a BootSession>,
    window: TimeDelta,
) -> Option<DateTime<Utc>> {
    sessions
        .into_iter()
        .map(|session| session.boot_timestamp)
        .min()
        .and_then(|oldest| oldest.checked_sub_signed(window))
}
