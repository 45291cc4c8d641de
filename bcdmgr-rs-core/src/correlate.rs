// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Matching a boot to the operations that came before it.
//!
//! Correlation is a pure function over a snapshot of the journal, a snapshot of the boot entries read after the boot,
//! and whatever events could be collected. Given the same inputs it always produces the same [`Verdict`].
//!
//! 1. The candidates are the operations that succeeded inside of the correlation window before the boot.
//! 2. The latest candidate that selects an entry (a boot-once or a default change) decides the expected entry. With no
//!    such candidate there is nothing to compare against, and the verdict is [`MatchStatus::Unknown`].
//! 3. The expected entry is compared to the default entry after the boot, through the aliases of the listing. On a
//!    mismatch, the first explanation that applies is taken, in this order: the operation's own result carries a
//!    failure code, the event log shows an unclean shutdown, the operation was a boot-once, or nothing is known.
//!
//! Events only ever refine the explanation, so the verdict is the same whether or not events are available.

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;

use crate::{
    journal::{Operation, OperationKind, Outcome},
    listing::Listing,
    session::{Diagnosis, MatchStatus, Verdict},
    system::events::{BootEvent, EventWindow},
};

/// How long after a boot events may still describe what happened before it.
///
/// Kernel-Power and the event log service record an unclean shutdown during the following boot, not before it.
const EVENT_GRACE_MINUTES: i64 = 10;

/// Everything that correlation reads.
#[derive(Clone, Copy, Debug)]
pub struct CorrelationInput<'a> {
    /// When the system booted.
    pub boot_timestamp: DateTime<Utc>,

    /// How far before the boot an operation may be and still explain it.
    pub window: TimeDelta,

    /// The operations in the journal. These do not have to be sorted, or limited to the window.
    pub operations: &'a [Operation],

    /// The boot entries, as read after the boot.
    pub listing: &'a Listing,

    /// The events that were collected, or [`None`] if events are unavailable.
    pub events: Option<&'a [BootEvent]>,
}

/// Returns the range of time in which operations may explain a boot, `[boot - window, boot)`.
#[must_use = "Has no effect if the result is unused"]
pub fn operation_window(boot_timestamp: DateTime<Utc>, window: TimeDelta) -> EventWindow {
    EventWindow {
        start: boot_timestamp
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
        end: boot_timestamp,
    }
}

/// Returns the range of time in which events are relevant to a candidate operation.
///
/// This starts when the operation began, and ends shortly after the boot.
#[must_use = "Has no effect if the result is unused"]
pub fn event_window(candidate: &Operation, boot_timestamp: DateTime<Utc>) -> EventWindow {
    EventWindow {
        start: candidate.timestamp,
        end: boot_timestamp + TimeDelta::minutes(EVENT_GRACE_MINUTES),
    }
}

/// Returns the range of time in which events should be collected for a boot.
///
/// This covers every candidate operation's event window.
#[must_use = "Has no effect if the result is unused"]
pub fn collection_window(boot_timestamp: DateTime<Utc>, window: TimeDelta) -> EventWindow {
    EventWindow {
        start: operation_window(boot_timestamp, window).start,
        end: boot_timestamp + TimeDelta::minutes(EVENT_GRACE_MINUTES),
    }
}

/// Returns the successful operations inside of the correlation window before a boot, ascending.
fn candidates<'a>(operations: &'a [Operation], boot_timestamp: DateTime<Utc>, window: TimeDelta) -> Vec<&'a Operation> {
    let window = operation_window(boot_timestamp, window);
    let mut candidates: Vec<&Operation> = operations
        .iter()
        .filter(|op| op.outcome == Outcome::Succeeded && window.contains(op.timestamp))
        .collect();
    candidates.sort_by_key(|op| (op.timestamp, op.id));
    candidates
}

/// Returns the latest candidate that selects an entry.
fn deciding<'a>(candidates: &[&'a Operation]) -> Option<&'a Operation> {
    candidates
        .iter()
        .rev()
        .find(|op| op.kind.selects_entry() && op.target.is_some())
        .copied()
}

/// Settles a boot whose listing was never read, because a later boot happened first.
///
/// The operations before it are still recorded, but with no listing from after the boot there is nothing to compare
/// them to, so the verdict is [`MatchStatus::Unknown`] with no actual entry.
#[must_use = "Has no effect if the result is unused"]
pub fn superseded(boot_timestamp: DateTime<Utc>, window: TimeDelta, operations: &[Operation]) -> Verdict {
    let candidates = candidates(operations, boot_timestamp, window);
    let candidate = deciding(&candidates);
    Verdict {
        prior_operations: candidates.iter().map(|op| op.id).collect(),
        candidate: candidate.map(|op| op.id),
        expected_entry: candidate.and_then(|op| op.target.clone()),
        actual_entry: None,
        match_status: MatchStatus::Unknown,
        diagnosis: None,
    }
}

/// Correlates a boot with the operations before it.
#[must_use = "Has no effect if the result is unused"]
pub fn correlate(input: &CorrelationInput<'_>) -> Verdict {
    let candidates = candidates(input.operations, input.boot_timestamp, input.window);
    let prior_operations = candidates.iter().map(|op| op.id).collect();
    let actual_entry = input.listing.current_default.clone();

    let Some(candidate) = deciding(&candidates) else {
        debug!("[CORRELATE]: No entry selection before {}", input.boot_timestamp);
        return Verdict {
            prior_operations,
            candidate: None,
            expected_entry: None,
            actual_entry,
            match_status: MatchStatus::Unknown,
            diagnosis: None,
        };
    };

    let expected_entry = candidate.target.clone();
    let matches = match (&expected_entry, &actual_entry) {
        (Some(expected), Some(actual)) => input.listing.same_entry(expected, actual),
        _ => false,
    };

    let (match_status, diagnosis) = if matches {
        (MatchStatus::Match, None)
    } else {
        (
            MatchStatus::Mismatch,
            Some(diagnose(candidate, input.boot_timestamp, input.events)),
        )
    };

    debug!(
        "[CORRELATE]: Expected {expected_entry:?} after {}, found {actual_entry:?}: {match_status}",
        candidate.id
    );
    Verdict {
        prior_operations,
        candidate: Some(candidate.id),
        expected_entry,
        actual_entry,
        match_status,
        diagnosis,
    }
}

/// Explains why a boot did not use the entry that a candidate operation selected.
fn diagnose(candidate: &Operation, boot_timestamp: DateTime<Utc>, events: Option<&[BootEvent]>) -> Diagnosis {
    if let Some(code) = candidate.failure_code() {
        return Diagnosis::FailedAtApply {
            operation: candidate.id,
            code,
        };
    }

    let window = event_window(candidate, boot_timestamp);
    let unclean = events
        .unwrap_or_default()
        .iter()
        .filter(|event| event.is_unclean_shutdown() && window.contains(event.timestamp))
        .min_by_key(|event| (event.timestamp, event.event_id));
    if let Some(event) = unclean {
        return Diagnosis::UncleanShutdown {
            event_id: event.event_id,
            at: event.timestamp,
        };
    }

    if candidate.kind == OperationKind::BootOnce {
        Diagnosis::BootOnceBypassed
    } else {
        Diagnosis::Unexplained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        journal::{OperationId, RawResult},
        listing::{BootEntry, OsType},
    };

    const LINUX: &str = "{a8c1e2f0-0000-4000-8000-000000000001}";
    const WINDOWS: &str = "{current}";

    /// Returns a point in time some minutes after a fixed boot.
    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_740_000_000, 0).unwrap_or_default() + TimeDelta::minutes(minutes)
    }

    /// Constructs a completed operation.
    fn operation(seq: u64, kind: OperationKind, target: &str, minutes: i64, outcome: Outcome) -> Operation {
        let timestamp = at(minutes);
        Operation {
            id: OperationId::new(timestamp.timestamp_millis(), seq),
            kind,
            target: Some(target.to_owned()),
            timestamp,
            outcome,
            raw_result: Some(RawResult::from_output(
                vec!["bcdedit".to_owned()],
                &crate::system::command::CommandOutput::success("The operation completed successfully."),
            )),
            completed_at: Some(timestamp),
        }
    }

    /// Constructs a listing of Windows and Linux, with one of them as the default.
    fn listing(default: &str) -> Listing {
        let entry = |identifier: &str, description: &str, os_type| BootEntry {
            identifier: identifier.to_owned(),
            description: description.to_owned(),
            os_type,
            is_current_default: identifier == default,
        };
        Listing {
            entries: vec![
                entry(WINDOWS, "Windows 11", OsType::Windows),
                entry(LINUX, "ubuntu", OsType::Linux),
            ],
            current_default: Some(default.to_owned()),
            timeout: Some(30),
            display_order: vec![WINDOWS.to_owned(), LINUX.to_owned()],
            aliases: Vec::new(),
        }
    }

    /// Constructs an event.
    fn event(event_id: u32, minutes: i64) -> BootEvent {
        BootEvent {
            event_id,
            timestamp: at(minutes),
            level: "Critical".to_owned(),
            source: "Microsoft-Windows-Kernel-Power".to_owned(),
            message: String::new(),
        }
    }

    /// Correlates a boot at minute zero with a 72 hour window.
    fn run(operations: &[Operation], listing: &Listing, events: Option<&[BootEvent]>) -> Verdict {
        correlate(&CorrelationInput {
            boot_timestamp: at(0),
            window: TimeDelta::hours(72),
            operations,
            listing,
            events,
        })
    }

    #[test]
    fn test_boot_once_match() {
        let ops = [operation(0, OperationKind::BootOnce, LINUX, -10, Outcome::Succeeded)];
        let verdict = run(&ops, &listing(LINUX), None);
        assert_eq!(verdict.match_status, MatchStatus::Match);
        assert_eq!(verdict.expected_entry.as_deref(), Some(LINUX));
        assert_eq!(verdict.actual_entry.as_deref(), Some(LINUX));
        assert_eq!(verdict.diagnosis, None);
        assert_eq!(verdict.candidate, Some(ops[0].id));
    }

    #[test]
    fn test_unclean_shutdown_mismatch() {
        let ops = [operation(0, OperationKind::BootOnce, LINUX, -10, Outcome::Succeeded)];
        let events = [event(6005, 1), event(41, 1)];
        let verdict = run(&ops, &listing(WINDOWS), Some(&events));
        assert_eq!(verdict.match_status, MatchStatus::Mismatch);
        assert_eq!(
            verdict.diagnosis,
            Some(Diagnosis::UncleanShutdown { event_id: 41, at: at(1) })
        );
    }

    #[test]
    fn test_no_operations_is_unknown() {
        let verdict = run(&[], &listing(WINDOWS), Some(&[]));
        assert_eq!(verdict.match_status, MatchStatus::Unknown);
        assert_eq!(verdict.expected_entry, None);
        assert_eq!(verdict.diagnosis, None);
        assert!(verdict.prior_operations.is_empty());
    }

    #[test]
    fn test_failure_code_wins_regardless_of_events() {
        let mut op = operation(0, OperationKind::SetDefault, LINUX, -30, Outcome::Succeeded);
        op.raw_result = Some(RawResult::from_output(
            vec!["bcdedit".to_owned()],
            &crate::system::command::CommandOutput::success("An error occurred (0x80070005)."),
        ));
        let ops = [op];
        let events = [event(41, -5)];

        for events in [None, Some(&events[..])] {
            let verdict = run(&ops, &listing(WINDOWS), events);
            assert_eq!(verdict.match_status, MatchStatus::Mismatch);
            assert_eq!(
                verdict.diagnosis,
                Some(Diagnosis::FailedAtApply {
                    operation: ops[0].id,
                    code: "0x80070005".to_owned()
                })
            );
        }
    }

    #[test]
    fn test_boot_once_bypass_without_events() {
        let ops = [operation(0, OperationKind::BootOnce, LINUX, -10, Outcome::Succeeded)];
        let verdict = run(&ops, &listing(WINDOWS), None);
        assert_eq!(verdict.diagnosis, Some(Diagnosis::BootOnceBypassed));
    }

    #[test]
    fn test_set_default_unexplained() {
        let ops = [operation(0, OperationKind::SetDefault, LINUX, -10, Outcome::Succeeded)];
        let events = [event(6005, 1)];
        let verdict = run(&ops, &listing(WINDOWS), Some(&events));
        assert_eq!(verdict.diagnosis, Some(Diagnosis::Unexplained));
    }

    #[test]
    fn test_most_recent_selection_wins() {
        let ops = [
            operation(2, OperationKind::SetTimeout, "5", -1, Outcome::Succeeded),
            operation(1, OperationKind::BootOnce, LINUX, -20, Outcome::Succeeded),
            operation(0, OperationKind::SetDefault, WINDOWS, -40, Outcome::Succeeded),
        ];
        let verdict = run(&ops, &listing(LINUX), None);
        assert_eq!(verdict.match_status, MatchStatus::Match);
        assert_eq!(verdict.candidate, Some(ops[1].id));
        assert_eq!(verdict.prior_operations, vec![ops[2].id, ops[1].id, ops[0].id]);
    }

    #[test]
    fn test_window_excludes_stale_failed_and_future() {
        let ops = [
            operation(0, OperationKind::BootOnce, LINUX, -(73 * 60), Outcome::Succeeded),
            operation(1, OperationKind::BootOnce, LINUX, -5, Outcome::Failed),
            operation(2, OperationKind::BootOnce, LINUX, -4, Outcome::Pending),
            operation(3, OperationKind::BootOnce, LINUX, 5, Outcome::Succeeded),
        ];
        let verdict = run(&ops, &listing(WINDOWS), None);
        assert_eq!(verdict.match_status, MatchStatus::Unknown);
        assert!(verdict.prior_operations.is_empty());
    }

    #[test]
    fn test_events_outside_window_are_ignored() {
        let ops = [operation(0, OperationKind::BootOnce, LINUX, -10, Outcome::Succeeded)];
        let events = [event(41, -30), event(6008, 11)];
        let verdict = run(&ops, &listing(WINDOWS), Some(&events));
        assert_eq!(verdict.diagnosis, Some(Diagnosis::BootOnceBypassed));
    }

    #[test]
    fn test_identifiers_compare_case_insensitively() {
        let ops = [operation(0, OperationKind::SetDefault, &LINUX.to_uppercase(), -10, Outcome::Succeeded)];
        assert_eq!(run(&ops, &listing(LINUX), None).match_status, MatchStatus::Match);
    }

    #[test]
    fn test_default_listed_under_its_alias() {
        let ops = [operation(0, OperationKind::SetDefault, LINUX, -10, Outcome::Succeeded)];
        let mut aliased = listing("{default}");
        aliased.entries[1].identifier = "{default}".to_owned();
        aliased.entries[1].is_current_default = true;
        aliased.aliases.push((LINUX.to_owned(), "{default}".to_owned()));

        let verdict = run(&ops, &aliased, None);
        assert_eq!(verdict.match_status, MatchStatus::Match);
        assert_eq!(verdict.diagnosis, None);

        aliased.aliases.clear();
        assert_eq!(run(&ops, &aliased, None).match_status, MatchStatus::Mismatch);
    }

    #[test]
    fn test_superseded_boot_is_unknown() {
        let ops = [
            operation(0, OperationKind::SetDefault, LINUX, -10, Outcome::Succeeded),
            operation(1, OperationKind::SetTimeout, "5", -5, Outcome::Succeeded),
        ];
        let verdict = superseded(at(0), TimeDelta::hours(72), &ops);
        assert_eq!(verdict.match_status, MatchStatus::Unknown);
        assert_eq!(verdict.expected_entry.as_deref(), Some(LINUX));
        assert_eq!(verdict.actual_entry, None);
        assert_eq!(verdict.diagnosis, None);
        assert_eq!(verdict.candidate, Some(ops[0].id));
        assert_eq!(verdict.prior_operations, vec![ops[0].id, ops[1].id]);
    }

    #[test]
    fn test_idempotent() {
        let ops = [
            operation(0, OperationKind::SetDefault, WINDOWS, -50, Outcome::Succeeded),
            operation(1, OperationKind::BootOnce, LINUX, -10, Outcome::Succeeded),
        ];
        let events = [event(41, 1), event(6008, 1)];
        let listing = listing(WINDOWS);
        let first = run(&ops, &listing, Some(&events));
        let second = run(&ops, &listing, Some(&events));
        assert_eq!(first, second);
    }
}
