// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Boot sessions, and deciding whether a new one has begun.
//!
//! A boot session is created the first time the application runs after a boot. It starts out waiting for
//! correlation, and is correlated exactly once, after which its [`Verdict`] never changes.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::journal::OperationId;

/// Decides whether the system has booted since the last boot that was observed.
///
/// Two readings of the boot time are obtained independently and may jitter, so the current boot time must exceed the
/// last known one by more than `tolerance` to count as a new boot. With no last known boot, any boot is new.
///
/// Returns the boot time of the new boot, if there is one.
#[must_use = "Has no effect if the result is unused"]
pub fn detect_new_boot(
    last_known: Option<DateTime<Utc>>,
    current: DateTime<Utc>,
    tolerance: TimeDelta,
) -> Option<DateTime<Utc>> {
    match last_known {
        Some(last) if current - last <= tolerance => None,
        _ => Some(current),
    }
}

/// Returns the id of the session for a boot, in the form `boot_YYYYmmdd_HHMMSS`.
#[must_use = "Has no effect if the result is unused"]
pub fn session_id(boot_timestamp: DateTime<Utc>) -> String {
    format!("boot_{}", boot_timestamp.format("%Y%m%d_%H%M%S"))
}

/// Whether the observed boot agrees with the operations before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchStatus {
    /// The observed entry is the one that was asked for.
    Match,

    /// The observed entry differs from the one that was asked for.
    Mismatch,

    /// Nothing was asked for, so there is nothing to compare against.
    Unknown,
}

impl MatchStatus {
    /// Returns the name of the status, as it appears in exports.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Match => "MATCH",
            Self::Mismatch => "MISMATCH",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much a [`Diagnosis`] should be trusted.
///
/// Every diagnosis is a heuristic, so even [`Confidence::High`] is advisory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Confidence {
    /// A guess.
    Low,

    /// Backed by circumstantial evidence.
    Medium,

    /// Backed by the operation's own result.
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

/// An advisory explanation for a [`MatchStatus::Mismatch`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Diagnosis {
    /// The operation's result carried a failure code.
    FailedAtApply {
        /// The operation that failed.
        operation: OperationId,

        /// The failure code from its result.
        code: String,
    },

    /// The event log shows that the system went down without a clean shutdown.
    UncleanShutdown {
        /// The event that shows it.
        event_id: u32,

        /// When the event was written.
        at: DateTime<Utc>,
    },

    /// A one-time selection was not honored, most likely by the firmware or by fast startup.
    BootOnceBypassed,

    /// None of the other explanations apply.
    Unexplained,
}

impl Diagnosis {
    /// Returns the advisory text of the diagnosis.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::FailedAtApply { .. } => "operation failed at apply time",
            Self::UncleanShutdown { .. } => "unclean shutdown before boot; one-time selection likely cleared",
            Self::BootOnceBypassed => "firmware or fast-start path may have bypassed the one-time selection",
            Self::Unexplained => "boot entry diverged from the last successful configuration change for unknown reason",
        }
    }

    /// Returns how much the diagnosis should be trusted.
    #[must_use = "Has no effect if the result is unused"]
    pub const fn confidence(&self) -> Confidence {
        match self {
            Self::FailedAtApply { .. } => Confidence::High,
            Self::UncleanShutdown { .. } => Confidence::Medium,
            Self::BootOnceBypassed | Self::Unexplained => Confidence::Low,
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailedAtApply { operation, code } => write!(f, "{} ({operation}: {code})", self.message()),
            Self::UncleanShutdown { event_id, at } => write!(f, "{} (event {event_id} at {at})", self.message()),
            Self::BootOnceBypassed | Self::Unexplained => f.write_str(self.message()),
        }?;
        write!(f, " [{} confidence]", self.confidence())
    }
}

/// The result of correlating a boot session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// The successful operations inside of the correlation window, ascending.
    pub prior_operations: Vec<OperationId>,

    /// The operation that decided the expected entry.
    pub candidate: Option<OperationId>,

    /// The entry that the operations asked for.
    pub expected_entry: Option<String>,

    /// The default entry that was read after the boot.
    pub actual_entry: Option<String>,

    /// Whether the two agree.
    pub match_status: MatchStatus,

    /// An explanation, only for a [`MatchStatus::Mismatch`].
    pub diagnosis: Option<Diagnosis>,
}

/// Where a session is in its lifecycle.
///
/// A session that is evicted is removed from the store, along with everything it owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// The session was created, but has not been correlated.
    PendingCorrelation,

    /// The session has its verdict.
    Correlated,
}

/// One observed boot, and what was concluded about it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSession {
    /// The unique identifier.
    pub session_id: String,

    /// When the system booted.
    pub boot_timestamp: DateTime<Utc>,

    /// Where the session is in its lifecycle.
    pub state: SessionState,

    /// The verdict, once correlated.
    pub verdict: Option<Verdict>,

    /// When the verdict was recorded.
    pub correlated_at: Option<DateTime<Utc>>,
}

impl BootSession {
    /// Constructs a new [`BootSession`] that is waiting for correlation.
    #[must_use = "Has no effect if the result is unused"]
    pub fn new(boot_timestamp: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id(boot_timestamp),
            boot_timestamp,
            state: SessionState::PendingCorrelation,
            verdict: None,
            correlated_at: None,
        }
    }

    /// Returns the match status, if the session has been correlated.
    #[must_use = "Has no effect if the result is unused"]
    pub fn match_status(&self) -> Option<MatchStatus> {
        self.verdict.as_ref().map(|verdict| verdict.match_status)
    }

    /// Returns the diagnosis, if the session has been correlated and has one.
    #[must_use = "Has no effect if the result is unused"]
    pub fn diagnosis(&self) -> Option<&Diagnosis> {
        self.verdict.as_ref().and_then(|verdict| verdict.diagnosis.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Returns a point in time some seconds after a fixed boot.
    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_740_000_000 + secs, 0).unwrap_or_default()
    }

    #[test]
    fn test_first_launch_is_new_boot() {
        assert_eq!(detect_new_boot(None, at(0), TimeDelta::seconds(10)), Some(at(0)));
    }

    #[test]
    fn test_jitter_is_absorbed() {
        let tolerance = TimeDelta::seconds(10);
        assert_eq!(detect_new_boot(Some(at(0)), at(10), tolerance), None);
        assert_eq!(detect_new_boot(Some(at(0)), at(-3), tolerance), None);
        assert_eq!(detect_new_boot(Some(at(0)), at(11), tolerance), Some(at(11)));
    }

    #[test]
    fn test_session_id() {
        assert_eq!(session_id(at(0)), "boot_20250219_212000");
    }

    #[test]
    fn test_new_session_is_pending() {
        let session = BootSession::new(at(0));
        assert_eq!(session.state, SessionState::PendingCorrelation);
        assert_eq!(session.match_status(), None);
        assert_eq!(session.diagnosis(), None);
    }

    #[test]
    fn test_confidence_order() {
        assert!(Diagnosis::BootOnceBypassed.confidence() < Diagnosis::UncleanShutdown { event_id: 41, at: at(0) }.confidence());
        assert_eq!(
            Diagnosis::FailedAtApply {
                operation: OperationId::new(0, 0),
                code: "exit code 1".to_owned()
            }
            .confidence(),
            Confidence::High
        );
    }

    proptest! {
        #[test]
        fn detection_is_deterministic(last in proptest::option::of(-1_000_000i64..1_000_000), current in -1_000_000i64..1_000_000) {
            let tolerance = TimeDelta::seconds(10);
            let first = detect_new_boot(last.map(at), at(current), tolerance);
            prop_assert_eq!(first, detect_new_boot(last.map(at), at(current), tolerance));
            if let Some(last) = last {
                prop_assert_eq!(first.is_some(), current - last > 10);
            }
        }
    }
}
