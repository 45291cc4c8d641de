// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Best-effort access to boot-relevant entries of the Windows event logs.
//!
//! Events only ever add context to a diagnosis. Whatever goes wrong here is reported as an [`EventError`] for the
//! caller to log, and the caller carries on as though no events were available.
//!
//! Every query is bounded by the window it is asked about, so that `wevtutil` never has to read further back than the
//! boot in question. Besides the boot events of the System log, the errors that `Kernel-Boot` writes and the errors of
//! the Application log are read if they can be, and are only ever extra context.

use std::{rc::Rc, time::Duration};

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::system::command::{CommandError, CommandRunner};

/// The event IDs that are relevant to a boot.
///
/// Kernel-General start (12) and end (13), boot configuration (27), Kernel-Power (41), `BugCheck` (1001), the event
/// log service starting (6005) and stopping (6006), an unexpected previous shutdown (6008), and the system boot
/// banner (6009).
pub const BOOT_EVENT_IDS: [u32; 9] = [12, 13, 27, 41, 1001, 6005, 6006, 6008, 6009];

/// The event IDs that signal that the previous shutdown was not clean.
pub const UNCLEAN_SHUTDOWN_IDS: [u32; 3] = [41, 6008, 1001];

/// The providers that write the boot-relevant events of the System log, along with the IDs they write.
pub const BOOT_EVENT_PROVIDERS: [(&str, &[u32]); 5] = [
    ("Microsoft-Windows-Kernel-General", &[12, 13]),
    ("Microsoft-Windows-Kernel-Boot", &[27]),
    ("Microsoft-Windows-Kernel-Power", &[41]),
    ("Microsoft-Windows-WER-SystemErrorReporting", &[1001]),
    ("EventLog", &[6005, 6006, 6008, 6009]),
];

/// The provider whose errors describe a boot that went wrong.
const KERNEL_BOOT: &str = "Microsoft-Windows-Kernel-Boot";

/// The `Level` of an error.
const LEVEL_ERROR: u8 = 2;

/// The `Level` of a critical event.
const LEVEL_CRITICAL: u8 = 1;

/// The formats that the `Date` field of an event may take, if not RFC 3339.
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%m/%d/%Y %I:%M:%S %p", "%Y-%m-%d %H:%M:%S"];

/// An error that may result from collecting events.
#[derive(Error, Debug)]
pub enum EventError {
    /// The event log query could not be run.
    #[error("Event query could not be run: {0}")]
    Command(#[from] CommandError),

    /// The event log query ran, but reported failure.
    #[error("Event query failed with exit code {exit_code:?}: {stderr}")]
    QueryFailed {
        /// The exit code of the query.
        exit_code: Option<i32>,

        /// What the query printed to stderr.
        stderr: String,
    },
}

/// A single event from the event log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootEvent {
    /// The event ID.
    pub event_id: u32,

    /// When the event was written.
    pub timestamp: DateTime<Utc>,

    /// The level, such as `Critical` or `Information`.
    pub level: String,

    /// The provider that wrote the event.
    pub source: String,

    /// The description of the event.
    pub message: String,
}

impl BootEvent {
    /// Returns `true` if this event signals that the previous shutdown was not clean.
    #[must_use = "Has no effect if the result is unused"]
    ///
    /// The ID alone is not enough, since other providers reuse the same IDs in the Application log.
    pub fn is_unclean_shutdown(&self) -> bool {
        UNCLEAN_SHUTDOWN_IDS.contains(&self.event_id)
            && BOOT_EVENT_PROVIDERS
                .iter()
                .any(|(provider, ids)| provider.eq_ignore_ascii_case(&self.source) && ids.contains(&self.event_id))
    }
}

/// A half-open range of time, `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventWindow {
    /// The inclusive start of the window.
    pub start: DateTime<Utc>,

    /// The exclusive end of the window.
    pub end: DateTime<Utc>,
}

impl EventWindow {
    /// Returns `true` if the window contains a point in time.
    #[must_use = "Has no effect if the result is unused"]
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time < self.end
    }

    /// Renders the window as an event query condition on `TimeCreated`.
    #[must_use = "Has no effect if the result is unused"]
    pub fn time_created(&self) -> String {
        format!(
            "TimeCreated[@SystemTime>='{}' and @SystemTime<'{}']",
            self.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.end.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

/// Builds the query for the boot events of the System log inside of a window.
///
/// Each ID is only matched for the provider that writes it.
#[must_use = "Has no effect if the result is unused"]
pub fn boot_query(window: &EventWindow) -> String {
    let providers = BOOT_EVENT_PROVIDERS
        .iter()
        .map(|(provider, ids)| {
            let ids = ids.iter().map(|id| format!("EventID={id}")).collect::<Vec<_>>().join(" or ");
            format!("(Provider[@Name='{provider}'] and ({ids}))")
        })
        .collect::<Vec<_>>()
        .join(" or ");
    format!("*[System[({providers}) and {}]]", window.time_created())
}

/// Builds the query for the errors that `Kernel-Boot` wrote to the System log inside of a window.
#[must_use = "Has no effect if the result is unused"]
pub fn kernel_boot_error_query(window: &EventWindow) -> String {
    format!(
        "*[System[Provider[@Name='{KERNEL_BOOT}'] and Level={LEVEL_ERROR} and {}]]",
        window.time_created()
    )
}

/// Builds the query for the critical events and errors of the Application log inside of a window.
#[must_use = "Has no effect if the result is unused"]
pub fn application_error_query(window: &EventWindow) -> String {
    format!(
        "*[System[(Level={LEVEL_CRITICAL} or Level={LEVEL_ERROR}) and {}]]",
        window.time_created()
    )
}

/// A source of boot-relevant events.
pub trait EventSource {
    /// Collects the boot-relevant events that were written inside of a window.
    ///
    /// An empty result means that no events were found, not that events are unavailable.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the event log could not be queried.
    fn collect_boot_events(&self, window: &EventWindow) -> Result<Vec<BootEvent>, EventError>;
}

/// An [`EventSource`] that queries the System and Application logs through `wevtutil`.
pub struct WevtutilEvents {
    /// The runner that will run `wevtutil`.
    runner: Rc<dyn CommandRunner>,

    /// The `wevtutil` program.
    program: String,

    /// How long the query may take.
    timeout: Duration,

    /// The maximum number of events that will be read.
    max_events: usize,
}

impl WevtutilEvents {
    /// Constructs a new [`WevtutilEvents`].
    #[must_use = "Has no effect if the result is unused"]
    pub fn new(runner: Rc<dyn CommandRunner>, program: impl Into<String>, timeout: Duration, max_events: usize) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout,
            max_events,
        }
    }

    /// Builds the arguments of a `wevtutil` query of a log.
    fn query_args(log: &str, query: &str, count: usize) -> Vec<String> {
        vec![
            "qe".to_owned(),
            log.to_owned(),
            format!("/q:{query}"),
            "/f:text".to_owned(),
            "/rd:true".to_owned(),
            format!("/c:{count}"),
        ]
    }

    /// Runs a query, returning the events it printed.
    ///
    /// # Errors
    ///
    /// May return an `Error` if `wevtutil` could not be run, or reported failure.
    fn query(&self, log: &str, query: &str, count: usize) -> Result<Vec<BootEvent>, EventError> {
        let output = self
            .runner
            .run(&self.program, &Self::query_args(log, query, count), self.timeout)?;
        if !output.is_success() {
            return Err(EventError::QueryFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(parse_event_text(&output.stdout))
    }
}

impl EventSource for WevtutilEvents {
    fn collect_boot_events(&self, window: &EventWindow) -> Result<Vec<BootEvent>, EventError> {
        let mut events = self.query("System", &boot_query(window), self.max_events)?;

        let extra = [
            ("System", kernel_boot_error_query(window), self.max_events),
            ("Application", application_error_query(window), self.max_events / 2),
        ];
        for (log, query, count) in extra {
            let room = self.max_events.saturating_sub(events.len()).min(count);
            if room == 0 {
                break;
            }
            match self.query(log, &query, room) {
                Ok(found) => events.extend(found),
                Err(e) => debug!("[EVENTS]: Skipping the {log} log errors: {e}"),
            }
        }

        events.retain(|event| window.contains(event.timestamp));
        events.sort_by(|a, b| {
            (a.timestamp, a.event_id, &a.source, &a.message).cmp(&(b.timestamp, b.event_id, &b.source, &b.message))
        });
        events.dedup();
        events.truncate(self.max_events);
        Ok(events)
    }
}

/// Parses the text output of `wevtutil qe /f:text`.
///
/// Records are separated by an `Event[n]:` line or a blank line, and consist of `Key: Value` lines. The description
/// may continue onto the lines after its key. Records without a valid event ID or date are dropped.
#[must_use = "Has no effect if the result is unused"]
pub fn parse_event_text(text: &str) -> Vec<BootEvent> {
    let mut events = Vec::new();
    let mut record = RawRecord::default();

    for line in text.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with("Event[") && trimmed.ends_with("]:") {
            record.finish(&mut events);
            continue;
        }

        if trimmed.is_empty() {
            if !record.awaiting_description() {
                record.finish(&mut events);
            }
            continue;
        }

        if record.in_description {
            if !record.description.is_empty() {
                record.description.push(' ');
            }
            record.description.push_str(trimmed);
            continue;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            record.assign(key.trim(), value.trim());
        }
    }
    record.finish(&mut events);

    events
}

/// The fields of an event record that is being parsed.
#[derive(Default)]
struct RawRecord {
    /// The `Event ID` field.
    event_id: Option<String>,

    /// The `Date` field.
    date: Option<String>,

    /// The `Level` field.
    level: Option<String>,

    /// The `Source` field.
    source: Option<String>,

    /// The `Description` field, with continuation lines joined by spaces.
    description: String,

    /// If the lines that follow belong to the description.
    in_description: bool,
}

impl RawRecord {
    /// Assigns a `Key: Value` line to its field.
    fn assign(&mut self, key: &str, value: &str) {
        match key {
            "Event ID" => self.event_id = Some(value.to_owned()),
            "Date" => self.date = Some(value.to_owned()),
            "Level" => self.level = Some(value.to_owned()),
            "Source" => self.source = Some(value.to_owned()),
            "Description" => {
                value.clone_into(&mut self.description);
                self.in_description = true;
            }
            _ => (),
        }
    }

    /// Returns `true` if a description was started, but none of its text has been seen yet.
    const fn awaiting_description(&self) -> bool {
        self.in_description && self.description.is_empty()
    }

    /// Turns the record into a [`BootEvent`] if it is complete, then resets it.
    fn finish(&mut self, events: &mut Vec<BootEvent>) {
        let record = std::mem::take(self);
        if record.event_id.is_none() && record.date.is_none() {
            return;
        }

        let event_id = record.event_id.as_deref().and_then(|id| id.parse().ok());
        let timestamp = record.date.as_deref().and_then(parse_event_date);
        match (event_id, timestamp) {
            (Some(event_id), Some(timestamp)) => events.push(BootEvent {
                event_id,
                timestamp,
                level: record.level.unwrap_or_else(|| "Information".to_owned()),
                source: record.source.unwrap_or_else(|| "System".to_owned()),
                message: record.description,
            }),
            _ => trace!(
                "[EVENTS]: Dropping record with event ID {:?} and date {:?}",
                record.event_id, record.date
            ),
        }
    }
}

/// Parses the `Date` field of an event.
///
/// Dates without an offset are in local time, which is what `wevtutil` prints.
fn parse_event_date(date: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(date) {
        return Some(time.with_timezone(&Utc));
    }

    DATE_FORMATS.iter().find_map(|format| {
        let naive = NaiveDateTime::parse_from_str(date, format).ok()?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|time| time.with_timezone(&Utc))
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use proptest::prelude::*;

    use super::*;
    use crate::system::command::CommandOutput;

    const SAMPLE: &str = "Event[0]:
  Log Name: System
  Source: Microsoft-Windows-Kernel-Power
  Date: 2025-03-02T08:15:30Z
  Event ID: 41
  Task: N/A
  Level: Critical
  Description:
The system has rebooted without cleanly shutting down first.

Event[1]:
  Log Name: System
  Source: EventLog
  Date: 2025-03-02T08:15:45Z
  Event ID: 6005
  Level: Information
  Description: The Event log service was started.

Event[2]:
  Source: EventLog
  Date: yesterday
  Event ID: 6008
";

    /// A runner that always returns the same output.
    struct FixedRunner(CommandOutput);

    impl CommandRunner for FixedRunner {
        fn run(&self, _program: &str, _args: &[String], _timeout: Duration) -> Result<CommandOutput, CommandError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_parse_sample() {
        let events = parse_event_text(SAMPLE);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, 41);
        assert_eq!(events[0].level, "Critical");
        assert_eq!(
            events[0].message,
            "The system has rebooted without cleanly shutting down first."
        );
        assert!(events[0].is_unclean_shutdown());
        assert_eq!(events[1].event_id, 6005);
        assert_eq!(events[1].message, "The Event log service was started.");
        assert!(!events[1].is_unclean_shutdown());
    }

    #[test]
    fn test_parse_local_date() {
        let events = parse_event_text("Event ID: 12\nDate: 2025-03-02 08:15:30\n");
        let expected = Local
            .with_ymd_and_hms(2025, 3, 2, 8, 15, 30)
            .earliest()
            .map(|time| time.with_timezone(&Utc));
        assert_eq!(events.first().map(|event| event.timestamp), expected);
    }

    #[test]
    fn test_us_date() {
        assert!(parse_event_date("3/2/2025 8:15:30 AM").is_some());
        assert!(parse_event_date("not a date").is_none());
    }

    #[test]
    fn test_collect_filters_window() -> Result<(), EventError> {
        let runner = Rc::new(FixedRunner(CommandOutput::success(SAMPLE)));
        let source = WevtutilEvents::new(runner, "wevtutil", Duration::from_secs(1), 50);
        let start = DateTime::parse_from_rfc3339("2025-03-02T08:15:40Z")
            .map(|time| time.with_timezone(&Utc))
            .unwrap_or_default();
        let window = EventWindow {
            start,
            end: start + TimeDelta::hours(1),
        };
        let events = source.collect_boot_events(&window)?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, 6005);
        Ok(())
    }

    /// A runner that records its arguments, and fails every query of the Application log.
    #[derive(Default)]
    struct RecordingRunner(std::cell::RefCell<Vec<Vec<String>>>);

    impl CommandRunner for RecordingRunner {
        fn run(&self, _program: &str, args: &[String], _timeout: Duration) -> Result<CommandOutput, CommandError> {
            self.0.borrow_mut().push(args.to_vec());
            if args.get(1).map(String::as_str) == Some("Application") {
                return Ok(CommandOutput::failure(15007, "The specified channel could not be found."));
            }
            Ok(CommandOutput::success(SAMPLE))
        }
    }

    /// The hour after 08:15:00 on the day of the sample.
    fn sample_window() -> EventWindow {
        let start = DateTime::parse_from_rfc3339("2025-03-02T08:15:00Z")
            .map(|time| time.with_timezone(&Utc))
            .unwrap_or_default();
        EventWindow {
            start,
            end: start + TimeDelta::hours(1),
        }
    }

    #[test]
    fn test_queries_are_bounded_by_the_window() {
        let window = sample_window();
        let bound = "TimeCreated[@SystemTime>='2025-03-02T08:15:00.000Z' and @SystemTime<'2025-03-02T09:15:00.000Z']";

        let boot = boot_query(&window);
        assert!(boot.starts_with("*[System[("));
        assert!(boot.ends_with(&format!(" and {bound}]]")));
        assert!(boot.contains("(Provider[@Name='Microsoft-Windows-Kernel-Power'] and (EventID=41))"));
        assert!(boot.contains("(Provider[@Name='EventLog'] and (EventID=6005 or EventID=6006 or EventID=6008 or EventID=6009))"));

        assert_eq!(
            kernel_boot_error_query(&window),
            format!("*[System[Provider[@Name='Microsoft-Windows-Kernel-Boot'] and Level=2 and {bound}]]")
        );
        assert_eq!(
            application_error_query(&window),
            format!("*[System[(Level=1 or Level=2) and {bound}]]")
        );
    }

    #[test]
    fn test_providers_cover_boot_ids() {
        let mut ids: Vec<u32> = BOOT_EVENT_PROVIDERS
            .iter()
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, BOOT_EVENT_IDS.to_vec());
    }

    #[test]
    fn test_extra_logs_are_best_effort() -> Result<(), EventError> {
        let runner = Rc::new(RecordingRunner::default());
        let source = WevtutilEvents::new(runner.clone(), "wevtutil", Duration::from_secs(1), 10);
        let events = source.collect_boot_events(&sample_window())?;

        // The System log answered both of its queries with the same events.
        assert_eq!(events.len(), 2);
        let calls = runner.0.borrow();
        let logs: Vec<&str> = calls.iter().filter_map(|args| args.get(1).map(String::as_str)).collect();
        assert_eq!(logs, vec!["System", "System", "Application"]);
        assert!(calls.iter().all(|args| args.iter().any(|arg| arg.starts_with("/q:") && arg.contains("TimeCreated"))));
        assert!(calls[2].contains(&"/c:5".to_owned()));
        Ok(())
    }

    #[test]
    fn test_unclean_shutdown_needs_its_provider() {
        let mut event = parse_event_text(SAMPLE).swap_remove(0);
        assert!(event.is_unclean_shutdown());
        event.source = "Application Error".to_owned();
        assert!(!event.is_unclean_shutdown());
        event.event_id = 1001;
        event.source = "Windows Error Reporting".to_owned();
        assert!(!event.is_unclean_shutdown());
        event.source = "Microsoft-Windows-WER-SystemErrorReporting".to_owned();
        assert!(event.is_unclean_shutdown());
    }

    #[test]
    fn test_query_failure() {
        let runner = Rc::new(FixedRunner(CommandOutput::failure(5, "Access is denied.")));
        let source = WevtutilEvents::new(runner, "wevtutil", Duration::from_secs(1), 50);
        let window = EventWindow {
            start: DateTime::UNIX_EPOCH,
            end: Utc::now(),
        };
        assert!(matches!(
            source.collect_boot_events(&window),
            Err(EventError::QueryFailed { exit_code: Some(5), .. })
        ));
    }

    proptest! {
        #[test]
        fn doesnt_panic(x in "\\PC*") {
            let _ = parse_event_text(&x);
        }
    }
}
