// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! The wall clock and the system boot time.

use chrono::{DateTime, Utc};
use sysinfo::System;
use thiserror::Error;

/// An error that may result from reading the clock.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClockError {
    /// The boot time reported by the system could not be represented.
    #[error("Invalid system boot time: {0}")]
    InvalidBootTime(u64),
}

/// A source of the current time and the time the system last booted.
pub trait BootClock {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the time the system last booted.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the boot time could not be obtained.
    fn boot_time(&self) -> Result<DateTime<Utc>, ClockError>;
}

/// A [`BootClock`] that reads the real system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBootClock;

impl BootClock for SystemBootClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn boot_time(&self) -> Result<DateTime<Utc>, ClockError> {
        let secs = System::boot_time();
        i64::try_from(secs)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or(ClockError::InvalidBootTime(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_is_before_now() -> Result<(), ClockError> {
        let clock = SystemBootClock;
        assert!(clock.boot_time()? <= clock.now());
        Ok(())
    }
}
