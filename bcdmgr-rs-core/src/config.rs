// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Provides [`AppConfig`], the configuration file of the application.
//!
//! This parses space separated key value pairs, the format of which is defined in the [`AppConfig`] struct. The file
//! lives at `bcdmgr-rs.conf` inside of the data directory, and every key is optional.
//!
//! Example configuration:
//!
//! ```text
//! # How far back, in hours, an operation may be to explain a boot
//! correlation_window 72
//!
//! # How many seconds two boot time readings may differ by and still be the same boot
//! boot_tolerance 10
//!
//! # Timeouts, in seconds, for bcdedit and the event log
//! command_timeout 30
//! event_timeout 10
//!
//! # The most events that will be kept for a boot session
//! max_events 50
//!
//! # Programs, if they are not on the PATH
//! bcdedit C:\Windows\System32\bcdedit.exe
//! wevtutil C:\Windows\System32\wevtutil.exe
//!
//! # One of off, error, warn, info, debug, trace
//! log_level debug
//! ```

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::TimeDelta;
use log::{LevelFilter, warn};
use thiserror::Error;

/// The name of the configuration file inside of the data directory.
pub const CONFIG_FILE: &str = "bcdmgr-rs.conf";

/// The environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "BCDMGR_DATA_DIR";

/// The name of the data directory under `%LOCALAPPDATA%`.
const APP_DIR: &str = "bcdmgr-rs";

/// The data directory used when nothing else is available.
const FALLBACK_DATA_DIR: &str = "bcdmgr-rs-data";

/// An error that may result from reading the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file exists, but could not be read.
    #[error("Could not read \"{}\": {source}", path.display())]
    Read {
        /// The path of the configuration file.
        path: PathBuf,

        /// The underlying error.
        source: io::Error,
    },
}

/// The configuration of the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    /// The directory that holds every store.
    pub data_dir: PathBuf,

    /// How far before a boot an operation may be and still explain it.
    pub correlation_window: TimeDelta,

    /// How far apart two boot time readings may be and still describe the same boot.
    pub boot_tolerance: TimeDelta,

    /// How long a `bcdedit` invocation may take. Never zero.
    pub command_timeout: Duration,

    /// How long an event log query may take. Never zero.
    pub event_timeout: Duration,

    /// The most events that will be kept for one boot session.
    pub max_events: usize,

    /// The `bcdedit` program.
    pub bcdedit: String,

    /// The `wevtutil` program.
    pub wevtutil: String,

    /// The maximum level that will be logged.
    pub log_level: LevelFilter,
}

impl AppConfig {
    /// Loads the configuration file from a data directory.
    ///
    /// A missing file is not an error, and results in the default configuration.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the file exists but could not be read.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Self::get_app_config(data_dir, &content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::with_data_dir(data_dir)),
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    /// Constructs the default configuration for a data directory.
    #[must_use = "Has no effect if the result is unused"]
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            correlation_window: TimeDelta::hours(72),
            boot_tolerance: TimeDelta::seconds(10),
            command_timeout: Duration::from_secs(30),
            event_timeout: Duration::from_secs(10),
            max_events: 50,
            bcdedit: "bcdedit".to_owned(),
            wevtutil: "wevtutil".to_owned(),
            log_level: LevelFilter::Info,
        }
    }

    /// Parses the contents of an [`AppConfig`] format string.
    ///
    /// Unknown keys and invalid values are warned about and otherwise ignored.
    #[must_use = "Has no effect if the result is unused"]
    pub fn get_app_config(data_dir: &Path, content: &str) -> Self {
        let mut config = Self::with_data_dir(data_dir);

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                warn!("[CONFIG]: Ignoring key without a value: {line}");
                continue;
            };
            let value = value.trim();

            let valid = match &*key.to_ascii_lowercase() {
                "correlation_window" => value
                    .parse()
                    .ok()
                    .filter(|hours: &i64| *hours > 0)
                    .and_then(TimeDelta::try_hours)
                    .map(|window| config.correlation_window = window)
                    .is_some(),
                "boot_tolerance" => value
                    .parse()
                    .ok()
                    .filter(|secs: &i64| *secs >= 0)
                    .and_then(TimeDelta::try_seconds)
                    .map(|tolerance| config.boot_tolerance = tolerance)
                    .is_some(),
                "command_timeout" => value
                    .parse()
                    .ok()
                    .filter(|secs: &u64| *secs > 0)
                    .map(|secs| config.command_timeout = Duration::from_secs(secs))
                    .is_some(),
                "event_timeout" => value
                    .parse()
                    .ok()
                    .filter(|secs: &u64| *secs > 0)
                    .map(|secs| config.event_timeout = Duration::from_secs(secs))
                    .is_some(),
                "max_events" => value.parse().map(|max| config.max_events = max).is_ok(),
                "bcdedit" => {
                    value.clone_into(&mut config.bcdedit);
                    true
                }
                "wevtutil" => {
                    value.clone_into(&mut config.wevtutil);
                    true
                }
                "log_level" => value.parse().map(|level| config.log_level = level).is_ok(),
                _ => {
                    warn!("[CONFIG]: Ignoring unknown key {key}");
                    continue;
                }
            };

            if !valid {
                warn!("[CONFIG]: Ignoring invalid value for {key}: {value}");
            }
        }

        config
    }
}

/// Resolves the data directory.
///
/// In order: an explicit directory, then the `BCDMGR_DATA_DIR` environment variable, then `%LOCALAPPDATA%\bcdmgr-rs`,
/// then `bcdmgr-rs-data` in the working directory.
#[must_use = "Has no effect if the result is unused"]
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| env::var_os(DATA_DIR_ENV).map(PathBuf::from))
        .or_else(|| env::var_os("LOCALAPPDATA").map(|dir| PathBuf::from(dir).join(APP_DIR)))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_full_config() {
        let config = r"
            # a comment
            correlation_window 24
            boot_tolerance 5
            command_timeout 60
            event_timeout 3
            max_events 10
            bcdedit C:\Windows\System32\bcdedit.exe
            wevtutil wevtutil.exe
            log_level debug
        ";

        let config = AppConfig::get_app_config(Path::new("data"), config);
        assert_eq!(config.correlation_window, TimeDelta::hours(24));
        assert_eq!(config.boot_tolerance, TimeDelta::seconds(5));
        assert_eq!(config.command_timeout, Duration::from_secs(60));
        assert_eq!(config.event_timeout, Duration::from_secs(3));
        assert_eq!(config.max_events, 10);
        assert_eq!(config.bcdedit, r"C:\Windows\System32\bcdedit.exe");
        assert_eq!(config.wevtutil, "wevtutil.exe");
        assert_eq!(config.log_level, LevelFilter::Debug);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = AppConfig::get_app_config(
            Path::new("data"),
            "max_events lots\nunknown 1\ncommand_timeout\ncorrelation_window -4\n",
        );
        assert_eq!(config, AppConfig::with_data_dir(Path::new("data")));
    }

    #[test]
    fn test_zero_timeouts_keep_defaults() {
        let config = AppConfig::get_app_config(Path::new("data"), "command_timeout 0\nevent_timeout 0\n");
        let defaults = AppConfig::with_data_dir(Path::new("data"));
        assert_eq!(config.command_timeout, defaults.command_timeout);
        assert_eq!(config.event_timeout, defaults.event_timeout);
        assert!(!config.command_timeout.is_zero());
    }

    #[test]
    fn test_missing_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        assert_eq!(AppConfig::load(dir.path())?, AppConfig::with_data_dir(dir.path()));
        Ok(())
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        assert_eq!(resolve_data_dir(Some(PathBuf::from("here"))), PathBuf::from("here"));
    }

    proptest! {
        #[test]
        fn doesnt_panic(x in "\\PC*") {
            let _ = AppConfig::get_app_config(Path::new("data"), &x);
        }
    }
}
