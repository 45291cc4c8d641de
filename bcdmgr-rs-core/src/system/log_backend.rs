// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Simple file backend for the [`log`] crate.
//!
//! Records are appended to `logs/bcdmgr.log` inside of the data directory. Warnings and errors are also echoed to
//! stderr, since a frontend may have no other way of surfacing them.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{SecondsFormat, Utc};
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};

/// The name of the directory that holds the log files.
pub const LOG_DIR: &str = "logs";

/// The name of the active log file.
pub const LOG_FILE: &str = "bcdmgr.log";

/// The size at which the active log file is rotated on startup.
const ROTATE_SIZE: u64 = 10 * 1024 * 1024;

/// The number of rotated log files that are kept.
const KEEP_ROTATED: usize = 3;

/// A simple logging backend that writes to a file.
pub struct FileLogger {
    /// The open log file, if it could be opened.
    file: Mutex<Option<File>>,

    /// The maximum level that will be logged.
    level: LevelFilter,
}

impl FileLogger {
    /// Constructs a new [`FileLogger`] that writes into `logs/` under the data directory.
    ///
    /// If the log file cannot be opened, records are still echoed to stderr at `Warn` and above.
    #[must_use = "Has no effect if the result is unused"]
    pub fn new(data_dir: &Path, level: LevelFilter) -> Self {
        let file = open_log_file(&data_dir.join(LOG_DIR)).ok();
        Self {
            file: Mutex::new(file),
            level,
        }
    }

    /// Constructs a new [`FileLogger`], then installs it as the global logger.
    ///
    /// # Errors
    ///
    /// May return an `Error` if a logger was already installed.
    pub fn install(data_dir: &Path, level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(Self::new(data_dir, level)))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let time = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            let level = record.level();
            let file = record.file().unwrap_or_default();
            let line = record.line().unwrap_or_default();
            let args = record.args();
            let entry = format!("[{time} {level} {file}:{line}] - {args}\n");

            if let Ok(mut guard) = self.file.lock()
                && let Some(file) = guard.as_mut()
            {
                let _ = file.write_all(entry.as_bytes());
            }

            if level <= Level::Warn {
                let _ = io::stderr().write_all(entry.as_bytes());
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.file.lock()
            && let Some(file) = guard.as_mut()
        {
            let _ = file.flush();
        }
    }
}

/// Rotates the log file if it is too large, then opens it for appending.
fn open_log_file(dir: &Path) -> io::Result<File> {
    fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE);
    if fs::metadata(&path).is_ok_and(|meta| meta.len() > ROTATE_SIZE) {
        rotate(&path)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Shifts `bcdmgr.log.N` to `bcdmgr.log.N+1`, dropping the oldest, then moves the active file to `bcdmgr.log.1`.
fn rotate(path: &Path) -> io::Result<()> {
    let _ = fs::remove_file(rotated_path(path, KEEP_ROTATED));
    for n in (1..KEEP_ROTATED).rev() {
        let from = rotated_path(path, n);
        if from.exists() {
            fs::rename(from, rotated_path(path, n + 1))?;
        }
    }
    fs::rename(path, rotated_path(path, 1))
}

/// Returns the path of the `n`th rotated log file.
fn rotated_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use log::Log;

    use super::*;

    #[test]
    fn test_writes_to_file() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let logger = FileLogger::new(dir.path(), LevelFilter::Debug);
        logger.log(
            &Record::builder()
                .args(format_args!("hello"))
                .level(Level::Info)
                .file(Some("journal.rs"))
                .line(Some(7))
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("hidden"))
                .level(Level::Trace)
                .build(),
        );
        logger.flush();

        let content = fs::read_to_string(dir.path().join(LOG_DIR).join(LOG_FILE))?;
        assert!(content.contains("INFO journal.rs:7] - hello"));
        assert!(!content.contains("hidden"));
        Ok(())
    }

    #[test]
    fn test_rotation_keeps_three() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(LOG_FILE);
        for n in 0..5 {
            fs::write(&path, format!("{n}"))?;
            rotate(&path)?;
        }
        assert!(!path.exists());
        assert_eq!(fs::read_to_string(rotated_path(&path, 1))?, "4");
        assert_eq!(fs::read_to_string(rotated_path(&path, 3))?, "2");
        assert!(!rotated_path(&path, 4).exists());
        Ok(())
    }
}
