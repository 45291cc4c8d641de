// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Running external programs with a deadline.
//!
//! The boot manager and the event log are only reachable through `bcdedit` and `wevtutil`. Either may hang (for
//! example, behind a UAC prompt or a stuck event log service), so every invocation carries a timeout. A timeout is a
//! [`CommandError::Timeout`], never a partial result.

use std::{
    io,
    thread,
    time::{Duration, Instant},
};

use duct::cmd;
use log::debug;
use thiserror::Error;

/// How often a running child is checked for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// An error that may result from running a command.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The program could not be started.
    #[error("Could not start \"{program}\": {source}")]
    Spawn {
        /// The program that was run.
        program: String,

        /// The underlying error.
        source: io::Error,
    },

    /// The program did not finish before its deadline and was killed.
    #[error("\"{program}\" did not finish within {} seconds", timeout.as_secs())]
    Timeout {
        /// The program that was run.
        program: String,

        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The program ran, but exited with a failing code.
    #[error("\"{program}\" exited with code {exit_code:?}: {output}")]
    Failed {
        /// The program that was run.
        program: String,

        /// The exit code.
        exit_code: Option<i32>,

        /// What the program printed.
        output: String,
    },

    /// The program was started, but waiting on it failed.
    #[error("Failed while waiting on \"{program}\": {source}")]
    Wait {
        /// The program that was run.
        program: String,

        /// The underlying error.
        source: io::Error,
    },
}

/// The captured result of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The exit code. [`None`] if the process was terminated without one.
    pub exit_code: Option<i32>,

    /// The captured standard output.
    pub stdout: String,

    /// The captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Constructs a [`CommandOutput`] for a command that exited with `0`.
    #[must_use = "Has no effect if the result is unused"]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Constructs a [`CommandOutput`] for a command that exited with a failing code.
    #[must_use = "Has no effect if the result is unused"]
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns `true` if the command exited with `0`.
    #[must_use = "Has no effect if the result is unused"]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turns a failing exit code into an `Error`.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the command did not exit with `0`.
    pub fn check(self, program: &str) -> Result<Self, CommandError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(CommandError::Failed {
                program: program.to_owned(),
                exit_code: self.exit_code,
                output: format!("{}{}", self.stdout, self.stderr).trim().to_owned(),
            })
        }
    }
}

/// Runs external programs.
///
/// A non-zero exit code is a successful run as far as this trait is concerned. It is up to the caller to decide what
/// the exit code means.
pub trait CommandRunner {
    /// Runs `program` with `args`, waiting up to `timeout` for it to finish.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the program could not be started, or did not finish within `timeout`.
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, CommandError>;
}

/// A [`CommandRunner`] that spawns real processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, CommandError> {
        debug!("Running {program} {}", args.join(" "));
        let handle = cmd(program, args)
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .start()
            .map_err(|source| CommandError::Spawn {
                program: program.to_owned(),
                source,
            })?;

        let wait_err = |source| CommandError::Wait {
            program: program.to_owned(),
            source,
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(output) = handle.try_wait().map_err(wait_err)? {
                return Ok(CommandOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            if Instant::now() >= deadline {
                handle.kill().map_err(wait_err)?;
                return Err(CommandError::Timeout {
                    program: program.to_owned(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
