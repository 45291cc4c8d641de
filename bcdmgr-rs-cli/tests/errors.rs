// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Runs the `bcdmgr` binary, checking where its errors go.

use std::{error::Error, process::Command};

#[test]
fn test_errors_go_to_stderr() -> Result<(), Box<dyn Error>> {
    let output = Command::new(env!("CARGO_BIN_EXE_bcdmgr"))
        .arg("--no-such-argument")
        .output()?;

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.starts_with("Error: Unknown long argument: --no-such-argument"));
    Ok(())
}

#[test]
fn test_help_goes_to_stdout() -> Result<(), Box<dyn Error>> {
    let output = Command::new(env!("CARGO_BIN_EXE_bcdmgr")).arg("--help").output()?;

    assert!(output.status.success());
    assert!(output.stderr.is_empty());
    assert!(String::from_utf8(output.stdout)?.contains("--boot-once <id>"));
    Ok(())
}
