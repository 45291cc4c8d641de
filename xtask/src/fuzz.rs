// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

use clap::Subcommand;
use duct::cmd;

/// A parser that can be fuzzed.
#[derive(Subcommand)]
pub enum Fuzz {
    /// Run bcdedit listing parser
    Listing,

    /// Run event log text parser
    Events,
}

/// Fuzzes a parser until it is interrupted or finds a crash.
pub fn fuzz_parsers(command: Fuzz) -> anyhow::Result<()> {
    let mut args = vec!["+nightly", "fuzz", "run"];
    match command {
        Fuzz::Listing => args.push("listing"),
        Fuzz::Events => args.push("events"),
    }

    cmd!("cargo", "install", "cargo-fuzz").run()?; // will not install if its already installed
    cmd("cargo", args).run()?;
    Ok(())
}
