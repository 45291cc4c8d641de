// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Developer tasks for the `bcdmgr-rs` workspace.

use clap::{Parser, Subcommand};

use crate::{fuzz::Fuzz, test::Test};

mod build;
mod doc;
mod fuzz;

/// The arguments of the task runner.
#[derive(Parser)]
#[command(about, long_about = None)]
struct Args {
    /// The task to run.
    #[command(subcommand)]
    command: Commands,
}

/// A task.
#[derive(Subcommand)]
pub enum Commands {
    /// Build all crates in workspace
    Build {
        /// Build with release profile
        #[arg(short, long, default_value_t = false)]
        release: bool,

        /// Build with target triple
        #[arg(short, long, default_value = "x86_64-pc-windows-msvc")]
        target: String,
    },

    /// Build docs for bcdmgr-rs-core crate
    Doc {
        /// Document private items in crate
        #[arg(short, long, default_value_t = false)]
        private: bool,

        /// Open in web browser after documenting
        #[arg(short, long, default_value_t = false)]
        open: bool,
    },

    /// Run unit tests, integration tests and clippy on host
    Test {
        /// Which tests to run, all of them by default
        #[command(subcommand)]
        command: Option<Test>,
    },

    /// Fuzz one of the text parsers
    Fuzz {
        /// The parser to fuzz
        #[command(subcommand)]
        command: Fuzz,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Build { release, target } => build::build_all_crates(release, &target)?,
        Commands::Doc { private, open } => doc::doc_crate(private, open)?,
        Commands::Test { command } => test::test_crate(command)?,
        Commands::Fuzz { command } => fuzz::fuzz_parsers(command)?,
    }
    Ok(())
}
