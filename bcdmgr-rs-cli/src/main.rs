// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! A command line interface frontend to `bcdmgr-rs`.

use std::{env, path::PathBuf, process::ExitCode};

use anyhow::{Context, anyhow, bail};
use bcdmgr_rs_core::{
    config::{AppConfig, resolve_data_dir},
    manager::{Action, BootManager, OperationResult},
    session::BootSession,
    system::log_backend::FileLogger,
};
use getargs::{Arg, Options};
use log::warn;

/// What the user asked for.
enum Command {
    /// Display the boot entries.
    List,

    /// Perform an action through the journal.
    Act(Action),

    /// Display the backups.
    Backups,

    /// Display the boot sessions and their verdicts.
    Sessions,

    /// Write a diagnostics archive.
    Export(PathBuf),
}

/// Takes the value of an argument.
///
/// # Errors
///
/// May return an `Error` if the argument has no value.
fn value<'a, I: Iterator<Item = &'a str>>(opts: &mut Options<&'a str, I>, name: &str) -> anyhow::Result<String> {
    opts.value()
        .map(ToOwned::to_owned)
        .map_err(|_| anyhow!("A value was not passed into the {name} argument"))
}

/// Parses the arguments into a command and an optional data directory. No command means help.
///
/// # Errors
///
/// May return an `Error` if an argument is unknown, or is missing its value.
fn parse_args(args: &[String]) -> anyhow::Result<(Option<Command>, Option<PathBuf>)> {
    let mut opts = Options::new(args.iter().map(String::as_str));
    let mut command = None;
    let mut data_dir = None;

    while let Ok(Some(arg)) = opts.next_arg() {
        let next = match arg {
            Arg::Short('l') | Arg::Long("list") => Command::List,
            Arg::Short('o') | Arg::Long("boot-once") => Command::Act(Action::BootOnce(value(&mut opts, "boot-once")?)),
            Arg::Short('d') | Arg::Long("set-default") => {
                Command::Act(Action::SetDefault(value(&mut opts, "set-default")?))
            }
            Arg::Short('t') | Arg::Long("timeout") => {
                let secs = value(&mut opts, "timeout")?;
                let secs = secs
                    .parse()
                    .with_context(|| format!("The value passed to the timeout argument ({secs}) is not a number"))?;
                Command::Act(Action::SetTimeout(secs))
            }
            Arg::Short('b') | Arg::Long("backup") => Command::Act(Action::Backup(value(&mut opts, "backup")?)),
            Arg::Short('r') | Arg::Long("restore") => Command::Act(Action::Restore(value(&mut opts, "restore")?)),
            Arg::Long("backups") => Command::Backups,
            Arg::Short('s') | Arg::Long("sessions") => Command::Sessions,
            Arg::Short('e') | Arg::Long("export") => Command::Export(PathBuf::from(value(&mut opts, "export")?)),
            Arg::Long("data-dir") => {
                data_dir = Some(PathBuf::from(value(&mut opts, "data-dir")?));
                continue;
            }
            Arg::Short('h') | Arg::Long("help") => return Ok((None, data_dir)),
            Arg::Short(invalid) => bail!("Unknown short argument: -{invalid}"),
            Arg::Long(invalid) => bail!("Unknown long argument: --{invalid}"),
            Arg::Positional(invalid) => bail!("Unknown positional argument: {invalid}"),
        };
        if command.is_some() {
            bail!("Only one command may be given at a time");
        }
        command = Some(next);
    }

    Ok((command, data_dir))
}

/// Prints one line for a boot session.
fn print_session(session: &BootSession) {
    let Some(verdict) = &session.verdict else {
        println!("{}: waiting for correlation", session.session_id);
        return;
    };
    println!(
        "{}: {} (expected {}, booted {})",
        session.session_id,
        verdict.match_status,
        verdict.expected_entry.as_deref().unwrap_or("-"),
        verdict.actual_entry.as_deref().unwrap_or("-"),
    );
    if let Some(diagnosis) = &verdict.diagnosis {
        println!("    {diagnosis}");
    }
}

/// Prints the result of an action.
fn print_result(result: &OperationResult) {
    let operation = &result.operation;
    println!("{} {}: {}", operation.id, operation.kind, operation.outcome);
    if let Some(code) = operation.failure_code() {
        println!("    {code}");
    }
    if let Some(backup) = &result.backup {
        println!("    backup {backup}");
    }
}

/// Prints the usage of the program.
fn print_help(app_filename: &str) {
    println!(
        r"Usage: {app_filename} [OPTIONS] [ARGS]...

-h, --help                 display this help and exit
-l, --list                 display boot entries and exit
-o, --boot-once <id>       boot the given entry on the next boot only
-d, --set-default <id>     make the given entry the default
-t, --timeout <secs>       set the boot menu timeout
-b, --backup <label>       back up the boot configuration
-r, --restore <backup_id>  restore a backup of the boot configuration
    --backups              display backups and exit
-s, --sessions             display recent boots and what was concluded about them
-e, --export <path>        write a diagnostics archive
    --data-dir <path>      use the given data directory
"
    );
}

/// The actual main function of the program, which returns an [`anyhow::Result`].
///
/// # Errors
///
/// May return an `Error` if the arguments are invalid, the data directory could not be opened, or the command failed.
fn main_func() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let app_filename = args.first().map_or("bcdmgr", String::as_str);
    let (command, data_dir) = parse_args(args.get(1..).unwrap_or_default())?;
    let Some(command) = command else {
        print_help(app_filename);
        return Ok(());
    };

    let data_dir = resolve_data_dir(data_dir);
    let config = AppConfig::load(&data_dir)?;
    let _ = FileLogger::install(&data_dir, config.log_level);

    let mut manager = BootManager::open(config)?;
    if let Err(e) = manager.observe_boot() {
        warn!("Boot observation failed: {e}");
    }

    match command {
        Command::List => {
            let listing = manager.entries()?;
            for entry in &listing.entries {
                let marker = if entry.is_current_default { "*" } else { " " };
                println!(
                    "{marker} {} {} ({})",
                    entry.identifier,
                    entry.description,
                    entry.os_type.as_str()
                );
            }
            if let Some(timeout) = listing.timeout {
                println!("timeout: {timeout} seconds");
            }
        }
        Command::Act(action) => {
            let result = manager.record_and_execute(action)?;
            print_result(&result);
            if !result.succeeded() {
                bail!("{} {} failed", result.operation.kind, result.operation.id);
            }
        }
        Command::Backups => {
            for backup in manager.backups() {
                println!("{backup}");
            }
        }
        Command::Sessions => manager.list_sessions().into_iter().for_each(print_session),
        Command::Export(path) => {
            let archive = manager.export_diagnostics(&path)?;
            println!(
                "Wrote {} operations and {} sessions to {}",
                archive.operations.len(),
                archive.sessions.len(),
                path.display()
            );
        }
    }

    Ok(())
}

/// The main function of the program.
fn main() -> ExitCode {
    match main_func() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
