// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! The `bcdmgr-rs` library crate.
//!
//! This drives the Windows boot manager (`bcdedit`) on behalf of a frontend, and keeps enough durable history to
//! explain what happened on the next boot. A user action is recorded in an append-only journal before it is executed,
//! and on the next launch after a reboot, the boot that was observed is matched against the operations that preceded
//! it.
//!
//! The pieces, leaves first:
//! - [`listing`] parses `bcdedit /enum` output into boot entries.
//! - [`journal`] is the durable operation log.
//! - [`session`] decides whether a new boot happened and holds the boot session model.
//! - [`store`] persists the five most recent boot sessions and their captured events.
//! - [`correlate`] matches a boot to prior operations and diagnoses mismatches.
//! - [`retention`] bounds the state that would otherwise grow forever.
//! - [`backup`] takes the snapshot that gates every mutation.
//! - [`manager`] ties all of these together behind [`manager::BootManager`].
//!
//! Everything that touches the operating system directly (running commands, reading the boot time, querying the
//! event log) sits behind a trait in [`system`], so that frontends and tests may substitute their own.
//!
//! ## MSRV
//!
//! The minimum supported rust version is 1.88.0.

/// The primary result type that wraps around [`crate::error::BootError`].
pub type BootResult<T> = Result<T, crate::error::BootError>;

pub mod backup;
pub mod config;
pub mod correlate;
pub mod error;
pub mod export;
pub mod journal;
pub mod listing;
pub mod manager;
pub mod retention;
pub mod session;
pub mod store;
pub mod system;
