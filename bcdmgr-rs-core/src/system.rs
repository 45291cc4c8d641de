// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Collaborators that touch the operating system.
//!
//! Each of these is a trait with one implementation for a real Windows system, so that the rest of the crate only
//! ever depends on the trait.

pub mod clock;
pub mod command;
pub mod events;
pub mod fs;
pub mod log_backend;
