// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! A parser for the listing printed by `bcdedit /enum`.
//!
//! Example listing:
//!
//! ```text
//! Windows Boot Manager
//! --------------------
//! identifier              {bootmgr}
//! description             Windows Boot Manager
//! default                 {current}
//! displayorder            {current}
//!                         {9f3c1c52-8a1b-11ee-b9d1-0242ac120002}
//! timeout                 30
//!
//! Windows Boot Loader
//! -------------------
//! identifier              {current}
//! path                    \Windows\system32\winload.efi
//! description             Windows 11
//!
//! Firmware Application (101fffff)
//! -------------------------------
//! identifier              {9f3c1c52-8a1b-11ee-b9d1-0242ac120002}
//! path                    \EFI\ubuntu\shimx64.efi
//! description             ubuntu
//! ```
//!
//! A section is a title followed by an underline of dashes. The boot manager sections supply the default, timeout
//! and display order; every other section is a [`BootEntry`].

use std::collections::HashSet;

use log::{trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Section titles that describe a boot manager rather than a boot entry.
const MANAGER_TITLES: [&str; 2] = ["windows boot manager", "firmware boot manager"];

/// The manager whose values take priority when several manager sections are listed.
const PRIMARY_MANAGER: &str = "windows boot manager";

/// The alias `bcdedit` prints for the default entry when it is not the running one.
const DEFAULT_ALIAS: &str = "{default}";

/// Substrings of a description or path that identify a Linux loader.
const LINUX_HINTS: [&str; 8] = [
    "linux", "ubuntu", "fedora", "debian", "grub", "shim", "opensuse", "mint",
];

/// Errors that may result from parsing a boot manager listing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ListingError {
    /// The listing contained no text at all.
    #[error("Listing is empty")]
    Empty,

    /// The listing contained text, but no section header.
    #[error("Listing has no section header")]
    MissingHeader,

    /// An entry section had no `identifier` line.
    #[error("Section \"{0}\" has no identifier")]
    MissingIdentifier(String),

    /// Two entry sections had the same identifier.
    #[error("Identifier \"{0}\" appears more than once")]
    DuplicateIdentifier(String),

    /// Entries were listed, but none of them is the default.
    #[error("No entry matches the default \"{}\"", .0.as_deref().unwrap_or("<unset>"))]
    NoDefault(Option<String>),
}

/// The kind of operating system or loader a [`BootEntry`] starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsType {
    /// A Windows boot loader.
    Windows,

    /// A Linux loader such as GRUB or shim.
    Linux,

    /// A firmware application that is not recognized as anything else.
    Firmware,

    /// Hibernation resume, memory tester, or recovery environments.
    Recovery,

    /// A real-mode boot sector.
    Legacy,

    /// Anything else.
    Other,
}

impl OsType {
    /// Convert an [`OsType`] into an [`&str`].
    #[must_use = "Has no effect if the result is unused"]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::Firmware => "firmware",
            Self::Recovery => "recovery",
            Self::Legacy => "legacy",
            Self::Other => "other",
        }
    }
}

/// A selectable entry in the boot manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootEntry {
    /// The identifier of the entry, either a GUID or a well known alias such as `{current}`.
    pub identifier: String,

    /// The description of the entry. May be empty.
    pub description: String,

    /// The kind of entry.
    pub os_type: OsType,

    /// If this entry is the persistent default.
    pub is_current_default: bool,
}

/// A structured snapshot of the boot manager.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Listing {
    /// The entries, in the order they were listed.
    pub entries: Vec<BootEntry>,

    /// The identifier of the default entry. Only [`None`] if there are no entries.
    pub current_default: Option<String>,

    /// The boot menu timeout in seconds, if the listing had one.
    pub timeout: Option<u32>,

    /// The display order of the boot menu, as listed by the manager.
    pub display_order: Vec<String>,

    /// Other names of listed entries, as `(alias, listed identifier)` pairs.
    ///
    /// `bcdedit` prints `{current}` and `{default}` in place of GUIDs, and which GUID they stand for changes from boot
    /// to boot. These pairs tie a name to the entry it meant when the listing was read.
    pub aliases: Vec<(String, String)>,
}

impl Listing {
    /// Returns the default [`BootEntry`], if there are any entries.
    #[must_use = "Has no effect if the result is unused"]
    pub fn default_entry(&self) -> Option<&BootEntry> {
        self.entries.iter().find(|entry| entry.is_current_default)
    }

    /// Returns the [`BootEntry`] with the given identifier.
    #[must_use = "Has no effect if the result is unused"]
    pub fn get(&self, identifier: &str) -> Option<&BootEntry> {
        self.entries
            .iter()
            .find(|entry| entry.identifier.eq_ignore_ascii_case(identifier))
    }

    /// Checks if an entry with the given identifier exists.
    #[must_use = "Has no effect if the result is unused"]
    pub fn contains(&self, identifier: &str) -> bool {
        self.get(identifier).is_some()
    }

    /// Returns the [`BootEntry`] that an identifier names, either directly or through an alias.
    #[must_use = "Has no effect if the result is unused"]
    pub fn resolve(&self, identifier: &str) -> Option<&BootEntry> {
        self.get(identifier).or_else(|| {
            self.aliases
                .iter()
                .find(|(alias, _)| alias.eq_ignore_ascii_case(identifier))
                .and_then(|(_, listed)| self.get(listed))
        })
    }

    /// Checks if two identifiers name the same entry.
    ///
    /// Identifiers that are not listed at all are only the same if they are equal, ignoring case.
    #[must_use = "Has no effect if the result is unused"]
    pub fn same_entry(&self, a: &str, b: &str) -> bool {
        match (self.resolve(a), self.resolve(b)) {
            (Some(a), Some(b)) => a.identifier.eq_ignore_ascii_case(&b.identifier),
            _ => a.eq_ignore_ascii_case(b),
        }
    }

    /// Learns the aliases of a verbose listing from the plain listing of the same store.
    ///
    /// `bcdedit /enum /v` and `bcdedit /enum` list the same entries in the same order, and only differ in whether a
    /// GUID is printed as an alias. If the entry counts differ, nothing is learned.
    pub fn learn_aliases(&mut self, plain: &Self) {
        if plain.entries.len() != self.entries.len() {
            warn!(
                "[LISTING PARSER]: Plain listing has {} entries, verbose has {}, not learning aliases",
                plain.entries.len(),
                self.entries.len()
            );
            return;
        }

        for (plain, verbose) in plain.entries.iter().zip(&self.entries) {
            if !plain.identifier.eq_ignore_ascii_case(&verbose.identifier) {
                self.aliases
                    .push((plain.identifier.clone(), verbose.identifier.clone()));
            }
        }
        if let Some(default) = self.default_entry().map(|entry| entry.identifier.clone()) {
            self.aliases.push((DEFAULT_ALIAS.to_owned(), default));
        }
    }

    /// Adds the firmware applications of a `bcdedit /enum firmware` listing that are not listed already.
    ///
    /// Manager sections and entries without an identifier are skipped. Returns the number of entries added.
    pub fn merge_firmware(&mut self, raw: &str) -> usize {
        let mut added = 0;
        for section in split_sections(raw) {
            if section.is_manager() {
                continue;
            }
            let Some(identifier) = section.first("identifier") else {
                trace!("[LISTING PARSER]: Skipping firmware section \"{}\" without identifier", section.title);
                continue;
            };
            if self.resolve(identifier).is_some() {
                continue;
            }
            self.entries.push(entry_of(&section, identifier));
            added += 1;
        }
        added
    }
}

/// A section of the listing before it is interpreted.
struct Section {
    /// The title line of the section.
    title: String,

    /// The key value pairs, keys lowercased. Continuation lines add values to the previous key.
    fields: Vec<(String, Vec<String>)>,
}

impl Section {
    /// Returns the first value of a key, if present.
    fn first(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    /// Returns every value of a key.
    fn all(&self, key: &str) -> &[String] {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map_or(&[], |(_, values)| values.as_slice())
    }

    /// Checks if the section describes a boot manager.
    fn is_manager(&self) -> bool {
        let title = self.title.to_ascii_lowercase();
        MANAGER_TITLES.iter().any(|manager| title == *manager)
    }

    /// Add a `key value` line to the section.
    fn push_line(&mut self, line: &str) {
        let (key, value) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(key, value)| (key, value.trim()));
        let values = if value.is_empty() {
            Vec::new()
        } else {
            vec![value.to_owned()]
        };
        self.fields.push((key.to_ascii_lowercase(), values));
    }

    /// Add a continuation line to the previous key of the section.
    fn push_continuation(&mut self, line: &str) {
        if let Some((_, values)) = self.fields.last_mut() {
            values.push(line.trim().to_owned());
        } else {
            trace!("[LISTING PARSER]: Continuation line with no key in \"{}\"", self.title);
        }
    }
}

/// Parses a `bcdedit /enum` listing into a [`Listing`].
///
/// Empty descriptions, blank lines and keys that are not understood are tolerated. A listing that only contains a
/// boot manager section is a valid listing with zero entries.
///
/// # Errors
///
/// May return an `Error` if the listing is blank, has no section header, has an entry without an identifier,
/// has duplicate identifiers, or has entries but none of them is the default.
pub fn parse(raw: &str) -> Result<Listing, ListingError> {
    if raw.trim().is_empty() {
        return Err(ListingError::Empty);
    }

    let sections = split_sections(raw);
    if sections.is_empty() {
        return Err(ListingError::MissingHeader);
    }

    let mut listing = Listing::default();
    let mut manager_default = None;
    let mut seen = HashSet::new();
    let mut primary_seen = false;

    for section in &sections {
        if section.is_manager() {
            let primary = section.title.eq_ignore_ascii_case(PRIMARY_MANAGER);
            if primary || !primary_seen {
                if let Some(default) = section.first("default") {
                    manager_default = Some(default.to_owned());
                }
                if let Some(timeout) = section.first("timeout").and_then(|t| t.parse().ok()) {
                    listing.timeout = Some(timeout);
                }
                let order = section.all("displayorder");
                if !order.is_empty() {
                    listing.display_order = order.to_vec();
                }
            }
            primary_seen |= primary;
            continue;
        }

        let Some(identifier) = section.first("identifier") else {
            return Err(ListingError::MissingIdentifier(section.title.clone()));
        };
        if !seen.insert(identifier.to_ascii_lowercase()) {
            return Err(ListingError::DuplicateIdentifier(identifier.to_owned()));
        }

        listing.entries.push(entry_of(section, identifier));
    }

    if listing.entries.is_empty() {
        return Ok(listing);
    }

    let position = |identifier: &str| {
        listing
            .entries
            .iter()
            .position(|entry| entry.identifier.eq_ignore_ascii_case(identifier))
    };
    let default_idx = match manager_default.as_deref().and_then(position) {
        Some(idx) => idx,
        None => {
            let idx = position(DEFAULT_ALIAS).ok_or_else(|| ListingError::NoDefault(manager_default.clone()))?;
            if let Some(default) = manager_default {
                listing.aliases.push((default, DEFAULT_ALIAS.to_owned()));
            }
            idx
        }
    };

    listing.entries[default_idx].is_current_default = true;
    listing.current_default = Some(listing.entries[default_idx].identifier.clone());
    Ok(listing)
}

/// Interprets an entry section.
fn entry_of(section: &Section, identifier: &str) -> BootEntry {
    let description = section.first("description").unwrap_or_default().to_owned();
    let os_type = detect_os_type(&section.title, &description, section.first("path"));
    BootEntry {
        identifier: identifier.to_owned(),
        description,
        os_type,
        is_current_default: false,
    }
}

/// Split a listing into [`Section`]s. Text before the first header is skipped.
fn split_sections(raw: &str) -> Vec<Section> {
    let lines: Vec<&str> = raw.lines().map(str::trim_end).collect();
    let mut sections: Vec<Section> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if is_header(line, lines.get(i + 1).copied()) {
            sections.push(Section {
                title: line.trim().to_owned(),
                fields: Vec::new(),
            });
            i += 2;
            continue;
        }

        if !line.trim().is_empty() {
            match sections.last_mut() {
                Some(section) if line.starts_with(char::is_whitespace) => {
                    section.push_continuation(line);
                }
                Some(section) => section.push_line(line),
                None => trace!("[LISTING PARSER]: Skipping text before first section: {line}"),
            }
        }
        i += 1;
    }

    sections
}

/// Checks if a line is a section title, given the line that follows it.
fn is_header(line: &str, next: Option<&str>) -> bool {
    let Some(next) = next.map(str::trim) else {
        return false;
    };
    !line.trim().is_empty()
        && !line.starts_with(char::is_whitespace)
        && !next.is_empty()
        && next.chars().all(|c| c == '-')
}

/// Guess the [`OsType`] of an entry from its section title, description and path.
fn detect_os_type(title: &str, description: &str, path: Option<&str>) -> OsType {
    let title = title.to_ascii_lowercase();
    let haystack = format!("{description} {}", path.unwrap_or_default()).to_ascii_lowercase();

    if LINUX_HINTS.iter().any(|hint| haystack.contains(hint)) {
        OsType::Linux
    } else if title.starts_with("resume from hibernate")
        || title.starts_with("windows memory tester")
        || haystack.contains("recovery")
        || haystack.contains("winre")
    {
        OsType::Recovery
    } else if title.starts_with("windows boot loader") {
        OsType::Windows
    } else if title.starts_with("real-mode boot sector") {
        OsType::Legacy
    } else if title.starts_with("firmware application") {
        if haystack.contains("windows") {
            OsType::Windows
        } else {
            OsType::Firmware
        }
    } else {
        OsType::Other
    }
}
