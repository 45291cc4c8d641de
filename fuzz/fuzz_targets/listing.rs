// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(listing) = bcdmgr_rs_core::listing::parse(&String::from_utf8_lossy(data)) {
        assert!(listing.entries.iter().filter(|entry| entry.is_current_default).count() <= 1);
    }
});
