// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

use duct::cmd;

/// Documents the core crate.
pub fn doc_crate(private: bool, open: bool) -> anyhow::Result<()> {
    let mut doc_args = vec!["doc", "--package", "bcdmgr-rs-core", "--no-deps"];
    if private {
        doc_args.push("--document-private-items");
    }
    if open {
        doc_args.push("--open");
    }

    cmd("cargo", doc_args).run()?;
    Ok(())
}
