//! Entry designation and privatization.
//!
//! Validates that exactly one function carries the designated-entry
//! marker, then forces every other defined function to internal linkage
//! so later passes may move or delete it.

use crate::ir::{Linkage, Module};
use anyhow::{bail, Result};

/// Run the prepare pass. Returns whether any linkage changed.
pub fn run(module: &mut Module) -> Result<bool> {
    let entries: Vec<&str> = module
        .functions
        .iter()
        .filter(|f| f.is_entry)
        .map(|f| f.name.as_str())
        .collect();
    match entries.len() {
        0 => bail!("no function carries the entry marker"),
        1 => {}
        _ => bail!(
            "more than one function carries the entry marker: @{}, @{}",
            entries[0],
            entries[1]
        ),
    }

    let mut changed = false;
    for func in &mut module.functions {
        if !func.is_entry && !func.is_declaration() && func.linkage != Linkage::Internal {
            func.linkage = Linkage::Internal;
            changed = true;
        }
    }
    Ok(changed)
}
