//! Pipeline entry gate.
//!
//! The flattened output is destined for a target where symbol addresses
//! are meaningless, so every defined function must already have been
//! marked address-insignificant: the designated entry as
//! `local_unnamed_addr`, everything else with some unnamed-addr marker.

use crate::ir::{Module, UnnamedAddr};
use anyhow::{bail, Result};

/// Run the precheck. Never modifies the module.
pub fn run(module: &Module) -> Result<()> {
    for func in &module.functions {
        if func.is_declaration() {
            continue;
        }
        if func.is_entry {
            if func.unnamed_addr != UnnamedAddr::Local {
                bail!(
                    "entry function @{} is not marked as local_unnamed_addr",
                    func.name
                );
            }
        } else if func.unnamed_addr == UnnamedAddr::None {
            bail!("function @{} is not marked as unnamed_addr", func.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    #[test]
    fn accepts_well_marked_module() {
        let m = parse_module(
            r#"
            fn @main() entry local_unnamed_addr {
            b0:
              ret
            }
            fn @helper() internal unnamed_addr {
            b0:
              ret
            }
            declare @ext(i32)
            "#,
        )
        .unwrap();
        run(&m).unwrap();
    }

    #[test]
    fn rejects_unmarked_helper() {
        let m = parse_module(
            r#"
            fn @main() entry local_unnamed_addr {
            b0:
              ret
            }
            fn @helper() internal {
            b0:
              ret
            }
            "#,
        )
        .unwrap();
        let err = run(&m).unwrap_err();
        assert!(err.to_string().contains("@helper"));
    }

    #[test]
    fn rejects_entry_without_local_marker() {
        let m = parse_module(
            r#"
            fn @main() entry unnamed_addr {
            b0:
              ret
            }
            "#,
        )
        .unwrap();
        let err = run(&m).unwrap_err();
        assert!(err.to_string().contains("local_unnamed_addr"));
    }
}
