//! Constructor/destructor call planting.
//!
//! Rewrites the module-level ctor/dtor tables into explicit calls inside
//! the designated entry function: constructors after the entry allocas in
//! ascending priority, destructors immediately before every return in
//! descending priority. The tables are cleared so the calls cannot be
//! planted twice. Runs before flattening so the planted calls get
//! flattened like any others.

use crate::ir::{Callee, Instr, Module, Terminator};
use crate::passes::utils::entry_insertion_point;
use anyhow::{Context, Result};
use std::cmp::Reverse;

/// Run the pass. Returns whether any call was planted.
pub fn run(module: &mut Module) -> Result<bool> {
    if module.ctors.is_empty() && module.dtors.is_empty() {
        return Ok(false);
    }

    let entry_id = module
        .entry_function()
        .context("ctor/dtor tables present but no entry function")?
        .id;

    let mut ctors = std::mem::take(&mut module.ctors);
    let mut dtors = std::mem::take(&mut module.dtors);
    // Stable sorts keep table order for equal priorities.
    ctors.sort_by_key(|e| e.priority);
    dtors.sort_by_key(|e| Reverse(e.priority));

    let func = module
        .func_mut(entry_id)
        .context("entry function vanished")?;

    let at = entry_insertion_point(func);
    let entry_block = func.entry_block;
    if let Some(block) = func.block_mut(entry_block) {
        for (i, entry) in ctors.iter().enumerate() {
            block.instrs.insert(
                at + i,
                Instr::Call {
                    dest: None,
                    callee: Callee::Direct(entry.func),
                    args: vec![],
                },
            );
        }
    }

    for block in &mut func.blocks {
        if matches!(block.terminator, Terminator::Return { .. }) {
            for entry in &dtors {
                block.instrs.push(Instr::Call {
                    dest: None,
                    callee: Callee::Direct(entry.func),
                    args: vec![],
                });
            }
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn call_target_names(module: &Module, instrs: &[Instr]) -> Vec<String> {
        instrs
            .iter()
            .filter_map(|i| match i {
                Instr::Call {
                    callee: Callee::Direct(f),
                    ..
                } => module.func(*f).map(|f| f.name.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn ctors_run_in_ascending_priority_after_allocas() {
        let mut m = parse_module(
            r#"
            fn @main() entry local_unnamed_addr {
            b0:
              %x = alloca i32
              store i32 0, %x
              ret
            }
            fn @late() internal unnamed_addr {
            b0:
              ret
            }
            fn @early() internal unnamed_addr {
            b0:
              ret
            }
            ctors { @late : 200, @early : 100 }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert!(m.ctors.is_empty());
        let main = m.func_by_name("main").unwrap();
        let b0 = &main.blocks[0];
        // alloca first, then the two ctor calls in priority order.
        assert!(matches!(b0.instrs[0], Instr::Alloca { .. }));
        assert_eq!(
            call_target_names(&m, &b0.instrs),
            vec!["early".to_string(), "late".to_string()]
        );
    }

    #[test]
    fn dtors_run_before_every_return_descending() {
        let mut m = parse_module(
            r#"
            fn @main(%c: i32) entry local_unnamed_addr {
            b0:
              br %c, a, b
            a:
              ret
            b:
              ret
            }
            fn @first_down() internal unnamed_addr {
            b0:
              ret
            }
            fn @last_down() internal unnamed_addr {
            b0:
              ret
            }
            dtors { @last_down : 100, @first_down : 200 }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert!(m.dtors.is_empty());
        let main = m.func_by_name("main").unwrap().clone();
        for label in [1u32, 2] {
            let block = main.block(crate::ir::BlockId(label)).unwrap();
            assert_eq!(
                call_target_names(&m, &block.instrs),
                vec!["first_down".to_string(), "last_down".to_string()],
                "dtor order wrong in block {}",
                label
            );
        }
    }

    #[test]
    fn no_tables_is_a_no_op() {
        let mut m = parse_module(
            r#"
            fn @main() entry local_unnamed_addr {
            b0:
              ret
            }
            "#,
        )
        .unwrap();
        assert!(!run(&mut m).unwrap());
    }
}
