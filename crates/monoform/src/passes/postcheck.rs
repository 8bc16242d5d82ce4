//! Pipeline exit gate.
//!
//! Confirms the pipeline's whole contract on the final document: one
//! function (the designated entry), no surviving globals, no multi-way
//! branches, and no calls except to intrinsics and inline assembly.

use crate::ir::{Callee, Instr, Module, Terminator};
use anyhow::{bail, Result};

/// Run the postcheck. Never modifies the module.
pub fn run(module: &Module) -> Result<()> {
    // Check 1: a single defined non-intrinsic function, carrying the
    // entry marker. Bodiless declarations are only harmful if still
    // called, which check 4 reports precisely.
    let mut main = None;
    for func in &module.functions {
        if func.intrinsic || func.is_declaration() {
            continue;
        }
        if main.is_some() {
            bail!("more than one function left in module: @{}", func.name);
        }
        main = Some(func);
    }
    let Some(main) = main else {
        bail!("no functions found in module");
    };
    if !main.is_entry {
        bail!("surviving function @{} has no entry marker", main.name);
    }

    // Check 2: no globals other than inert metadata.
    for global in &module.globals {
        if !global.metadata {
            bail!("module still has global variable @{}", global.name);
        }
    }

    // Check 3: no multi-way branches in the function body.
    for block in &main.blocks {
        if matches!(block.terminator, Terminator::Switch { .. }) {
            bail!("switch found within @{}", main.name);
        }
    }

    // Check 4: no external or indirect calls other than intrinsics/asm.
    for block in &main.blocks {
        for instr in &block.instrs {
            if let Instr::Call { callee, .. } = instr {
                match callee {
                    Callee::Direct(target) => {
                        let target = module
                            .func(*target)
                            .ok_or_else(|| anyhow::anyhow!("call to erased function"))?;
                        if !target.intrinsic {
                            bail!(
                                "non-intrinsic call to @{} survives within @{}",
                                target.name,
                                main.name
                            );
                        }
                    }
                    Callee::Indirect { .. } => {
                        bail!("indirect call survives within @{}", main.name)
                    }
                    Callee::Asm { .. } => {}
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    #[test]
    fn accepts_flattened_module() {
        let m = parse_module(
            r#"
            declare intrinsic @llvm.donothing()
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              call @llvm.donothing()
              %r = asm i32 "syscall"(i32 60)
              ret %r
            }
            "#,
        )
        .unwrap();
        run(&m).unwrap();
    }

    #[test]
    fn rejects_two_functions() {
        let m = parse_module(
            r#"
            fn @main() entry local_unnamed_addr {
            b0:
              ret
            }
            fn @leftover() internal unnamed_addr {
            b0:
              ret
            }
            "#,
        )
        .unwrap();
        let err = run(&m).unwrap_err();
        assert!(err.to_string().contains("more than one function"));
    }

    #[test]
    fn rejects_empty_module() {
        let m = parse_module("").unwrap();
        let err = run(&m).unwrap_err();
        assert!(err.to_string().contains("no functions"));
    }

    #[test]
    fn rejects_surviving_global() {
        let m = parse_module(
            r#"
            global @g : i32 = i32 1 internal
            fn @main() entry local_unnamed_addr {
            b0:
              ret
            }
            "#,
        )
        .unwrap();
        let err = run(&m).unwrap_err();
        assert!(err.to_string().contains("global variable @g"));
    }

    #[test]
    fn accepts_metadata_global() {
        let m = parse_module(
            r#"
            global @notes : i32 = i32 1 metadata
            fn @main() entry local_unnamed_addr {
            b0:
              ret
            }
            "#,
        )
        .unwrap();
        run(&m).unwrap();
    }

    #[test]
    fn rejects_switch() {
        let m = parse_module(
            r#"
            fn @main(%x: i32) entry local_unnamed_addr {
            b0:
              switch %x, done [ 0, done ]
            done:
              ret
            }
            "#,
        )
        .unwrap();
        let err = run(&m).unwrap_err();
        assert!(err.to_string().contains("switch"));
    }

    #[test]
    fn rejects_surviving_external_call() {
        let m = parse_module(
            r#"
            declare @puts(ptr) -> i32
            fn @main() entry local_unnamed_addr {
            b0:
              %r = call @puts(null)
              ret
            }
            "#,
        )
        .unwrap();
        let err = run(&m).unwrap_err();
        assert!(err.to_string().contains("@puts"));
    }

    #[test]
    fn rejects_indirect_call() {
        let m = parse_module(
            r#"
            fn @main() entry local_unnamed_addr {
            b0:
              %p = alloca ptr
              %f = load ptr, %p
              call void %f()
              ret
            }
            "#,
        )
        .unwrap();
        let err = run(&m).unwrap_err();
        assert!(err.to_string().contains("indirect call"));
    }

    #[test]
    fn rejects_entryless_survivor() {
        let m = parse_module(
            r#"
            fn @main() local_unnamed_addr {
            b0:
              ret
            }
            "#,
        )
        .unwrap();
        let err = run(&m).unwrap_err();
        assert!(err.to_string().contains("no entry marker"));
    }
}
