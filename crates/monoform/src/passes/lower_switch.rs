//! Switch lowering.
//!
//! Rewrites every `switch` terminator into a chain of equality tests and
//! two-way branches, so the final document contains no multi-way
//! control transfers. The first test lives in the switch's own block;
//! each further case gets a fresh chain block, and the last test falls
//! through to the original default.
//!
//! Phi nodes in the switch's successors are retargeted to whichever chain
//! block now supplies their edge; a target reached by several cases gets
//! one incoming entry per new predecessor, all carrying the original
//! value.

use crate::ir::{BinOp, Block, BlockId, Const, Function, Instr, Module, Operand, Terminator, Ty};
use crate::passes::utils::{operand_ty, var_types};
use anyhow::{Context, Result};
use std::collections::HashMap;

/// Run switch lowering over every function. Returns whether any switch
/// was rewritten.
pub fn run(module: &mut Module) -> Result<bool> {
    let mut changed = false;
    for i in 0..module.functions.len() {
        let types = var_types(&module.functions[i], module);
        let func = &mut module.functions[i];
        changed |= lower_function(func, &types)?;
    }
    Ok(changed)
}

fn lower_function(func: &mut Function, types: &HashMap<crate::ir::VarId, Ty>) -> Result<bool> {
    let mut changed = false;
    let mut i = 0;
    // New chain blocks are appended past the scan point and contain no
    // switches, so a single forward sweep reaches a fixed point.
    while i < func.blocks.len() {
        if matches!(func.blocks[i].terminator, Terminator::Switch { .. }) {
            lower_one(func, i, types)?;
            changed = true;
        }
        i += 1;
    }
    Ok(changed)
}

fn lower_one(
    func: &mut Function,
    index: usize,
    types: &HashMap<crate::ir::VarId, Ty>,
) -> Result<bool> {
    let switch_block = func.blocks[index].id;
    let Terminator::Switch {
        value,
        default,
        cases,
    } = func.blocks[index].terminator.clone()
    else {
        return Ok(false);
    };

    if cases.is_empty() {
        func.blocks[index].terminator = Terminator::Jump { target: default };
        return Ok(true);
    }

    let ty = operand_ty(&value, types)
        .with_context(|| format!("switch value in {} has no inferable type", switch_block))?;

    // Build the test chain. Tests for cases past the first go into fresh
    // blocks appended after the switch block's layout position.
    let mut chain: Vec<BlockId> = Vec::new();
    for _ in 1..cases.len() {
        chain.push(func.fresh_block());
    }

    // Predecessor that each successor edge arrives from, post-lowering.
    let mut edge_pred: Vec<(BlockId, BlockId)> = Vec::new(); // (target, new pred)

    for (k, (case_value, target)) in cases.iter().enumerate() {
        let test_block = if k == 0 { switch_block } else { chain[k - 1] };
        let next = if k + 1 < cases.len() {
            chain[k]
        } else {
            default
        };
        let cond = func.fresh_var();
        let test = Instr::BinOp {
            dest: cond,
            op: BinOp::Eq,
            ty: ty.clone(),
            lhs: value.clone(),
            rhs: Operand::Const(Const::Int {
                ty: ty.clone(),
                value: *case_value,
            }),
        };
        let terminator = Terminator::BranchIf {
            condition: Operand::Var(cond),
            if_true: *target,
            if_false: next,
        };
        if k == 0 {
            let b = &mut func.blocks[index];
            b.instrs.push(test);
            b.terminator = terminator;
        } else {
            func.blocks.insert(
                index + k,
                Block {
                    id: test_block,
                    instrs: vec![test],
                    terminator,
                },
            );
        }
        edge_pred.push((*target, test_block));
        if k + 1 == cases.len() {
            edge_pred.push((default, test_block));
        }
    }

    // Retarget phis: an incoming entry naming the switch block becomes one
    // entry per new predecessor of that successor.
    let mut succ_preds: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
    for (target, pred) in edge_pred {
        let preds = succ_preds.entry(target).or_default();
        if !preds.contains(&pred) {
            preds.push(pred);
        }
    }
    for (succ, preds) in succ_preds {
        // The old single switch edge becomes one entry per new
        // predecessor, all with the original value. When the switch block
        // itself is still a predecessor (it holds the first test) it is
        // simply re-added with the same value.
        if let Some(block) = func.block_mut(succ) {
            for instr in &mut block.instrs {
                if let Instr::Phi { incoming, .. } = instr {
                    if let Some(pos) = incoming.iter().position(|(_, p)| *p == switch_block) {
                        let (op, _) = incoming.remove(pos);
                        for pred in &preds {
                            incoming.push((op.clone(), *pred));
                        }
                    }
                }
            }
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn lower(src: &str) -> Module {
        let mut m = parse_module(src).unwrap();
        assert!(run(&mut m).unwrap());
        m
    }

    fn switch_count(func: &Function) -> usize {
        func.blocks
            .iter()
            .filter(|b| matches!(b.terminator, Terminator::Switch { .. }))
            .count()
    }

    #[test]
    fn two_case_switch_becomes_branch_chain() {
        let m = lower(
            r#"
            fn @main(%x: i32) -> i32 entry local_unnamed_addr {
            b0:
              switch %x, miss [ 10, ten  20, twenty ]
            ten:
              ret i32 1
            twenty:
              ret i32 2
            miss:
              ret i32 0
            }
            "#,
        );
        let f = m.func_by_name("main").unwrap();
        assert_eq!(switch_count(f), 0);
        // One extra chain block for the second test.
        assert_eq!(f.blocks.len(), 5);
        // First test sits in the old switch block.
        let b0 = f.block(f.entry_block).unwrap();
        assert!(matches!(
            b0.instrs.last(),
            Some(Instr::BinOp { op: BinOp::Eq, .. })
        ));
        let (next_test, ten) = match &b0.terminator {
            Terminator::BranchIf {
                if_true, if_false, ..
            } => (*if_false, *if_true),
            other => panic!("expected branch, got {:?}", other),
        };
        assert_eq!(f.block(ten).unwrap().id, ten);
        // The chain block tests the second case, defaulting to miss.
        let chain = f.block(next_test).unwrap();
        assert!(matches!(
            chain.instrs.last(),
            Some(Instr::BinOp { op: BinOp::Eq, .. })
        ));
        assert!(matches!(chain.terminator, Terminator::BranchIf { .. }));
    }

    #[test]
    fn caseless_switch_becomes_jump() {
        let mut m = parse_module(
            r#"
            fn @main(%x: i32) entry local_unnamed_addr {
            b0:
              switch %x, out [ ]
            out:
              ret
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        let f = m.func_by_name("main").unwrap();
        assert!(matches!(
            f.blocks[0].terminator,
            Terminator::Jump { .. }
        ));
    }

    #[test]
    fn phi_in_default_retargeted_to_last_chain_block() {
        let m = lower(
            r#"
            fn @main(%x: i32) -> i32 entry local_unnamed_addr {
            b0:
              switch %x, merge [ 1, one  2, two ]
            one:
              br merge
            two:
              br merge
            merge:
              %r = phi i32, [ i32 0, b0 ], [ i32 1, one ], [ i32 2, two ]
              ret %r
            }
            "#,
        );
        let f = m.func_by_name("main").unwrap();
        assert_eq!(switch_count(f), 0);
        // The default edge now arrives from the chain block that tested
        // the last case, not from b0.
        let merge = f
            .blocks
            .iter()
            .find(|b| b.instrs.iter().any(|i| matches!(i, Instr::Phi { .. })))
            .unwrap();
        let Instr::Phi { incoming, .. } = &merge.instrs[0] else {
            panic!("expected phi");
        };
        assert_eq!(incoming.len(), 3);
        assert!(
            !incoming.iter().any(|(_, p)| *p == f.entry_block),
            "default edge should no longer come from the switch block"
        );
    }

    #[test]
    fn repeated_target_gets_one_entry_per_predecessor() {
        let m = lower(
            r#"
            fn @main(%x: i32) -> i32 entry local_unnamed_addr {
            b0:
              switch %x, miss [ 1, hit  2, hit ]
            hit:
              %r = phi i32, [ i32 9, b0 ]
              ret %r
            miss:
              ret i32 0
            }
            "#,
        );
        let f = m.func_by_name("main").unwrap();
        let hit = f
            .blocks
            .iter()
            .find(|b| b.instrs.iter().any(|i| matches!(i, Instr::Phi { .. })))
            .unwrap();
        let Instr::Phi { incoming, .. } = &hit.instrs[0] else {
            panic!("expected phi");
        };
        // Two edges reach `hit` now: one from b0 (first test), one from
        // the chain block (second test). Both carry the original value.
        assert_eq!(incoming.len(), 2);
        assert!(incoming.iter().all(|(op, _)| matches!(
            op,
            Operand::Const(Const::Int { value: 9, .. })
        )));
        let preds: Vec<BlockId> = incoming.iter().map(|(_, p)| *p).collect();
        assert!(preds.contains(&f.entry_block));
    }

    #[test]
    fn lowering_twice_is_a_no_op() {
        let mut m = parse_module(
            r#"
            fn @main(%x: i32) -> i32 entry local_unnamed_addr {
            b0:
              switch %x, miss [ 10, ten ]
            ten:
              ret i32 1
            miss:
              ret i32 0
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert!(!run(&mut m).unwrap());
    }
}
