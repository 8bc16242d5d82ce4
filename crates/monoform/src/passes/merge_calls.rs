//! Call-site merging.
//!
//! Within one function, all direct call sites of the same callee are
//! collapsed into a single physical call. Each site's block is split
//! after the call and rerouted through a synthesized merge block: one phi
//! per argument position selects the value for whichever site branched
//! in, an origin phi numbers the incoming edge, the one remaining call
//! executes, and a switch on the origin routes control back to each
//! site's continuation. The switch default targets the function's shared
//! `unreachable` block, reused when one already exists.
//!
//! Splitting changes which edges enter a site's block, so any value
//! defined there and used beyond it — the call's own result included —
//! no longer satisfies def-dominates-use by position. Such values are
//! demoted to entry-block slots before the rewrite.
//!
//! Indirect calls, intrinsic calls and inline assembly are never merged.

use crate::ir::{
    Block, BlockId, Callee, Const, FuncId, Function, Instr, Module, Operand, Terminator, Ty, VarId,
};
use crate::passes::utils::{
    demote_to_slot, for_each_use, for_each_use_terminator, instr_dest, replace_uses_of,
    replace_uses_of_terminator, split_block_after, var_types,
};
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// Merge duplicate call sites within `fid`. Returns whether any group was
/// rewritten.
pub fn run(module: &mut Module, fid: FuncId) -> Result<bool> {
    // Count direct, mergeable call sites per callee. BTreeMap keys give
    // declaration order for the groups.
    let func = module.func(fid).context("merge_calls: function not found")?;
    let mut counts: BTreeMap<FuncId, usize> = BTreeMap::new();
    for block in &func.blocks {
        for instr in &block.instrs {
            if let Instr::Call {
                callee: Callee::Direct(target),
                ..
            } = instr
            {
                // Intrinsics are never tampered with; indirect calls and
                // inline asm never reach here (not Callee::Direct).
                if module.func(*target).is_some_and(|f| !f.intrinsic) {
                    *counts.entry(*target).or_default() += 1;
                }
            }
        }
    }

    let mut modified = false;
    for (callee, count) in counts {
        if count > 1 {
            merge_group(module, fid, callee)?;
            modified = true;
        }
    }
    Ok(modified)
}

struct Site {
    /// Block that now jumps into the merge block.
    origin: BlockId,
    /// Continuation holding the site's post-call logic.
    cont: BlockId,
    /// Argument operands as they stood at the site.
    args: Vec<Operand>,
    /// The original call's result register, if it had one.
    dest: Option<VarId>,
}

fn merge_group(module: &mut Module, fid: FuncId, callee: FuncId) -> Result<()> {
    let (param_tys, ret_ty, callee_name) = {
        let c = module
            .func(callee)
            .context("merge_calls: callee not found")?;
        (
            c.params.iter().map(|(_, ty)| ty.clone()).collect::<Vec<Ty>>(),
            c.ret.clone(),
            c.name.clone(),
        )
    };

    let merge_id = module
        .func_mut(fid)
        .context("merge_calls: function not found")?
        .fresh_block();
    let mut sites: Vec<Site> = Vec::new();

    // Rewrite one site at a time, rescanning from the top: splitting
    // shifts later calls into continuation blocks, so positions recorded
    // up front would go stale.
    loop {
        let found = module
            .func(fid)
            .and_then(|func| find_first_call(func, callee));
        let Some((bid, idx)) = found else { break };

        let types = var_types(
            module.func(fid).context("merge_calls: function vanished")?,
            module,
        );
        let entry_block = module
            .func(fid)
            .context("merge_calls: function vanished")?
            .entry_block;
        let func = module
            .func_mut(fid)
            .context("merge_calls: function vanished")?;

        // Split directly after the call; the site block keeps the prefix
        // plus the call, the continuation takes the rest.
        let cont = split_block_after(func, bid, idx);

        // Demote every escaping value defined in the site block while the
        // call is still its last instruction: a use that is only the call
        // argument stays direct and later rides the arg phi on this
        // site's edge. Entry-block allocas are exempt.
        let candidates: Vec<VarId> = func
            .block(bid)
            .map(|b| {
                b.instrs[..b.instrs.len() - 1]
                    .iter()
                    .filter(|i| !(matches!(i, Instr::Alloca { .. }) && bid == entry_block))
                    .filter_map(instr_dest)
                    .collect()
            })
            .unwrap_or_default();
        for var in candidates {
            if escapes(func, bid, var) {
                let ty = types
                    .get(&var)
                    .cloned()
                    .with_context(|| format!("no type for escaping value {}", var))?;
                demote_to_slot(func, var, ty);
            }
        }

        // Move the call to the head of the continuation, then demote its
        // result there so the slot store lands at the continuation start.
        let call = func
            .block_mut(bid)
            .and_then(|b| b.instrs.pop())
            .context("site block lost its call")?;
        let dest = instr_dest(&call);
        if let Some(b) = func.block_mut(cont) {
            b.instrs.insert(0, call);
        }
        if let Some(d) = dest {
            if has_uses(func, d) {
                let ty = ret_ty
                    .clone()
                    .context("call result used but callee returns void")?;
                demote_to_slot(func, d, ty);
            }
        }

        // Re-read the call (demotion may have rewritten its arguments),
        // then delete it and point the site block at the merge block.
        let call_pos = func
            .block(cont)
            .and_then(|b| {
                b.instrs.iter().position(|i| {
                    matches!(i, Instr::Call { callee: Callee::Direct(t), .. } if *t == callee)
                })
            })
            .context("continuation lost the moved call")?;
        let Some(Instr::Call { args, .. }) = func
            .block_mut(cont)
            .map(|b| b.instrs.remove(call_pos))
        else {
            bail!("continuation head was not the moved call");
        };
        if args.len() != param_tys.len() {
            bail!(
                "call to @{} passes {} arguments but it takes {}",
                callee_name,
                args.len(),
                param_tys.len()
            );
        }
        if let Some(b) = func.block_mut(bid) {
            b.terminator = Terminator::Jump { target: merge_id };
        }

        sites.push(Site {
            origin: bid,
            cont,
            args,
            dest,
        });
    }

    let func = module
        .func_mut(fid)
        .context("merge_calls: function vanished")?;
    debug!(
        callee = %callee_name,
        sites = sites.len(),
        "merge_calls: merging call sites"
    );

    // The merge block: argument phis, the origin phi, the one call, and
    // the dispatch switch.
    let mut instrs: Vec<Instr> = Vec::new();
    let mut merged_args: Vec<Operand> = Vec::new();
    for (p, ty) in param_tys.iter().enumerate() {
        let v = func.fresh_var();
        instrs.push(Instr::Phi {
            dest: v,
            ty: ty.clone(),
            incoming: sites
                .iter()
                .map(|s| (s.args[p].clone(), s.origin))
                .collect(),
        });
        merged_args.push(Operand::Var(v));
    }
    let origin = func.fresh_var();
    instrs.push(Instr::Phi {
        dest: origin,
        ty: Ty::I32,
        incoming: sites
            .iter()
            .enumerate()
            .map(|(i, s)| {
                (
                    Operand::Const(Const::Int {
                        ty: Ty::I32,
                        value: i as i64,
                    }),
                    s.origin,
                )
            })
            .collect(),
    });
    let merged_dest = ret_ty.as_ref().map(|_| func.fresh_var());
    instrs.push(Instr::Call {
        dest: merged_dest,
        callee: Callee::Direct(callee),
        args: merged_args,
    });

    let default = unreachable_block(func);
    func.blocks.push(Block {
        id: merge_id,
        instrs,
        terminator: Terminator::Switch {
            value: Operand::Var(origin),
            default,
            cases: sites
                .iter()
                .enumerate()
                .map(|(i, s)| (i as i64, s.cont))
                .collect(),
        },
    });

    // Every reference to an original call's result now means the merged
    // call's result; the demotion stores pick it up at each continuation.
    if let Some(md) = merged_dest {
        let new = Operand::Var(md);
        for site in &sites {
            if let Some(d) = site.dest {
                for block in &mut func.blocks {
                    for instr in &mut block.instrs {
                        replace_uses_of(instr, d, &new);
                    }
                    replace_uses_of_terminator(&mut block.terminator, d, &new);
                }
            }
        }
    }

    Ok(())
}

/// Position of the first remaining call to `callee`, in layout order.
fn find_first_call(func: &Function, callee: FuncId) -> Option<(BlockId, usize)> {
    for block in &func.blocks {
        for (i, instr) in block.instrs.iter().enumerate() {
            if matches!(instr, Instr::Call { callee: Callee::Direct(t), .. } if *t == callee) {
                return Some((block.id, i));
            }
        }
    }
    None
}

/// Whether `var` is read outside `bid`, or by any phi. Phi reads count
/// even inside `bid` because they select on control-flow edges.
fn escapes(func: &Function, bid: BlockId, var: VarId) -> bool {
    for block in &func.blocks {
        for instr in &block.instrs {
            if let Instr::Phi { incoming, .. } = instr {
                if incoming.iter().any(|(op, _)| op.as_var() == Some(var)) {
                    return true;
                }
            } else if block.id != bid {
                let mut used = false;
                for_each_use(instr, |v| used |= v == var);
                if used {
                    return true;
                }
            }
        }
        if block.id != bid {
            let mut used = false;
            for_each_use_terminator(&block.terminator, |v| used |= v == var);
            if used {
                return true;
            }
        }
    }
    false
}

fn has_uses(func: &Function, var: VarId) -> bool {
    for block in &func.blocks {
        for instr in &block.instrs {
            let mut used = false;
            for_each_use(instr, |v| used |= v == var);
            if used {
                return true;
            }
        }
        let mut used = false;
        for_each_use_terminator(&block.terminator, |v| used |= v == var);
        if used {
            return true;
        }
    }
    false
}

/// The function's shared trap block: a block holding nothing but an
/// `unreachable`. Reused when present, synthesized once otherwise.
fn unreachable_block(func: &mut Function) -> BlockId {
    for block in &func.blocks {
        if block.instrs.is_empty() && block.terminator == Terminator::Unreachable {
            return block.id;
        }
    }
    let id = func.fresh_block();
    func.blocks.push(Block {
        id,
        instrs: vec![],
        terminator: Terminator::Unreachable,
    });
    id
}
