//! Whole-program flattening.
//!
//! Repeatedly inlines functions into their callers until only the
//! designated entry remains. Eligibility follows the single-caller
//! policy: a defined, internal, non-entry function with exactly one
//! distinct calling function (and whose address never escapes) is spliced
//! into that caller. The call graph is re-derived after every single
//! action — inlining rewires call relationships for many functions at
//! once, so each decision is taken against current state, first eligible
//! in declaration order.
//!
//! Before splicing, duplicate call sites in the chosen caller are merged
//! (`merge_calls`) so exactly one physical site remains. A callee left
//! with no users afterwards is deleted.
//!
//! If the fixed point is reached while functions reachable from the entry
//! never became eligible (recursion, mutual blocking), the pass fails
//! rather than hand a partially flattened program onward. Functions
//! marked no-inline are a deliberate exclusion, not a stall; postcheck
//! reports them if they survive where they may not.

use crate::ir::{
    Block, BlockId, Callee, Const, FuncId, Function, Instr, Linkage, Module, Operand, Terminator,
    VarId,
};
use crate::passes::call_graph::{function_has_users, CallGraph};
use crate::passes::merge_calls;
use crate::passes::utils::{
    for_each_operand_mut, for_each_terminator_operand_mut, replace_uses_of,
    replace_uses_of_terminator, split_block_after,
};
use anyhow::{bail, Context, Result};
use tracing::debug;

/// Run the engine to its fixed point. Returns whether anything was
/// inlined.
pub fn run(module: &mut Module) -> Result<bool> {
    let mut modified_any = false;

    loop {
        let cg = CallGraph::build(module);
        let mut action: Option<(FuncId, FuncId)> = None;
        for func in &module.functions {
            if func.is_declaration() || func.is_entry || func.no_inline || func.intrinsic {
                continue;
            }
            if func.linkage != Linkage::Internal {
                continue; // may be called from outside the module
            }
            if cg.is_address_taken(func.id) {
                continue; // indirect uses cannot be rewritten
            }
            let callers: Vec<FuncId> = cg.callers(func.id).collect();
            if callers.len() == 1 && callers[0] != func.id {
                action = Some((func.id, callers[0]));
                break;
            }
        }
        let Some((callee, caller)) = action else { break };
        inline_function(module, callee, caller)?;
        modified_any = true;
    }

    // Progress check: reachable work that never became eligible is a
    // wedged configuration, not a quiet partial result.
    let cg = CallGraph::build(module);
    let entry = module
        .entry_function()
        .context("flatten: no entry function")?
        .id;
    let reachable = cg.reachable_from([entry]);
    for func in &module.functions {
        if func.id == entry || func.is_declaration() || func.intrinsic || func.no_inline {
            continue;
        }
        if reachable.contains(&func.id) {
            bail!(
                "flattening made no further progress: @{} is reachable from the entry \
                 but never became eligible for inlining",
                func.name
            );
        }
    }

    Ok(modified_any)
}

/// Inline `callee` into `caller`, merging duplicate call sites first so
/// there is exactly one physical site to splice.
fn inline_function(module: &mut Module, callee: FuncId, caller: FuncId) -> Result<()> {
    merge_calls::run(module, caller)?;

    let callee_fn = module
        .func(callee)
        .context("flatten: callee not found")?
        .clone();
    let caller_name = module
        .func(caller)
        .map(|f| f.name.clone())
        .unwrap_or_default();
    debug!(callee = %callee_fn.name, caller = %caller_name, "flatten: inlining");

    let func = module
        .func_mut(caller)
        .context("flatten: caller not found")?;

    let (bid, idx) = find_call(func, callee).context("flatten: merged call site not found")?;
    let Some(Instr::Call { dest, args, .. }) = func.block(bid).map(|b| b.instrs[idx].clone())
    else {
        bail!("flatten: call site is not a call");
    };
    if args.len() != callee_fn.params.len() {
        bail!(
            "call to @{} passes {} arguments but it takes {}",
            callee_fn.name,
            args.len(),
            callee_fn.params.len()
        );
    }

    // Rename the callee body into the caller's register and block spaces.
    let var_offset = func.next_var;
    let block_offset = func.next_block;
    func.next_var += callee_fn.next_var;
    func.next_block += callee_fn.next_block;
    let mut body: Vec<Block> = callee_fn
        .blocks
        .iter()
        .map(|b| remap_block(b, var_offset, block_offset))
        .collect();
    let inlined_entry = BlockId(callee_fn.entry_block.0 + block_offset);

    // Parameters become direct substitutions of the argument operands.
    for ((param, _), arg) in callee_fn.params.iter().zip(&args) {
        let renamed = VarId(param.0 + var_offset);
        for block in &mut body {
            for instr in &mut block.instrs {
                replace_uses_of(instr, renamed, arg);
            }
            replace_uses_of_terminator(&mut block.terminator, renamed, arg);
        }
    }

    // Split at the call; the continuation inherits the post-call logic.
    let cont = split_block_after(func, bid, idx);
    if let Some(b) = func.block_mut(bid) {
        b.instrs.pop(); // the call itself
        b.terminator = Terminator::Jump {
            target: inlined_entry,
        };
    }

    // Returns become jumps to the continuation, feeding a result join.
    let mut returned: Vec<(Operand, BlockId)> = Vec::new();
    for block in &mut body {
        if let Terminator::Return { value } = &block.terminator {
            if let Some(v) = value {
                returned.push((v.clone(), block.id));
            }
            block.terminator = Terminator::Jump { target: cont };
        }
    }

    if let Some(d) = dest {
        match returned.len() {
            0 => {
                // The callee never returns a value; any reader sits in
                // unreachable code.
                let ty = callee_fn
                    .ret
                    .clone()
                    .context("call has a result but callee returns void")?;
                let undef = Operand::Const(Const::Undef(ty));
                for block in &mut func.blocks {
                    for instr in &mut block.instrs {
                        replace_uses_of(instr, d, &undef);
                    }
                    replace_uses_of_terminator(&mut block.terminator, d, &undef);
                }
            }
            1 => {
                let value = returned[0].0.clone();
                for block in &mut func.blocks {
                    for instr in &mut block.instrs {
                        replace_uses_of(instr, d, &value);
                    }
                    replace_uses_of_terminator(&mut block.terminator, d, &value);
                }
                // The body's own uses were renamed already and never read
                // the caller's result register, so nothing more to do.
            }
            _ => {
                let ty = callee_fn
                    .ret
                    .clone()
                    .context("call has a result but callee returns void")?;
                if let Some(b) = func.block_mut(cont) {
                    b.instrs.insert(
                        0,
                        Instr::Phi {
                            dest: d,
                            ty,
                            incoming: returned.clone(),
                        },
                    );
                }
            }
        }
    }

    // Lay the body out between the call block and the continuation.
    let pos = func
        .block_index(bid)
        .context("flatten: call block vanished")?;
    for (i, block) in body.into_iter().enumerate() {
        func.blocks.insert(pos + 1 + i, block);
    }

    // Delete the callee once nothing refers to it anymore.
    if !function_has_users(module, callee) {
        debug!(callee = %callee_fn.name, "flatten: deleting fully inlined function");
        module.remove_function(callee);
    }
    Ok(())
}

fn find_call(func: &Function, callee: FuncId) -> Option<(BlockId, usize)> {
    for block in &func.blocks {
        for (i, instr) in block.instrs.iter().enumerate() {
            if matches!(instr, Instr::Call { callee: Callee::Direct(t), .. } if *t == callee) {
                return Some((block.id, i));
            }
        }
    }
    None
}

fn remap_block(block: &Block, var_offset: u32, block_offset: u32) -> Block {
    let remap_var = |v: VarId| VarId(v.0 + var_offset);
    let remap_bid = |b: BlockId| BlockId(b.0 + block_offset);

    let mut out = Block {
        id: remap_bid(block.id),
        instrs: block.instrs.clone(),
        terminator: block.terminator.clone(),
    };
    for instr in &mut out.instrs {
        // Destinations.
        match instr {
            Instr::BinOp { dest, .. }
            | Instr::Load { dest, .. }
            | Instr::Alloca { dest, .. }
            | Instr::ElemAddr { dest, .. }
            | Instr::Phi { dest, .. } => *dest = remap_var(*dest),
            Instr::Call { dest, .. } => {
                if let Some(d) = dest {
                    *d = remap_var(*d);
                }
            }
            Instr::Store { .. } => {}
        }
        // Operands.
        for_each_operand_mut(instr, |op| {
            if let Operand::Var(v) = op {
                *v = remap_var(*v);
            }
        });
        // Phi edges.
        if let Instr::Phi { incoming, .. } = instr {
            for (_, pred) in incoming.iter_mut() {
                *pred = remap_bid(*pred);
            }
        }
    }
    for_each_terminator_operand_mut(&mut out.terminator, |op| {
        if let Operand::Var(v) = op {
            *v = remap_var(*v);
        }
    });
    match &mut out.terminator {
        Terminator::Jump { target } => *target = remap_bid(*target),
        Terminator::BranchIf {
            if_true, if_false, ..
        } => {
            *if_true = remap_bid(*if_true);
            *if_false = remap_bid(*if_false);
        }
        Terminator::Switch { default, cases, .. } => {
            *default = remap_bid(*default);
            for (_, t) in cases.iter_mut() {
                *t = remap_bid(*t);
            }
        }
        Terminator::Return { .. } | Terminator::Unreachable => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn call_count(func: &Function) -> usize {
        func.blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .filter(|i| matches!(i, Instr::Call { .. }))
            .count()
    }

    #[test]
    fn single_caller_helper_is_spliced_and_deleted() {
        let mut m = parse_module(
            r#"
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %r = call @double(i32 21)
              ret %r
            }
            fn @double(%x: i32) -> i32 internal unnamed_addr {
            b0:
              %d = add i32 %x, %x
              ret %d
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert_eq!(m.functions.len(), 1);
        let main = m.func_by_name("main").unwrap();
        assert_eq!(call_count(main), 0);
        // The doubled add survives with the argument substituted in.
        let has_add = main.blocks.iter().flat_map(|b| b.instrs.iter()).any(|i| {
            matches!(
                i,
                Instr::BinOp {
                    lhs: Operand::Const(Const::Int { value: 21, .. }),
                    rhs: Operand::Const(Const::Int { value: 21, .. }),
                    ..
                }
            )
        });
        assert!(has_add, "inlined body should compute 21 + 21");
    }

    #[test]
    fn call_chain_flattens_to_entry() {
        let mut m = parse_module(
            r#"
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %r = call @outer(i32 1)
              ret %r
            }
            fn @outer(%x: i32) -> i32 internal unnamed_addr {
            b0:
              %r = call @inner(%x)
              %s = add i32 %r, i32 1
              ret %s
            }
            fn @inner(%x: i32) -> i32 internal unnamed_addr {
            b0:
              %r = mul i32 %x, i32 3
              ret %r
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert_eq!(m.functions.len(), 1);
        assert_eq!(call_count(m.func_by_name("main").unwrap()), 0);
    }

    #[test]
    fn multi_site_callee_is_merged_then_spliced() {
        let mut m = parse_module(
            r#"
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %a = call @f(i32 1)
              %b = call @f(i32 2)
              %r = add i32 %a, %b
              ret %r
            }
            fn @f(%x: i32) -> i32 internal unnamed_addr {
            b0:
              ret %x
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert_eq!(m.functions.len(), 1);
        let main = m.func_by_name("main").unwrap();
        assert_eq!(call_count(main), 0);
        // The merge dispatch survives the splice.
        assert!(main
            .blocks
            .iter()
            .any(|b| matches!(b.terminator, Terminator::Switch { .. })));
    }

    #[test]
    fn callee_with_branching_body_joins_at_continuation() {
        let mut m = parse_module(
            r#"
            fn @main(%n: i32) -> i32 entry local_unnamed_addr {
            b0:
              %r = call @clamp(%n)
              %s = add i32 %r, i32 100
              ret %s
            }
            fn @clamp(%x: i32) -> i32 internal unnamed_addr {
            b0:
              %neg = slt i32 %x, i32 0
              br %neg, zero, keep
            zero:
              ret i32 0
            keep:
              ret %x
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert_eq!(m.functions.len(), 1);
        let main = m.func_by_name("main").unwrap();
        // Two return paths feed a phi at the continuation.
        let phi = main
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .find_map(|i| match i {
                Instr::Phi { incoming, .. } => Some(incoming.len()),
                _ => None,
            });
        assert_eq!(phi, Some(2));
    }

    #[test]
    fn no_inline_function_is_skipped_without_error() {
        let mut m = parse_module(
            r#"
            fn @main() entry local_unnamed_addr {
            b0:
              call @stubborn()
              ret
            }
            fn @stubborn() internal noinline unnamed_addr {
            b0:
              ret
            }
            "#,
        )
        .unwrap();
        // Not an error here; postcheck reports the leftover function.
        assert!(!run(&mut m).unwrap());
        assert_eq!(m.functions.len(), 2);
    }

    #[test]
    fn self_recursion_is_a_progress_failure() {
        let mut m = parse_module(
            r#"
            fn @main() entry local_unnamed_addr {
            b0:
              call @loop_forever()
              ret
            }
            fn @loop_forever() internal unnamed_addr {
            b0:
              call @loop_forever()
              ret
            }
            "#,
        )
        .unwrap();
        let err = run(&mut m).unwrap_err();
        assert!(err.to_string().contains("no further progress"));
    }

    #[test]
    fn mutual_recursion_is_a_progress_failure() {
        let mut m = parse_module(
            r#"
            fn @main() entry local_unnamed_addr {
            b0:
              call @ping()
              ret
            }
            fn @ping() internal unnamed_addr {
            b0:
              call @pong()
              ret
            }
            fn @pong() internal unnamed_addr {
            b0:
              call @ping()
              ret
            }
            "#,
        )
        .unwrap();
        let err = run(&mut m).unwrap_err();
        assert!(err.to_string().contains("no further progress"));
    }

    #[test]
    fn address_taken_function_is_not_inlined() {
        let mut m = parse_module(
            r#"
            global @hook : ptr = @target external
            fn @main() entry local_unnamed_addr {
            b0:
              call @target()
              ret
            }
            fn @target() internal unnamed_addr {
            b0:
              ret
            }
            "#,
        )
        .unwrap();
        // target's address escapes through @hook, so inlining would leave
        // the escaped reference dangling; flatten refuses and reports the
        // stall instead.
        let err = run(&mut m).unwrap_err();
        assert!(err.to_string().contains("@target"));
    }

    #[test]
    fn diamond_becomes_single_function_in_two_rounds() {
        // main calls a and b; both call leaf. leaf is multi-caller until
        // a and b are inlined, then single-caller of main.
        let mut m = parse_module(
            r#"
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %x = call @a()
              %y = call @b()
              %r = add i32 %x, %y
              ret %r
            }
            fn @a() -> i32 internal unnamed_addr {
            b0:
              %v = call @leaf(i32 1)
              ret %v
            }
            fn @b() -> i32 internal unnamed_addr {
            b0:
              %v = call @leaf(i32 2)
              ret %v
            }
            fn @leaf(%x: i32) -> i32 internal unnamed_addr {
            b0:
              %r = mul i32 %x, i32 7
              ret %r
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert_eq!(m.functions.len(), 1);
        assert_eq!(call_count(m.func_by_name("main").unwrap()), 0);
    }
}
