//! Global-to-stack materialization.
//!
//! Every discardable global whose uses all reach back, transitively
//! through constant wrappers and sibling globals, to instructions of a
//! single function is moved onto that function's stack: one entry-block
//! alloca per global (keeping value type and alignment, named after the
//! global), a store of the initializer, and a rewrite of every reference.
//!
//! Compile-time address expressions over a migrating global cannot refer
//! to run-time storage, so they are first legalized into ordinary
//! `elemaddr` instructions at each point of use. Aggregate initializers
//! containing other migrating globals are split: the contained reference
//! is stored element-by-element and replaced by an undef placeholder in
//! the parent aggregate, so the parent's own store cannot resurrect a
//! value that now lives in a sibling's slot.

use crate::ir::{
    BlockId, Const, FuncId, Function, GlobalId, Instr, Module, Operand, Ty, VarId,
};
use crate::passes::utils::{
    entry_insertion_point, for_each_operand, for_each_operand_mut, for_each_terminator_operand,
    for_each_terminator_operand_mut,
};
use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Run the pass over the module. Returns whether anything was migrated.
pub fn run(module: &mut Module) -> Result<bool> {
    // Group eligible globals by their single using function, keeping
    // declaration order within each group and across groups.
    let mut order: Vec<FuncId> = Vec::new();
    let mut usage: HashMap<FuncId, Vec<GlobalId>> = HashMap::new();
    for global in &module.globals {
        if !global.is_discardable() {
            continue;
        }
        if let Some(owner) = using_function(module, global.id) {
            if !usage.contains_key(&owner) {
                order.push(owner);
            }
            usage.entry(owner).or_default().push(global.id);
        }
    }
    if order.is_empty() {
        return Ok(false);
    }
    for owner in order {
        let vars = usage.remove(&owner).unwrap_or_default();
        inline_globals(module, owner, &vars)?;
    }
    Ok(true)
}

/// Trace all users of `global`, through constant-expression and aggregate
/// wrappers and through sibling globals' initializers, to the single
/// function whose instructions use it.
///
/// Returns `None` when the global is unsafe to migrate: instruction users
/// in more than one function, an intermediate wrapper global that is
/// externally observable, or no instruction users at all.
fn using_function(module: &Module, global: GlobalId) -> Option<FuncId> {
    let mut owner: Option<FuncId> = None;
    let mut any_real_use = false;
    let mut worklist: Vec<GlobalId> = vec![global];
    let mut visited: HashSet<GlobalId> = HashSet::new();

    while let Some(g) = worklist.pop() {
        if !visited.insert(g) {
            continue;
        }

        // Instruction users: any operand whose constant tree reaches `g`.
        for func in &module.functions {
            let mut used_here = false;
            for block in &func.blocks {
                for instr in &block.instrs {
                    for_each_operand(instr, |op| {
                        if let Operand::Const(c) = op {
                            used_here |= c.mentions_global(g);
                        }
                    });
                }
                for_each_terminator_operand(&block.terminator, |op| {
                    if let Operand::Const(c) = op {
                        used_here |= c.mentions_global(g);
                    }
                });
            }
            if used_here {
                any_real_use = true;
                match owner {
                    None => owner = Some(func.id),
                    Some(f) if f == func.id => {}
                    Some(_) => return None, // conflicting owners
                }
            }
        }

        // Wrapper globals: a sibling whose initializer reaches `g` makes
        // its own users transitive users of `g`. An externally observable
        // wrapper cannot be rewritten.
        for sibling in &module.globals {
            if sibling.id == g {
                continue;
            }
            if let Some(init) = &sibling.init {
                if init.mentions_global(g) {
                    if !sibling.is_discardable() {
                        return None;
                    }
                    worklist.push(sibling.id);
                }
            }
        }
    }

    if any_real_use {
        owner
    } else {
        None
    }
}

struct SlotPlan {
    global: GlobalId,
    slot: VarId,
    ty: Ty,
    align: Option<u32>,
    name: String,
    init: Option<Const>,
}

fn inline_globals(module: &mut Module, owner: FuncId, vars: &[GlobalId]) -> Result<()> {
    let batch: HashSet<GlobalId> = vars.iter().copied().collect();

    // Take each initializer off its global so the value cannot be stored
    // twice, and record the alloca shape.
    let mut plans: Vec<SlotPlan> = Vec::new();
    for &gid in vars {
        let global = module.global_mut(gid).context("eligible global vanished")?;
        plans.push(SlotPlan {
            global: gid,
            slot: VarId(0), // assigned below
            ty: global.ty.clone(),
            align: global.align,
            name: global.name.clone(),
            init: global.init.take(),
        });
    }

    let func = module.func_mut(owner).context("owning function vanished")?;
    let entry = func.entry_block;
    let at = entry_insertion_point(func);

    // Step one: bring all slots into the function. All allocas precede
    // all initializer stores; element stores from aggregate splitting
    // directly follow their parent store.
    let mut allocas: Vec<Instr> = Vec::new();
    let mut stores: Vec<Instr> = Vec::new();
    for plan in &mut plans {
        plan.slot = func.fresh_var();
        allocas.push(Instr::Alloca {
            dest: plan.slot,
            ty: plan.ty.clone(),
            align: plan.align,
            name: Some(plan.name.clone()),
        });
        if let Some(init) = plan.init.take() {
            let mut element_stores: Vec<Instr> = Vec::new();
            let init = disaggregate(
                func,
                plan.slot,
                &plan.ty,
                init,
                &mut Vec::new(),
                &batch,
                &mut element_stores,
            );
            stores.push(Instr::Store {
                value: Operand::Const(init),
                addr: Operand::Var(plan.slot),
            });
            stores.extend(element_stores);
        }
        debug!(global = %plan.name, slot = %plan.slot, "global_to_stack: migrating");
    }
    if let Some(block) = func.block_mut(entry) {
        block.instrs.splice(at..at, allocas.into_iter().chain(stores));
    }

    // Step two: legalize constant expressions over each global, then
    // replace the remaining direct references with the slot.
    for plan in &plans {
        legalize_const_exprs(func, plan.global);
        replace_global(func, plan.global, plan.slot);
    }

    // Invariant: nothing in the module may still reach a migrated global.
    for plan in &plans {
        if let Some(place) = find_residual(module, plan.global) {
            bail!(
                "global @{} still referenced after materialization ({})",
                plan.name,
                place
            );
        }
    }
    for plan in &plans {
        module.remove_global(plan.global);
    }
    Ok(())
}

/// Split aggregate-initializer elements that reference other migrating
/// globals (or constant expressions) into element-addressed stores,
/// returning the parent constant with those elements replaced by undef.
///
/// `out` receives the `elemaddr`/`store` pairs in element order, to be
/// placed directly after the parent store.
fn disaggregate(
    func: &mut Function,
    slot: VarId,
    slot_ty: &Ty,
    c: Const,
    idx: &mut Vec<u32>,
    batch: &HashSet<GlobalId>,
    out: &mut Vec<Instr>,
) -> Const {
    let Const::Aggregate { ty, elems } = c else {
        return c;
    };
    let mut to_undef: Vec<Const> = Vec::new();
    let mut new_elems: Vec<Const> = Vec::with_capacity(elems.len());
    for (i, elem) in elems.into_iter().enumerate() {
        idx.push(i as u32);
        let kept = match elem {
            Const::Aggregate { .. } => disaggregate(func, slot, slot_ty, elem, idx, batch, out),
            Const::ElemAddr { .. } => {
                emit_element_store(func, slot, slot_ty, idx, &elem, out);
                to_undef.push(elem.clone());
                elem
            }
            Const::GlobalAddr(g) if batch.contains(&g) => {
                let elem = Const::GlobalAddr(g);
                emit_element_store(func, slot, slot_ty, idx, &elem, out);
                to_undef.push(elem.clone());
                elem
            }
            other => other,
        };
        idx.pop();
        new_elems.push(kept);
    }
    let new_elems = new_elems
        .into_iter()
        .map(|e| {
            if to_undef.contains(&e) {
                Const::Undef(e.ty())
            } else {
                e
            }
        })
        .collect();
    Const::Aggregate {
        ty,
        elems: new_elems,
    }
}

fn emit_element_store(
    func: &mut Function,
    slot: VarId,
    slot_ty: &Ty,
    idx: &[u32],
    value: &Const,
    out: &mut Vec<Instr>,
) {
    let addr = func.fresh_var();
    out.push(Instr::ElemAddr {
        dest: addr,
        base_ty: slot_ty.clone(),
        base: Operand::Var(slot),
        indices: idx.to_vec(),
    });
    out.push(Instr::Store {
        value: Operand::Const(value.clone()),
        addr: Operand::Var(addr),
    });
}

/// Rewrite every constant-expression operand that reaches `global` into
/// ordinary instructions, innermost expression first, placed directly
/// before the use. Phi operands materialize at the end of the incoming
/// block, terminator operands at the end of their own block.
fn legalize_const_exprs(func: &mut Function, global: GlobalId) {
    let block_ids: Vec<BlockId> = func.blocks.iter().map(|b| b.id).collect();
    for bid in block_ids {
        let mut i = 0;
        loop {
            let Some(block) = func.block(bid) else { break };
            if i >= block.instrs.len() {
                break;
            }
            if let Instr::Phi { incoming, .. } = &block.instrs[i] {
                // Materialize per incoming edge.
                let edges: Vec<(usize, Const, BlockId)> = incoming
                    .iter()
                    .enumerate()
                    .filter_map(|(k, (op, pred))| match op {
                        Operand::Const(c @ Const::ElemAddr { .. }) if c.mentions_global(global) => {
                            Some((k, c.clone(), *pred))
                        }
                        _ => None,
                    })
                    .collect();
                for (k, expr, pred) in edges {
                    let mut chain = Vec::new();
                    let new_op = materialize_expr(func, &expr, &mut chain);
                    if let Some(pred_block) = func.block_mut(pred) {
                        pred_block.instrs.extend(chain);
                    }
                    if let Some(block) = func.block_mut(bid) {
                        if let Instr::Phi { incoming, .. } = &mut block.instrs[i] {
                            incoming[k].0 = new_op;
                        }
                    }
                }
                i += 1;
                continue;
            }

            // Non-phi: lift the first qualifying operand, then rescan the
            // same instruction for further expressions.
            let mut found: Option<Const> = None;
            for_each_operand(&block.instrs[i], |op| {
                if found.is_none() {
                    if let Operand::Const(c @ Const::ElemAddr { .. }) = op {
                        if c.mentions_global(global) {
                            found = Some(c.clone());
                        }
                    }
                }
            });
            let Some(expr) = found else {
                i += 1;
                continue;
            };
            let mut chain = Vec::new();
            let new_op = materialize_expr(func, &expr, &mut chain);
            let lifted = chain.len();
            if let Some(block) = func.block_mut(bid) {
                block.instrs.splice(i..i, chain);
                let target = &mut block.instrs[i + lifted];
                for_each_operand_mut(target, |op| {
                    if *op == Operand::Const(expr.clone()) {
                        *op = new_op.clone();
                    }
                });
            }
            i += lifted;
        }

        // Terminator operand.
        loop {
            let Some(block) = func.block(bid) else { break };
            let mut found: Option<Const> = None;
            for_each_terminator_operand(&block.terminator, |op| {
                if found.is_none() {
                    if let Operand::Const(c @ Const::ElemAddr { .. }) = op {
                        if c.mentions_global(global) {
                            found = Some(c.clone());
                        }
                    }
                }
            });
            let Some(expr) = found else { break };
            let mut chain = Vec::new();
            let new_op = materialize_expr(func, &expr, &mut chain);
            if let Some(block) = func.block_mut(bid) {
                block.instrs.extend(chain);
                for_each_terminator_operand_mut(&mut block.terminator, |op| {
                    if *op == Operand::Const(expr.clone()) {
                        *op = new_op.clone();
                    }
                });
            }
        }
    }
}

/// Emit the instruction chain computing a constant address expression,
/// innermost first. Non-expression leaves stay as constants.
fn materialize_expr(func: &mut Function, c: &Const, out: &mut Vec<Instr>) -> Operand {
    match c {
        Const::ElemAddr {
            base_ty,
            base,
            indices,
        } => {
            let base_op = materialize_expr(func, base, out);
            let dest = func.fresh_var();
            out.push(Instr::ElemAddr {
                dest,
                base_ty: base_ty.clone(),
                base: base_op,
                indices: indices.clone(),
            });
            Operand::Var(dest)
        }
        other => Operand::Const(other.clone()),
    }
}

/// Replace every remaining direct reference to `global` with the slot.
fn replace_global(func: &mut Function, global: GlobalId, slot: VarId) {
    let target = Operand::Const(Const::GlobalAddr(global));
    for block in &mut func.blocks {
        for instr in &mut block.instrs {
            for_each_operand_mut(instr, |op| {
                if *op == target {
                    *op = Operand::Var(slot);
                }
            });
        }
        for_each_terminator_operand_mut(&mut block.terminator, |op| {
            if *op == target {
                *op = Operand::Var(slot);
            }
        });
    }
}

/// First place in the module that still reaches `global`, if any.
fn find_residual(module: &Module, global: GlobalId) -> Option<String> {
    for func in &module.functions {
        let mut hit = false;
        for block in &func.blocks {
            for instr in &block.instrs {
                for_each_operand(instr, |op| {
                    if let Operand::Const(c) = op {
                        hit |= c.mentions_global(global);
                    }
                });
            }
            for_each_terminator_operand(&block.terminator, |op| {
                if let Operand::Const(c) = op {
                    hit |= c.mentions_global(global);
                }
            });
        }
        if hit {
            return Some(format!("function @{}", func.name));
        }
    }
    for sibling in &module.globals {
        if sibling.id == global {
            continue;
        }
        if let Some(init) = &sibling.init {
            if init.mentions_global(global) {
                return Some(format!("initializer of @{}", sibling.name));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    #[test]
    fn scalar_global_becomes_entry_slot() {
        let mut m = parse_module(
            r#"
            global @counter : i32 = i32 7 internal align 4
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %v = load i32, @counter
              %w = add i32 %v, i32 1
              store %w, @counter
              ret %w
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert!(m.globals.is_empty());

        let f = m.func_by_name("main").unwrap();
        let b0 = &f.blocks[0];
        let slot = match &b0.instrs[0] {
            Instr::Alloca {
                dest,
                ty: Ty::I32,
                align: Some(4),
                name: Some(n),
            } if n == "counter" => *dest,
            other => panic!("expected named alloca, got {:?}", other),
        };
        assert_eq!(
            b0.instrs[1],
            Instr::Store {
                value: Operand::Const(Const::Int { ty: Ty::I32, value: 7 }),
                addr: Operand::Var(slot),
            }
        );
        // The load now reads the slot.
        assert!(matches!(
            &b0.instrs[2],
            Instr::Load { addr: Operand::Var(s), .. } if *s == slot
        ));
    }

    #[test]
    fn global_used_from_two_functions_is_left_alone() {
        let mut m = parse_module(
            r#"
            global @shared : i32 = i32 1 internal
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %v = load i32, @shared
              %w = call @helper()
              %x = add i32 %v, %w
              ret %x
            }
            fn @helper() -> i32 internal unnamed_addr {
            b0:
              %v = load i32, @shared
              ret %v
            }
            "#,
        )
        .unwrap();
        assert!(!run(&mut m).unwrap());
        assert_eq!(m.globals.len(), 1);
    }

    #[test]
    fn external_global_is_left_alone() {
        let mut m = parse_module(
            r#"
            global @api_state : i32 = i32 0 external
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %v = load i32, @api_state
              ret %v
            }
            "#,
        )
        .unwrap();
        assert!(!run(&mut m).unwrap());
        assert_eq!(m.globals.len(), 1);
    }

    #[test]
    fn constant_expressions_are_legalized() {
        let mut m = parse_module(
            r#"
            global @pair : {i32, i32} = { i32 1, i32 2 } internal
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %v = load i32, elemaddr({i32, i32}, @pair, 1)
              ret %v
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert!(m.globals.is_empty());
        let f = m.func_by_name("main").unwrap();
        let b0 = &f.blocks[0];
        // alloca, init store, elemaddr instruction, load via register.
        let slot = match &b0.instrs[0] {
            Instr::Alloca { dest, .. } => *dest,
            other => panic!("expected alloca, got {:?}", other),
        };
        let addr = match &b0.instrs[2] {
            Instr::ElemAddr {
                dest,
                base,
                indices,
                ..
            } => {
                assert_eq!(*base, Operand::Var(slot));
                assert_eq!(indices, &vec![1]);
                *dest
            }
            other => panic!("expected elemaddr instruction, got {:?}", other),
        };
        assert!(matches!(
            &b0.instrs[3],
            Instr::Load { addr: Operand::Var(a), .. } if *a == addr
        ));
    }

    #[test]
    fn nested_const_expr_chain_is_fully_lifted() {
        let mut m = parse_module(
            r#"
            global @grid : {ptr, i32} = { elemaddr({i32, i32}, @cell, 0), i32 9 } internal
            global @cell : {i32, i32} = { i32 3, i32 4 } internal
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %p = load ptr, elemaddr({ptr, i32}, @grid, 0)
              %v = load i32, %p
              ret %v
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert!(m.globals.is_empty());
        // No constant expressions may survive anywhere.
        let f = m.func_by_name("main").unwrap();
        for block in &f.blocks {
            for instr in &block.instrs {
                for_each_operand(instr, |op| {
                    assert!(
                        !matches!(op, Operand::Const(Const::ElemAddr { .. })),
                        "surviving constant expression: {:?}",
                        instr
                    );
                });
            }
        }
    }

    #[test]
    fn mutually_referencing_aggregates_are_split() {
        // The classic circular shape: two structs holding each other's
        // address, both used only from main.
        let mut m = parse_module(
            r#"
            global @a : {i32, i32, ptr, i32} = { i32 100, i32 10, @b, i32 1 } internal
            global @b : {i32, i32, ptr, i32} = { i32 200, i32 20, @a, i32 2 } internal
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %pa = elemaddr {i32, i32, ptr, i32}, @a, 2
              %va = load ptr, %pa
              %pb = elemaddr {i32, i32, ptr, i32}, @b, 2
              %vb = load ptr, %pb
              %cmp = ne ptr %va, %vb
              ret %cmp
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert!(m.globals.is_empty());

        let f = m.func_by_name("main").unwrap();
        let b0 = &f.blocks[0];

        // Two named slots.
        let slots: Vec<VarId> = b0
            .instrs
            .iter()
            .filter_map(|i| match i {
                Instr::Alloca { dest, .. } => Some(*dest),
                _ => None,
            })
            .collect();
        assert_eq!(slots.len(), 2);

        // Each aggregate store carries an undef placeholder at index 2.
        let agg_stores: Vec<&Const> = b0
            .instrs
            .iter()
            .filter_map(|i| match i {
                Instr::Store {
                    value: Operand::Const(c @ Const::Aggregate { .. }),
                    ..
                } => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(agg_stores.len(), 2);
        for c in agg_stores {
            let Const::Aggregate { elems, .. } = c else {
                unreachable!()
            };
            assert!(
                matches!(elems[2], Const::Undef(Ty::Ptr)),
                "pointer element should be a placeholder, got {:?}",
                elems[2]
            );
        }

        // Each split store writes the sibling slot's address into the
        // placeholder position.
        let elem_stores: Vec<(&Operand, &Operand)> = b0
            .instrs
            .iter()
            .filter_map(|i| match i {
                Instr::Store {
                    value: value @ Operand::Var(_),
                    addr,
                } => Some((value, addr)),
                _ => None,
            })
            .collect();
        assert_eq!(elem_stores.len(), 2);
        for (value, _) in elem_stores {
            let Operand::Var(v) = value else { unreachable!() };
            assert!(slots.contains(v), "element store should write a slot address");
        }
    }

    #[test]
    fn running_twice_is_a_no_op() {
        let mut m = parse_module(
            r#"
            global @counter : i32 = i32 7 internal
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %v = load i32, @counter
              ret %v
            }
            "#,
        )
        .unwrap();
        assert!(run(&mut m).unwrap());
        assert!(!run(&mut m).unwrap());
    }
}
