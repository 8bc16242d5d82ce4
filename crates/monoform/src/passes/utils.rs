//! Shared utility functions for the transformation passes.
//!
//! Provides common operations on instructions, terminators and control
//! flow that are needed by more than one pass: successor/predecessor
//! queries, use/def traversal and substitution, block splitting, register
//! type inference, and demotion of a register to an addressable slot.

use crate::ir::{
    Block, BlockId, Callee, Const, Function, Instr, Module, Operand, Terminator, Ty, VarId,
};
use std::collections::{HashMap, HashSet};

// ── Terminator successors ────────────────────────────────────────────────────

/// Returns the successor block IDs for a terminator.
pub fn terminator_successors(term: &Terminator) -> Vec<BlockId> {
    match term {
        Terminator::Return { .. } | Terminator::Unreachable => vec![],
        Terminator::Jump { target } => vec![*target],
        Terminator::BranchIf {
            if_true, if_false, ..
        } => vec![*if_true, *if_false],
        Terminator::Switch { default, cases, .. } => cases
            .iter()
            .map(|(_, b)| *b)
            .chain(std::iter::once(*default))
            .collect(),
    }
}

/// Rewrite all block-ID references in a terminator from `old` to `new`.
pub fn rewrite_terminator_target(term: &mut Terminator, old: BlockId, new: BlockId) {
    match term {
        Terminator::Jump { target } => {
            if *target == old {
                *target = new;
            }
        }
        Terminator::BranchIf {
            if_true, if_false, ..
        } => {
            if *if_true == old {
                *if_true = new;
            }
            if *if_false == old {
                *if_false = new;
            }
        }
        Terminator::Switch { default, cases, .. } => {
            for (_, t) in cases.iter_mut() {
                if *t == old {
                    *t = new;
                }
            }
            if *default == old {
                *default = new;
            }
        }
        Terminator::Return { .. } | Terminator::Unreachable => {}
    }
}

// ── Predecessor map ──────────────────────────────────────────────────────────

/// Build a map from each block ID to the set of *distinct* predecessor
/// block IDs.
pub fn build_predecessors(func: &Function) -> HashMap<BlockId, HashSet<BlockId>> {
    let mut preds: HashMap<BlockId, HashSet<BlockId>> = HashMap::new();
    // Ensure every block has an entry (even if no predecessors).
    for block in &func.blocks {
        preds.entry(block.id).or_default();
    }
    for block in &func.blocks {
        for succ in terminator_successors(&block.terminator) {
            preds.entry(succ).or_default().insert(block.id);
        }
    }
    preds
}

// ── Operand traversal ────────────────────────────────────────────────────────

/// Calls `f` with every operand of `instr`, in place.
pub fn for_each_operand_mut<F: FnMut(&mut Operand)>(instr: &mut Instr, mut f: F) {
    match instr {
        Instr::BinOp { lhs, rhs, .. } => {
            f(lhs);
            f(rhs);
        }
        Instr::Load { addr, .. } => f(addr),
        Instr::Store { value, addr } => {
            f(value);
            f(addr);
        }
        Instr::Alloca { .. } => {}
        Instr::ElemAddr { base, .. } => f(base),
        Instr::Phi { incoming, .. } => {
            for (op, _) in incoming.iter_mut() {
                f(op);
            }
        }
        Instr::Call { callee, args, .. } => {
            if let Callee::Indirect { ptr, .. } = callee {
                f(ptr);
            }
            for a in args.iter_mut() {
                f(a);
            }
        }
    }
}

/// Calls `f` with every operand of `instr`.
pub fn for_each_operand<F: FnMut(&Operand)>(instr: &Instr, mut f: F) {
    match instr {
        Instr::BinOp { lhs, rhs, .. } => {
            f(lhs);
            f(rhs);
        }
        Instr::Load { addr, .. } => f(addr),
        Instr::Store { value, addr } => {
            f(value);
            f(addr);
        }
        Instr::Alloca { .. } => {}
        Instr::ElemAddr { base, .. } => f(base),
        Instr::Phi { incoming, .. } => {
            for (op, _) in incoming.iter() {
                f(op);
            }
        }
        Instr::Call { callee, args, .. } => {
            if let Callee::Indirect { ptr, .. } = callee {
                f(ptr);
            }
            for a in args.iter() {
                f(a);
            }
        }
    }
}

/// Calls `f` with every register read by `instr`.
pub fn for_each_use<F: FnMut(VarId)>(instr: &Instr, mut f: F) {
    for_each_operand(instr, |op| {
        if let Operand::Var(v) = op {
            f(*v);
        }
    });
}

/// Calls `f` with every operand of a block terminator, in place.
pub fn for_each_terminator_operand_mut<F: FnMut(&mut Operand)>(term: &mut Terminator, mut f: F) {
    match term {
        Terminator::Return { value: Some(v) } => f(v),
        Terminator::BranchIf { condition, .. } => f(condition),
        Terminator::Switch { value, .. } => f(value),
        Terminator::Return { value: None } | Terminator::Jump { .. } | Terminator::Unreachable => {}
    }
}

/// Calls `f` with every operand of a block terminator.
pub fn for_each_terminator_operand<F: FnMut(&Operand)>(term: &Terminator, mut f: F) {
    match term {
        Terminator::Return { value: Some(v) } => f(v),
        Terminator::BranchIf { condition, .. } => f(condition),
        Terminator::Switch { value, .. } => f(value),
        Terminator::Return { value: None } | Terminator::Jump { .. } | Terminator::Unreachable => {}
    }
}

/// Calls `f` with every register read by a block terminator.
pub fn for_each_use_terminator<F: FnMut(VarId)>(term: &Terminator, mut f: F) {
    for_each_terminator_operand(term, |op| {
        if let Operand::Var(v) = op {
            f(*v);
        }
    });
}

// ── Instruction destination ──────────────────────────────────────────────────

/// Returns the register written by `instr`, or `None` for side-effect-only
/// instructions.
pub fn instr_dest(instr: &Instr) -> Option<VarId> {
    match instr {
        Instr::BinOp { dest, .. }
        | Instr::Load { dest, .. }
        | Instr::Alloca { dest, .. }
        | Instr::ElemAddr { dest, .. }
        | Instr::Phi { dest, .. } => Some(*dest),
        Instr::Call { dest, .. } => *dest,
        Instr::Store { .. } => None,
    }
}

// ── Use replacement ──────────────────────────────────────────────────────────

/// Replace every read of register `old` in `instr` with `new`.
/// Only operand (source) slots are touched; the destination never is.
pub fn replace_uses_of(instr: &mut Instr, old: VarId, new: &Operand) {
    for_each_operand_mut(instr, |op| {
        if op.as_var() == Some(old) {
            *op = new.clone();
        }
    });
}

/// Replace every read of register `old` in `term` with `new`.
pub fn replace_uses_of_terminator(term: &mut Terminator, old: VarId, new: &Operand) {
    for_each_terminator_operand_mut(term, |op| {
        if op.as_var() == Some(old) {
            *op = new.clone();
        }
    });
}

// ── Register type inference ──────────────────────────────────────────────────

/// Compute the type of every register defined in `func`, from parameters
/// and instruction results. `module` is needed to resolve direct-call
/// return types.
pub fn var_types(func: &Function, module: &Module) -> HashMap<VarId, Ty> {
    let mut types: HashMap<VarId, Ty> = func.params.iter().cloned().collect();
    for block in &func.blocks {
        for instr in &block.instrs {
            match instr {
                Instr::BinOp { dest, op, ty, .. } => {
                    types.insert(*dest, op.result_ty(ty));
                }
                Instr::Load { dest, ty, .. } => {
                    types.insert(*dest, ty.clone());
                }
                Instr::Alloca { dest, .. } | Instr::ElemAddr { dest, .. } => {
                    types.insert(*dest, Ty::Ptr);
                }
                Instr::Phi { dest, ty, .. } => {
                    types.insert(*dest, ty.clone());
                }
                Instr::Call { dest: Some(dest), callee, .. } => {
                    let ret = match callee {
                        Callee::Direct(fid) => module.func(*fid).and_then(|f| f.ret.clone()),
                        Callee::Indirect { ret, .. } | Callee::Asm { ret, .. } => ret.clone(),
                    };
                    if let Some(ty) = ret {
                        types.insert(*dest, ty);
                    }
                }
                Instr::Call { dest: None, .. } | Instr::Store { .. } => {}
            }
        }
    }
    types
}

/// The type of an operand, given the register type map.
pub fn operand_ty(op: &Operand, types: &HashMap<VarId, Ty>) -> Option<Ty> {
    match op {
        Operand::Var(v) => types.get(v).cloned(),
        Operand::Const(c) => Some(c.ty()),
    }
}

// ── Block splitting ──────────────────────────────────────────────────────────

/// Split `block` immediately after the instruction at `index`.
///
/// The original block keeps `instrs[..=index]` and ends with a `Jump` to
/// the new continuation block, which receives the remaining instructions
/// and the original terminator. The continuation is laid out directly
/// after the original block. Phi nodes in successor blocks that named the
/// original block as an incoming edge are retargeted to the continuation,
/// since control now arrives from there.
///
/// Returns the continuation's id.
pub fn split_block_after(func: &mut Function, block: BlockId, index: usize) -> BlockId {
    let cont_id = func.fresh_block();
    let pos = func
        .block_index(block)
        .expect("split_block_after: block not in function");

    let b = &mut func.blocks[pos];
    let rest = b.instrs.split_off(index + 1);
    let term = std::mem::replace(&mut b.terminator, Terminator::Jump { target: cont_id });

    // Successor phis must now name the continuation as the incoming edge.
    for succ in terminator_successors(&term) {
        if let Some(sb) = func.block_mut(succ) {
            for instr in &mut sb.instrs {
                if let Instr::Phi { incoming, .. } = instr {
                    for (_, pred) in incoming.iter_mut() {
                        if *pred == block {
                            *pred = cont_id;
                        }
                    }
                }
            }
        }
    }

    func.blocks.insert(
        pos + 1,
        Block {
            id: cont_id,
            instrs: rest,
            terminator: term,
        },
    );
    cont_id
}

// ── Register demotion ────────────────────────────────────────────────────────

/// Position of the first non-alloca instruction in the entry block.
pub fn entry_insertion_point(func: &Function) -> usize {
    func.block(func.entry_block)
        .map(|b| {
            b.instrs
                .iter()
                .position(|i| !matches!(i, Instr::Alloca { .. }))
                .unwrap_or(b.instrs.len())
        })
        .unwrap_or(0)
}

/// Demote register `var` of type `ty` to an addressable slot.
///
/// Allocates a slot in the entry block, stores `var` into it immediately
/// after its definition (or after the entry allocas for parameters), and
/// replaces every other read with a fresh load placed directly before the
/// reading instruction. Reads by terminators load at the end of the
/// reading block; reads by phis load at the end of the incoming block,
/// since the value must be available on that edge.
///
/// Returns the slot register.
pub fn demote_to_slot(func: &mut Function, var: VarId, ty: Ty) -> VarId {
    let slot = func.fresh_var();
    let entry = func.entry_block;
    let alloca_at = entry_insertion_point(func);

    // Locate the definition.
    let mut def_site: Option<(BlockId, usize)> = None;
    for block in &func.blocks {
        if let Some(i) = block.instrs.iter().position(|ins| instr_dest(ins) == Some(var)) {
            def_site = Some((block.id, i));
            break;
        }
    }

    // Collect reads before mutating anything. Phi reads are keyed by the
    // incoming block instead of the phi's own position.
    let mut instr_reads: HashMap<BlockId, Vec<usize>> = HashMap::new();
    let mut term_reads: Vec<BlockId> = vec![];
    let mut phi_edge_reads: Vec<BlockId> = vec![];
    for block in &func.blocks {
        for (i, instr) in block.instrs.iter().enumerate() {
            if Some((block.id, i)) == def_site {
                continue;
            }
            if let Instr::Phi { incoming, .. } = instr {
                for (op, pred) in incoming {
                    if op.as_var() == Some(var) {
                        phi_edge_reads.push(*pred);
                    }
                }
            } else {
                let mut reads = false;
                for_each_use(instr, |v| reads |= v == var);
                if reads {
                    instr_reads.entry(block.id).or_default().push(i);
                }
            }
        }
        let mut reads = false;
        for_each_use_terminator(&block.terminator, |v| reads |= v == var);
        if reads {
            term_reads.push(block.id);
        }
    }

    // Slot allocation, then the store after the definition.
    if let Some(b) = func.block_mut(entry) {
        b.instrs.insert(
            alloca_at,
            Instr::Alloca {
                dest: slot,
                ty: ty.clone(),
                align: None,
                name: None,
            },
        );
    }
    let store = Instr::Store {
        value: Operand::Var(var),
        addr: Operand::Var(slot),
    };
    match def_site {
        Some((def_block, def_idx)) => {
            // The alloca may have shifted the definition in the entry block.
            let shift = usize::from(def_block == entry && def_idx >= alloca_at);
            if let Some(b) = func.block_mut(def_block) {
                b.instrs.insert(def_idx + shift + 1, store);
            }
        }
        None => {
            // Parameter: store right after the entry allocas.
            let at = entry_insertion_point(func);
            if let Some(b) = func.block_mut(entry) {
                b.instrs.insert(at, store);
            }
        }
    }

    // Rewrite instruction reads, inserting a load directly before each
    // reader. Indices were collected pre-mutation, so adjust for the
    // entry-block inserts and process each block back to front.
    let mut loads_for_edges: HashMap<BlockId, VarId> = HashMap::new();
    let block_ids: Vec<BlockId> = func.blocks.iter().map(|b| b.id).collect();
    for bid in block_ids {
        let inserted_before = |i: usize| {
            let mut n = 0;
            if bid == entry && i >= alloca_at {
                n += 1; // the slot alloca
            }
            if let Some((def_block, def_idx)) = def_site {
                // `i` and `def_idx` are both pre-mutation indices.
                if bid == def_block && i > def_idx {
                    n += 1; // the store after the definition
                }
            } else if bid == entry && i >= alloca_at {
                n += 1; // the parameter store
            }
            n
        };

        if let Some(mut indices) = instr_reads.remove(&bid) {
            indices.sort_unstable_by(|a, b| b.cmp(a));
            for i in indices {
                let at = i + inserted_before(i);
                let loaded = func.fresh_var();
                let b = func.block_mut(bid).expect("block disappeared during demotion");
                b.instrs.insert(
                    at,
                    Instr::Load {
                        dest: loaded,
                        ty: ty.clone(),
                        addr: Operand::Var(slot),
                    },
                );
                replace_uses_of(&mut b.instrs[at + 1], var, &Operand::Var(loaded));
            }
        }

        if term_reads.contains(&bid) {
            let loaded = func.fresh_var();
            let b = func.block_mut(bid).expect("block disappeared during demotion");
            b.instrs.push(Instr::Load {
                dest: loaded,
                ty: ty.clone(),
                addr: Operand::Var(slot),
            });
            replace_uses_of_terminator(&mut b.terminator, var, &Operand::Var(loaded));
        }
    }

    // Phi reads: load at the end of each incoming block, one load per edge
    // block, then point the phi operand at it.
    for pred in phi_edge_reads {
        let loaded = *loads_for_edges.entry(pred).or_insert_with(|| {
            let loaded = func.fresh_var();
            let b = func
                .block_mut(pred)
                .expect("phi names a predecessor not in function");
            b.instrs.push(Instr::Load {
                dest: loaded,
                ty: ty.clone(),
                addr: Operand::Var(slot),
            });
            loaded
        });
        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                if let Instr::Phi { incoming, .. } = instr {
                    for (op, p) in incoming.iter_mut() {
                        if *p == pred && op.as_var() == Some(var) {
                            *op = Operand::Var(loaded);
                        }
                    }
                }
            }
        }
    }

    slot
}

// ── Tests ────────────────────────────────────────────────────────────────────
