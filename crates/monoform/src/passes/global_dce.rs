//! Dead symbol elimination.
//!
//! Removes functions unreachable from the liveness roots and discardable
//! globals nothing references. Roots are the designated entry, defined
//! externally-visible functions, ctor/dtor table entries, and
//! non-discardable globals. Call edges and address-taking both count as
//! references, as do references from a live global's initializer.
//!
//! The later passes assume this has run: a helper that is never called
//! cannot be flattened away and an unreferenced discardable global has no
//! owning function to migrate into, so both would otherwise survive to
//! postcheck and fail it.

use crate::ir::{Callee, Const, FuncId, GlobalId, Instr, Module, Operand};
use crate::passes::utils::{for_each_operand, for_each_terminator_operand};
use anyhow::Result;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Item {
    Func(FuncId),
    Global(GlobalId),
}

fn collect_symbol_refs(c: &Const, out: &mut Vec<Item>) {
    match c {
        Const::FuncAddr(f) => out.push(Item::Func(*f)),
        Const::GlobalAddr(g) => out.push(Item::Global(*g)),
        Const::Aggregate { elems, .. } => {
            for e in elems {
                collect_symbol_refs(e, out);
            }
        }
        Const::ElemAddr { base, .. } => collect_symbol_refs(base, out),
        _ => {}
    }
}

/// Run dead symbol elimination. Returns whether anything was removed.
pub fn run(module: &mut Module) -> Result<bool> {
    // Phase 1: seed the worklist with the liveness roots.
    let mut worklist: VecDeque<Item> = VecDeque::new();
    for func in &module.functions {
        let externally_callable =
            func.is_entry || (!func.is_declaration() && func.linkage == crate::ir::Linkage::External);
        if externally_callable {
            worklist.push_back(Item::Func(func.id));
        }
    }
    for entry in module.ctors.iter().chain(module.dtors.iter()) {
        worklist.push_back(Item::Func(entry.func));
    }
    for global in &module.globals {
        if !global.is_discardable() {
            worklist.push_back(Item::Global(global.id));
        }
    }

    // Phase 2: propagate liveness through call edges, escaped addresses
    // and initializer references.
    let mut live: HashSet<Item> = HashSet::new();
    while let Some(item) = worklist.pop_front() {
        if !live.insert(item) {
            continue;
        }
        let mut refs: Vec<Item> = Vec::new();
        match item {
            Item::Func(id) => {
                let Some(func) = module.func(id) else { continue };
                for block in &func.blocks {
                    for instr in &block.instrs {
                        if let Instr::Call {
                            callee: Callee::Direct(target),
                            ..
                        } = instr
                        {
                            refs.push(Item::Func(*target));
                        }
                        for_each_operand(instr, |op| {
                            if let Operand::Const(c) = op {
                                collect_symbol_refs(c, &mut refs);
                            }
                        });
                    }
                    for_each_terminator_operand(&block.terminator, |op| {
                        if let Operand::Const(c) = op {
                            collect_symbol_refs(c, &mut refs);
                        }
                    });
                }
            }
            Item::Global(id) => {
                let Some(global) = module.global(id) else { continue };
                if let Some(init) = &global.init {
                    collect_symbol_refs(init, &mut refs);
                }
            }
        }
        for r in refs {
            if !live.contains(&r) {
                worklist.push_back(r);
            }
        }
    }

    // Phase 3: sweep.
    let dead_funcs: Vec<FuncId> = module
        .functions
        .iter()
        .filter(|f| !live.contains(&Item::Func(f.id)))
        .map(|f| f.id)
        .collect();
    let dead_globals: Vec<GlobalId> = module
        .globals
        .iter()
        .filter(|g| g.is_discardable() && !live.contains(&Item::Global(g.id)))
        .map(|g| g.id)
        .collect();

    for &id in &dead_funcs {
        if let Some(f) = module.func(id) {
            debug!(func = %f.name, "global_dce: removing dead function");
        }
        module.remove_function(id);
    }
    for &id in &dead_globals {
        if let Some(g) = module.global(id) {
            debug!(global = %g.name, "global_dce: removing dead global");
        }
        module.remove_global(id);
    }

    Ok(!dead_funcs.is_empty() || !dead_globals.is_empty())
}
