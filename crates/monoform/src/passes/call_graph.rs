//! Derived call-graph view.
//!
//! A read-only adjacency index over the current function set. It is
//! rebuilt from scratch whenever a pass needs it after a structural
//! change — inlining invalidates node identities, so the graph is never
//! persisted engine state.

use crate::ir::{Callee, Const, FuncId, Instr, Module, Operand};
use crate::passes::utils::{for_each_operand, for_each_terminator_operand};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Caller/callee adjacency plus address-taken facts for one snapshot of
/// the module.
#[derive(Debug, Default)]
pub struct CallGraph {
    /// callee → distinct calling functions.
    callers: HashMap<FuncId, BTreeSet<FuncId>>,
    /// caller → directly called functions.
    callees: HashMap<FuncId, BTreeSet<FuncId>>,
    /// Functions whose address escapes into an operand, a global
    /// initializer or the ctor/dtor tables.
    address_taken: HashSet<FuncId>,
}

impl CallGraph {
    /// Build the adjacency view for the module's current function set.
    pub fn build(module: &Module) -> Self {
        let mut cg = CallGraph::default();

        for func in &module.functions {
            for block in &func.blocks {
                for instr in &block.instrs {
                    if let Instr::Call { callee, .. } = instr {
                        match callee {
                            Callee::Direct(target) => {
                                cg.callers.entry(*target).or_default().insert(func.id);
                                cg.callees.entry(func.id).or_default().insert(*target);
                            }
                            Callee::Indirect { .. } | Callee::Asm { .. } => {}
                        }
                    }
                    for_each_operand(instr, |op| {
                        if let Operand::Const(c) = op {
                            note_func_addrs(c, &mut cg.address_taken);
                        }
                    });
                }
                // Terminator operands can carry constants too.
                for_each_terminator_operand(&block.terminator, |op| {
                    if let Operand::Const(c) = op {
                        note_func_addrs(c, &mut cg.address_taken);
                    }
                });
            }
        }
        for global in &module.globals {
            if let Some(init) = &global.init {
                note_func_addrs(init, &mut cg.address_taken);
            }
        }
        for entry in module.ctors.iter().chain(module.dtors.iter()) {
            cg.address_taken.insert(entry.func);
        }

        cg
    }

    /// The distinct functions calling `callee` directly.
    pub fn callers(&self, callee: FuncId) -> impl Iterator<Item = FuncId> + '_ {
        self.callers.get(&callee).into_iter().flatten().copied()
    }

    /// The functions `caller` calls directly.
    pub fn callees(&self, caller: FuncId) -> impl Iterator<Item = FuncId> + '_ {
        self.callees.get(&caller).into_iter().flatten().copied()
    }

    /// Whether the function's address escapes anywhere in the module.
    pub fn is_address_taken(&self, func: FuncId) -> bool {
        self.address_taken.contains(&func)
    }

    /// Functions transitively reachable from `roots` via direct calls.
    pub fn reachable_from(&self, roots: impl IntoIterator<Item = FuncId>) -> HashSet<FuncId> {
        let mut reachable = HashSet::new();
        let mut worklist: VecDeque<FuncId> = roots.into_iter().collect();
        while let Some(f) = worklist.pop_front() {
            if !reachable.insert(f) {
                continue;
            }
            for callee in self.callees(f) {
                if !reachable.contains(&callee) {
                    worklist.push_back(callee);
                }
            }
        }
        reachable
    }
}

fn note_func_addrs(c: &Const, out: &mut HashSet<FuncId>) {
    match c {
        Const::FuncAddr(f) => {
            out.insert(*f);
        }
        Const::Aggregate { elems, .. } => {
            for e in elems {
                note_func_addrs(e, out);
            }
        }
        Const::ElemAddr { base, .. } => note_func_addrs(base, out),
        _ => {}
    }
}

/// Whether anything in the module still refers to `func`: a direct call,
/// an escaped address, or a ctor/dtor table entry.
pub fn function_has_users(module: &Module, func: FuncId) -> bool {
    let cg = CallGraph::build(module);
    cg.callers(func).next().is_some() || cg.is_address_taken(func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Block, BlockId, Function, GlobalId, GlobalVar, Linkage, Terminator, TorEntry, Ty,
        UnnamedAddr,
    };

    fn plain_func(name: &str, blocks: Vec<Block>) -> Function {
        Function {
            id: FuncId(0),
            name: name.to_string(),
            params: vec![],
            ret: None,
            blocks,
            entry_block: BlockId(0),
            linkage: Linkage::Internal,
            is_entry: false,
            no_inline: false,
            intrinsic: false,
            unnamed_addr: UnnamedAddr::None,
            next_var: 0,
            next_block: 1,
        }
    }

    fn ret_block() -> Block {
        Block {
            id: BlockId(0),
            instrs: vec![],
            terminator: Terminator::Return { value: None },
        }
    }

    fn call_block(target: FuncId) -> Block {
        Block {
            id: BlockId(0),
            instrs: vec![Instr::Call {
                dest: None,
                callee: Callee::Direct(target),
                args: vec![],
            }],
            terminator: Terminator::Return { value: None },
        }
    }

    #[test]
    fn direct_call_edges() {
        let mut module = Module::default();
        let leaf = module.push_function(plain_func("leaf", vec![ret_block()]));
        let caller = module.push_function(plain_func("caller", vec![call_block(leaf)]));

        let cg = CallGraph::build(&module);
        assert_eq!(cg.callers(leaf).collect::<Vec<_>>(), vec![caller]);
        assert_eq!(cg.callees(caller).collect::<Vec<_>>(), vec![leaf]);
        assert!(!cg.is_address_taken(leaf));
    }

    #[test]
    fn address_taken_via_global_init() {
        let mut module = Module::default();
        let f = module.push_function(plain_func("f", vec![ret_block()]));
        module.push_global(GlobalVar {
            id: GlobalId(0),
            name: "table".to_string(),
            ty: Ty::Ptr,
            init: Some(Const::FuncAddr(f)),
            linkage: Linkage::Internal,
            align: None,
            metadata: false,
        });
        let cg = CallGraph::build(&module);
        assert!(cg.is_address_taken(f));
        assert!(function_has_users(&module, f));
    }

    #[test]
    fn ctor_table_counts_as_user() {
        let mut module = Module::default();
        let f = module.push_function(plain_func("init", vec![ret_block()]));
        module.ctors.push(TorEntry { func: f, priority: 100 });
        assert!(function_has_users(&module, f));
    }

    #[test]
    fn reachability_is_transitive() {
        let mut module = Module::default();
        let leaf = module.push_function(plain_func("leaf", vec![ret_block()]));
        let mid = module.push_function(plain_func("mid", vec![call_block(leaf)]));
        let main = module.push_function(plain_func("main", vec![call_block(mid)]));
        let stray = module.push_function(plain_func("stray", vec![ret_block()]));

        let cg = CallGraph::build(&module);
        let reachable = cg.reachable_from([main]);
        assert!(reachable.contains(&main));
        assert!(reachable.contains(&mid));
        assert!(reachable.contains(&leaf));
        assert!(!reachable.contains(&stray));
    }

    #[test]
    fn no_users_for_uncalled_function() {
        let mut module = Module::default();
        let f = module.push_function(plain_func("dead", vec![ret_block()]));
        module.push_function(plain_func("main", vec![ret_block()]));
        assert!(!function_has_users(&module, f));
    }
}
