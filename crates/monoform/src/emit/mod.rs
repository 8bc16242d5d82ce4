//! Textual IR emitter.
//!
//! Prints a [`Module`] back out in the same grammar the parser accepts.
//! Registers and blocks are renumbered canonically in order of first
//! textual occurrence, which makes `emit ∘ parse ∘ emit` a fixed point:
//! re-emitting a reparse reproduces the text byte for byte. Slot
//! provenance names on allocas are emitted as trailing comments only.

use crate::ir::{
    Block, BlockId, Callee, Const, Function, GlobalVar, Instr, Linkage, Module, Operand,
    Terminator, Ty, UnnamedAddr, VarId,
};
use std::collections::HashMap;
use std::fmt::Write;

/// Render the whole module as text.
pub fn emit_module(module: &Module) -> String {
    let mut out = String::new();

    for global in &module.globals {
        emit_global(&mut out, module, global);
    }
    if !module.globals.is_empty() {
        out.push('\n');
    }

    if !module.ctors.is_empty() {
        let entries: Vec<String> = module
            .ctors
            .iter()
            .filter_map(|e| module.func(e.func).map(|f| format!("@{} : {}", f.name, e.priority)))
            .collect();
        let _ = writeln!(out, "ctors {{ {} }}", entries.join(", "));
    }
    if !module.dtors.is_empty() {
        let entries: Vec<String> = module
            .dtors
            .iter()
            .filter_map(|e| module.func(e.func).map(|f| format!("@{} : {}", f.name, e.priority)))
            .collect();
        let _ = writeln!(out, "dtors {{ {} }}", entries.join(", "));
    }
    if !module.ctors.is_empty() || !module.dtors.is_empty() {
        out.push('\n');
    }

    for (i, func) in module.functions.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if func.is_declaration() {
            emit_declare(&mut out, func);
        } else {
            emit_function(&mut out, module, func);
        }
    }
    out
}

/// Canonical display numbering, assigned at first occurrence in print
/// order so that a reparse followed by a re-emit is textually stable.
#[derive(Default)]
struct Namer {
    vars: HashMap<VarId, u32>,
    blocks: HashMap<BlockId, u32>,
}

impl Namer {
    fn var(&mut self, v: VarId) -> String {
        let next = self.vars.len() as u32;
        format!("%{}", *self.vars.entry(v).or_insert(next))
    }

    fn block(&mut self, b: BlockId) -> String {
        let next = self.blocks.len() as u32;
        format!("b{}", *self.blocks.entry(b).or_insert(next))
    }
}

fn emit_global(out: &mut String, module: &Module, global: &GlobalVar) {
    let _ = write!(out, "global @{} : {}", global.name, global.ty);
    if let Some(init) = &global.init {
        let _ = write!(out, " = {}", const_text(module, init));
    }
    if global.linkage == Linkage::Internal {
        out.push_str(" internal");
    }
    if let Some(a) = global.align {
        let _ = write!(out, " align {}", a);
    }
    if global.metadata {
        out.push_str(" metadata");
    }
    out.push('\n');
}

fn emit_declare(out: &mut String, func: &Function) {
    out.push_str("declare ");
    if func.intrinsic {
        out.push_str("intrinsic ");
    }
    let params: Vec<String> = func.params.iter().map(|(_, ty)| ty.to_string()).collect();
    let _ = write!(out, "@{}({})", func.name, params.join(", "));
    if let Some(ret) = &func.ret {
        let _ = write!(out, " -> {}", ret);
    }
    out.push('\n');
}

fn emit_function(out: &mut String, module: &Module, func: &Function) {
    let mut namer = Namer::default();
    let params: Vec<String> = func
        .params
        .iter()
        .map(|(v, ty)| format!("{}: {}", namer.var(*v), ty))
        .collect();
    let _ = write!(out, "fn @{}({})", func.name, params.join(", "));
    if let Some(ret) = &func.ret {
        let _ = write!(out, " -> {}", ret);
    }
    if func.is_entry {
        out.push_str(" entry");
    }
    if func.linkage == Linkage::Internal {
        out.push_str(" internal");
    }
    if func.no_inline {
        out.push_str(" noinline");
    }
    match func.unnamed_addr {
        UnnamedAddr::None => {}
        UnnamedAddr::Local => out.push_str(" local_unnamed_addr"),
        UnnamedAddr::Global => out.push_str(" unnamed_addr"),
    }
    out.push_str(" {\n");

    // The entry block leads; the rest keep layout order.
    if let Some(entry) = func.block(func.entry_block) {
        emit_block(out, module, entry, &mut namer);
    }
    for block in &func.blocks {
        if block.id != func.entry_block {
            emit_block(out, module, block, &mut namer);
        }
    }
    out.push_str("}\n");
}

fn emit_block(out: &mut String, module: &Module, block: &Block, namer: &mut Namer) {
    let _ = writeln!(out, "{}:", namer.block(block.id));
    for instr in &block.instrs {
        let _ = writeln!(out, "  {}", instr_text(module, instr, namer));
    }
    let _ = writeln!(out, "  {}", terminator_text(module, &block.terminator, namer));
}

fn const_text(module: &Module, c: &Const) -> String {
    match c {
        Const::Int { ty, value } => format!("{} {}", ty, value),
        Const::Null => "null".to_string(),
        Const::Undef(ty) => format!("undef {}", ty),
        Const::GlobalAddr(g) => match module.global(*g) {
            Some(g) => format!("@{}", g.name),
            None => format!("@<dangling:{}>", g),
        },
        Const::FuncAddr(f) => match module.func(*f) {
            Some(f) => format!("@{}", f.name),
            None => format!("@<dangling:{}>", f),
        },
        Const::Aggregate { ty, elems } => {
            let inner: Vec<String> = elems.iter().map(|e| const_text(module, e)).collect();
            match ty {
                Ty::Array(..) => format!("[ {} ]", inner.join(", ")),
                _ => format!("{{ {} }}", inner.join(", ")),
            }
        }
        Const::ElemAddr {
            base_ty,
            base,
            indices,
        } => {
            let idx: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
            format!(
                "elemaddr({}, {}, {})",
                base_ty,
                const_text(module, base),
                idx.join(", ")
            )
        }
    }
}

fn operand_text(module: &Module, op: &Operand, namer: &mut Namer) -> String {
    match op {
        Operand::Var(v) => namer.var(*v),
        Operand::Const(c) => const_text(module, c),
    }
}

fn instr_text(module: &Module, instr: &Instr, namer: &mut Namer) -> String {
    match instr {
        Instr::BinOp {
            dest,
            op,
            ty,
            lhs,
            rhs,
        } => {
            let dest = namer.var(*dest);
            let lhs = operand_text(module, lhs, namer);
            let rhs = operand_text(module, rhs, namer);
            format!("{} = {} {} {}, {}", dest, op.mnemonic(), ty, lhs, rhs)
        }
        Instr::Load { dest, ty, addr } => {
            let dest = namer.var(*dest);
            let addr = operand_text(module, addr, namer);
            format!("{} = load {}, {}", dest, ty, addr)
        }
        Instr::Store { value, addr } => {
            let value = operand_text(module, value, namer);
            let addr = operand_text(module, addr, namer);
            format!("store {}, {}", value, addr)
        }
        Instr::Alloca {
            dest,
            ty,
            align,
            name,
        } => {
            let mut s = format!("{} = alloca {}", namer.var(*dest), ty);
            if let Some(a) = align {
                let _ = write!(s, " align {}", a);
            }
            if let Some(n) = name {
                let _ = write!(s, " ; {}", n);
            }
            s
        }
        Instr::ElemAddr {
            dest,
            base_ty,
            base,
            indices,
        } => {
            let dest = namer.var(*dest);
            let base = operand_text(module, base, namer);
            let idx: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
            format!("{} = elemaddr {}, {}, {}", dest, base_ty, base, idx.join(", "))
        }
        Instr::Phi { dest, ty, incoming } => {
            let dest = namer.var(*dest);
            let arms: Vec<String> = incoming
                .iter()
                .map(|(op, b)| {
                    let op = operand_text(module, op, namer);
                    format!("[ {}, {} ]", op, namer.block(*b))
                })
                .collect();
            format!("{} = phi {}, {}", dest, ty, arms.join(", "))
        }
        Instr::Call { dest, callee, args } => {
            let dest_text = dest.map(|d| namer.var(d));
            let call = match callee {
                Callee::Direct(f) => {
                    let name = module
                        .func(*f)
                        .map(|f| f.name.clone())
                        .unwrap_or_else(|| format!("<dangling:{}>", f));
                    let args_text: Vec<String> =
                        args.iter().map(|a| operand_text(module, a, namer)).collect();
                    format!("call @{}({})", name, args_text.join(", "))
                }
                Callee::Indirect { ptr, ret } => {
                    let ret_text = ret
                        .as_ref()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "void".to_string());
                    let ptr = operand_text(module, ptr, namer);
                    let args_text: Vec<String> =
                        args.iter().map(|a| operand_text(module, a, namer)).collect();
                    format!("call {} {}({})", ret_text, ptr, args_text.join(", "))
                }
                Callee::Asm { text, ret } => {
                    let ret_text = ret
                        .as_ref()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "void".to_string());
                    let args_text: Vec<String> =
                        args.iter().map(|a| operand_text(module, a, namer)).collect();
                    format!(
                        "asm {} \"{}\"({})",
                        ret_text,
                        text.replace('\\', "\\\\").replace('"', "\\\""),
                        args_text.join(", ")
                    )
                }
            };
            match dest_text {
                Some(d) => format!("{} = {}", d, call),
                None => call,
            }
        }
    }
}

fn terminator_text(module: &Module, term: &Terminator, namer: &mut Namer) -> String {
    match term {
        Terminator::Return { value: None } => "ret".to_string(),
        Terminator::Return { value: Some(v) } => {
            format!("ret {}", operand_text(module, v, namer))
        }
        Terminator::Jump { target } => format!("br {}", namer.block(*target)),
        Terminator::BranchIf {
            condition,
            if_true,
            if_false,
        } => {
            let cond = operand_text(module, condition, namer);
            let t = namer.block(*if_true);
            let f = namer.block(*if_false);
            format!("br {}, {}, {}", cond, t, f)
        }
        Terminator::Switch {
            value,
            default,
            cases,
        } => {
            let value = operand_text(module, value, namer);
            let default = namer.block(*default);
            let case_text: Vec<String> = cases
                .iter()
                .map(|(v, b)| format!("{}, {}", v, namer.block(*b)))
                .collect();
            format!("switch {}, {} [ {} ]", value, default, case_text.join("  "))
        }
        Terminator::Unreachable => "unreachable".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    /// Emitted text must parse back, and re-emitting the reparse must be
    /// textually stable.
    fn assert_round_trip(src: &str) {
        let m1 = parse_module(src).expect("initial parse");
        let text1 = emit_module(&m1);
        let m2 = parse_module(&text1)
            .unwrap_or_else(|e| panic!("emitted text failed to parse: {}\n{}", e, text1));
        let text2 = emit_module(&m2);
        assert_eq!(text1, text2);
    }

    #[test]
    fn round_trip_function_with_control_flow() {
        assert_round_trip(
            r#"
            fn @main(%n: i32) -> i32 entry local_unnamed_addr {
            b0:
              %c = slt i32 %n, i32 10
              br %c, a, b
            a:
              ret i32 0
            b:
              switch %n, d [ 10, a  11, a ]
            d:
              unreachable
            }
            "#,
        );
    }

    #[test]
    fn round_trip_globals_and_aggregates() {
        assert_round_trip(
            r#"
            global @b : i32 = i32 5 internal
            global @a : {i32, ptr, i32} = { i32 100, @b, i32 1 } internal align 8
            global @arr : [3 x i32] = [ i32 1, i32 2, i32 3 ] internal
            global @meta : i32 metadata
            "#,
        );
    }

    #[test]
    fn round_trip_calls_and_asm() {
        assert_round_trip(
            r#"
            declare intrinsic @llvm.donothing()
            fn @main() entry local_unnamed_addr {
            b0:
              call @llvm.donothing()
              %r = asm i32 "syscall"(i32 1)
              %p = alloca ptr
              %f = load ptr, %p
              call void %f(%r)
              ret
            }
            "#,
        );
    }

    #[test]
    fn round_trip_phi_and_elemaddr() {
        assert_round_trip(
            r#"
            global @t : {i32, {i32, i32}} = { i32 1, { i32 2, i32 3 } } internal
            fn @main() -> i32 entry local_unnamed_addr {
            b0:
              %p = elemaddr {i32, {i32, i32}}, @t, 0, 1, 0
              %v = load i32, %p
              br done
            done:
              %r = phi i32, [ %v, b0 ]
              ret %r
            }
            "#,
        );
    }

    #[test]
    fn registers_are_renumbered_from_zero() {
        // Sparse, reordered register ids come out densely renumbered in
        // first-occurrence order.
        let m = parse_module(
            r#"
            fn @f(%start: i64) -> i64 {
            top:
              %big = add i64 %start, i64 1
              %bigger = add i64 %big, %big
              ret %bigger
            }
            "#,
        )
        .unwrap();
        let text = emit_module(&m);
        assert!(text.contains("fn @f(%0: i64)"));
        assert!(text.contains("%1 = add i64 %0, i64 1"));
        assert!(text.contains("%2 = add i64 %1, %1"));
        assert!(text.contains("ret %2"));
    }

    #[test]
    fn entry_block_is_printed_first() {
        // A function whose entry is not the first block in layout order
        // still prints its entry block first, renumbered as b0.
        let mut m = parse_module(
            r#"
            fn @f() -> i32 {
            b0:
              ret i32 0
            b1:
              %x = add i32 i32 1, i32 2
              ret %x
            }
            "#,
        )
        .unwrap();
        let f = &mut m.functions[0];
        let b1 = f.blocks[1].id;
        f.entry_block = b1;
        let text = emit_module(&m);
        let first_label_pos = text.find("b0:").unwrap();
        let add_pos = text.find("add").unwrap();
        let plain_ret_pos = text.find("ret i32 0").unwrap();
        assert!(first_label_pos < add_pos && add_pos < plain_ret_pos);
    }
}
