//! Textual IR parser.
//!
//! Parses a whole document (globals, ctor/dtor tables, functions) into a
//! [`Module`]. The grammar is token-based and newline-insensitive; `;`
//! starts a comment running to the end of the line.
//!
//! Symbols (`@name`) may be referenced before their definition, so parsing
//! is two-phase: a pre-scan registers every global and function name and
//! assigns ids in declaration order, then the main pass fills in bodies.

use crate::ir::{
    BinOp, Block, BlockId, Callee, Const, FuncId, Function, GlobalId, GlobalVar, Instr, Linkage,
    Module, Operand, Terminator, TorEntry, Ty, UnnamedAddr, VarId,
};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;

/// Parse a textual IR document into a module.
pub fn parse_module(src: &str) -> Result<Module> {
    let tokens = lex(src)?;
    let mut parser = Parser::new(tokens);
    parser.pre_scan().context("failed to index symbol table")?;
    parser.parse()
}

// ── Lexer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    /// Bare word: keywords, mnemonics, labels, the `x` in array types.
    Ident(String),
    /// `@name`.
    At(String),
    /// `%name`.
    Percent(String),
    Int(i64),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Equals,
    Arrow,
}

impl std::fmt::Display for Tok {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tok::Ident(s) => write!(f, "{}", s),
            Tok::At(s) => write!(f, "@{}", s),
            Tok::Percent(s) => write!(f, "%{}", s),
            Tok::Int(v) => write!(f, "{}", v),
            Tok::Str(s) => write!(f, "\"{}\"", s),
            Tok::LParen => write!(f, "("),
            Tok::RParen => write!(f, ")"),
            Tok::LBrace => write!(f, "{{"),
            Tok::RBrace => write!(f, "}}"),
            Tok::LBracket => write!(f, "["),
            Tok::RBracket => write!(f, "]"),
            Tok::Comma => write!(f, ","),
            Tok::Colon => write!(f, ":"),
            Tok::Equals => write!(f, "="),
            Tok::Arrow => write!(f, "->"),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '.'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn lex(src: &str) -> Result<Vec<(Tok, u32)>> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    let mut line: u32 = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            ';' => {
                // Comment to end of line.
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '(' => {
                chars.next();
                tokens.push((Tok::LParen, line));
            }
            ')' => {
                chars.next();
                tokens.push((Tok::RParen, line));
            }
            '{' => {
                chars.next();
                tokens.push((Tok::LBrace, line));
            }
            '}' => {
                chars.next();
                tokens.push((Tok::RBrace, line));
            }
            '[' => {
                chars.next();
                tokens.push((Tok::LBracket, line));
            }
            ']' => {
                chars.next();
                tokens.push((Tok::RBracket, line));
            }
            ',' => {
                chars.next();
                tokens.push((Tok::Comma, line));
            }
            ':' => {
                chars.next();
                tokens.push((Tok::Colon, line));
            }
            '=' => {
                chars.next();
                tokens.push((Tok::Equals, line));
            }
            '-' => {
                chars.next();
                match chars.peek() {
                    Some('>') => {
                        chars.next();
                        tokens.push((Tok::Arrow, line));
                    }
                    Some(d) if d.is_ascii_digit() => {
                        let mut n = String::from("-");
                        while let Some(&d) = chars.peek() {
                            if d.is_ascii_digit() {
                                n.push(d);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        let v: i64 = n
                            .parse()
                            .with_context(|| format!("line {}: bad integer {}", line, n))?;
                        tokens.push((Tok::Int(v), line));
                    }
                    _ => bail!("line {}: stray '-'", line),
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            Some('n') => s.push('\n'),
                            other => bail!("line {}: bad escape {:?}", line, other),
                        },
                        Some('\n') => bail!("line {}: unterminated string", line),
                        Some(c) => s.push(c),
                        None => bail!("line {}: unterminated string", line),
                    }
                }
                tokens.push((Tok::Str(s), line));
            }
            '@' | '%' => {
                let sigil = c;
                chars.next();
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if is_ident_char(c) {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    bail!("line {}: '{}' without a name", line, sigil);
                }
                tokens.push((
                    if sigil == '@' {
                        Tok::At(name)
                    } else {
                        Tok::Percent(name)
                    },
                    line,
                ));
            }
            c if c.is_ascii_digit() => {
                let mut n = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        n.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let v: i64 = n
                    .parse()
                    .with_context(|| format!("line {}: bad integer {}", line, n))?;
                tokens.push((Tok::Int(v), line));
            }
            c if is_ident_start(c) => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if is_ident_char(c) {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Tok::Ident(s), line));
            }
            other => bail!("line {}: unexpected character {:?}", line, other),
        }
    }
    Ok(tokens)
}

// ── Parser ───────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(Tok, u32)>,
    pos: usize,
    module: Module,
    globals_by_name: HashMap<String, GlobalId>,
    funcs_by_name: HashMap<String, FuncId>,
}

/// Per-function parse state: lazily allocated register and label names.
#[derive(Default)]
struct FuncScope {
    vars: HashMap<String, VarId>,
    labels: HashMap<String, BlockId>,
    defined_labels: Vec<BlockId>,
    next_var: u32,
    next_block: u32,
}

impl FuncScope {
    fn var(&mut self, name: &str) -> VarId {
        if let Some(&v) = self.vars.get(name) {
            return v;
        }
        let v = VarId(self.next_var);
        self.next_var += 1;
        self.vars.insert(name.to_string(), v);
        v
    }

    fn label(&mut self, name: &str) -> BlockId {
        if let Some(&b) = self.labels.get(name) {
            return b;
        }
        let b = BlockId(self.next_block);
        self.next_block += 1;
        self.labels.insert(name.to_string(), b);
        b
    }
}

impl Parser {
    fn new(tokens: Vec<(Tok, u32)>) -> Self {
        Parser {
            tokens,
            pos: 0,
            module: Module::default(),
            globals_by_name: HashMap::new(),
            funcs_by_name: HashMap::new(),
        }
    }

    // ── Token primitives ─────────────────────────────────────────────────

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, l)| *l)
            .unwrap_or(0)
    }

    fn next(&mut self) -> Result<Tok> {
        match self.tokens.get(self.pos) {
            Some((t, _)) => {
                self.pos += 1;
                Ok(t.clone())
            }
            None => bail!("unexpected end of input"),
        }
    }

    fn expect(&mut self, want: Tok) -> Result<()> {
        let line = self.line();
        let got = self.next()?;
        if got != want {
            bail!("line {}: expected '{}', found '{}'", line, want, got);
        }
        Ok(())
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Ident(s)) if s == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        let line = self.line();
        match self.next()? {
            Tok::Ident(s) => Ok(s),
            other => bail!("line {}: expected identifier, found '{}'", line, other),
        }
    }

    fn expect_at(&mut self) -> Result<String> {
        let line = self.line();
        match self.next()? {
            Tok::At(s) => Ok(s),
            other => bail!("line {}: expected '@name', found '{}'", line, other),
        }
    }

    fn expect_int(&mut self) -> Result<i64> {
        let line = self.line();
        match self.next()? {
            Tok::Int(v) => Ok(v),
            other => bail!("line {}: expected integer, found '{}'", line, other),
        }
    }

    // ── Pre-scan: symbol table ───────────────────────────────────────────

    /// Walk the token stream registering every `global`, `fn` and
    /// `declare` name, so later references resolve regardless of order.
    fn pre_scan(&mut self) -> Result<()> {
        let mut i = 0;
        let mut depth = 0usize;
        while i < self.tokens.len() {
            let (tok, line) = &self.tokens[i];
            match tok {
                Tok::LBrace => depth += 1,
                Tok::RBrace => depth = depth.saturating_sub(1),
                Tok::Ident(word) if depth == 0 => {
                    let kind = match word.as_str() {
                        "global" => Some(true),
                        "fn" | "declare" => Some(false),
                        _ => None,
                    };
                    if let Some(is_global) = kind {
                        // `declare intrinsic @name` carries a marker first.
                        let mut j = i + 1;
                        while matches!(&self.tokens.get(j), Some((Tok::Ident(_), _))) {
                            j += 1;
                        }
                        let Some((Tok::At(name), _)) = self.tokens.get(j) else {
                            bail!("line {}: '{}' without a '@name'", line, word);
                        };
                        let name = name.clone();
                        if self.globals_by_name.contains_key(&name)
                            || self.funcs_by_name.contains_key(&name)
                        {
                            bail!("line {}: duplicate symbol @{}", line, name);
                        }
                        if is_global {
                            let id = self.module.push_global(GlobalVar {
                                id: GlobalId(0),
                                name: name.clone(),
                                ty: Ty::I32,
                                init: None,
                                linkage: Linkage::External,
                                align: None,
                                metadata: false,
                            });
                            self.globals_by_name.insert(name, id);
                        } else {
                            let id = self.module.push_function(Function {
                                id: FuncId(0),
                                name: name.clone(),
                                params: vec![],
                                ret: None,
                                blocks: vec![],
                                entry_block: BlockId(0),
                                linkage: Linkage::External,
                                is_entry: false,
                                no_inline: false,
                                intrinsic: false,
                                unnamed_addr: UnnamedAddr::None,
                                next_var: 0,
                                next_block: 0,
                            });
                            self.funcs_by_name.insert(name, id);
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }
        Ok(())
    }

    // ── Main pass ────────────────────────────────────────────────────────

    fn parse(mut self) -> Result<Module> {
        while self.peek().is_some() {
            let line = self.line();
            let word = self.expect_ident()?;
            match word.as_str() {
                "global" => self.parse_global()?,
                "fn" => self.parse_fn()?,
                "declare" => self.parse_declare()?,
                "ctors" => {
                    let entries = self.parse_tor_table()?;
                    self.module.ctors = entries;
                }
                "dtors" => {
                    let entries = self.parse_tor_table()?;
                    self.module.dtors = entries;
                }
                other => bail!("line {}: unexpected top-level item '{}'", line, other),
            }
        }
        Ok(self.module)
    }

    fn resolve_symbol(&self, name: &str, line: u32) -> Result<Const> {
        if let Some(&g) = self.globals_by_name.get(name) {
            Ok(Const::GlobalAddr(g))
        } else if let Some(&f) = self.funcs_by_name.get(name) {
            Ok(Const::FuncAddr(f))
        } else {
            bail!("line {}: unknown symbol @{}", line, name)
        }
    }

    fn parse_tor_table(&mut self) -> Result<Vec<TorEntry>> {
        self.expect(Tok::LBrace)?;
        let mut entries = Vec::new();
        loop {
            if matches!(self.peek(), Some(Tok::RBrace)) {
                self.next()?;
                break;
            }
            let line = self.line();
            let name = self.expect_at()?;
            self.expect(Tok::Colon)?;
            let priority = self.expect_int()?;
            let Some(&func) = self.funcs_by_name.get(&name) else {
                bail!("line {}: unknown function @{} in ctor/dtor table", line, name);
            };
            entries.push(TorEntry {
                func,
                priority: priority as u16,
            });
            if matches!(self.peek(), Some(Tok::Comma)) {
                self.next()?;
            }
        }
        Ok(entries)
    }

    fn parse_global(&mut self) -> Result<()> {
        let line = self.line();
        let name = self.expect_at()?;
        self.expect(Tok::Colon)?;
        let ty = self.parse_ty()?;
        let mut init = None;
        if matches!(self.peek(), Some(Tok::Equals)) {
            self.next()?;
            init = Some(self.parse_const()?);
        }
        let mut linkage = Linkage::External;
        let mut align = None;
        let mut metadata = false;
        loop {
            if self.eat_ident("internal") {
                linkage = Linkage::Internal;
            } else if self.eat_ident("external") {
                linkage = Linkage::External;
            } else if self.eat_ident("align") {
                align = Some(self.expect_int()? as u32);
            } else if self.eat_ident("metadata") {
                metadata = true;
            } else {
                break;
            }
        }
        let id = *self
            .globals_by_name
            .get(&name)
            .with_context(|| format!("line {}: global @{} missing from pre-scan", line, name))?;
        let g = self
            .module
            .global_mut(id)
            .with_context(|| format!("line {}: global @{} vanished", line, name))?;
        g.ty = ty;
        g.init = init;
        g.linkage = linkage;
        g.align = align;
        g.metadata = metadata;
        Ok(())
    }

    fn parse_declare(&mut self) -> Result<()> {
        let intrinsic = self.eat_ident("intrinsic");
        let name = self.expect_at()?;
        self.expect(Tok::LParen)?;
        let mut params = Vec::new();
        let mut scope = FuncScope::default();
        loop {
            if matches!(self.peek(), Some(Tok::RParen)) {
                self.next()?;
                break;
            }
            let ty = self.parse_ty()?;
            let v = VarId(scope.next_var);
            scope.next_var += 1;
            params.push((v, ty));
            if matches!(self.peek(), Some(Tok::Comma)) {
                self.next()?;
            }
        }
        let ret = if matches!(self.peek(), Some(Tok::Arrow)) {
            self.next()?;
            Some(self.parse_ty()?)
        } else {
            None
        };
        let id = *self
            .funcs_by_name
            .get(&name)
            .with_context(|| format!("declaration @{} missing from pre-scan", name))?;
        let f = self.module.func_mut(id).expect("declared function vanished");
        f.params = params;
        f.ret = ret;
        f.intrinsic = intrinsic;
        f.next_var = scope.next_var;
        Ok(())
    }

    fn parse_fn(&mut self) -> Result<()> {
        let name = self.expect_at()?;
        let mut scope = FuncScope::default();
        self.expect(Tok::LParen)?;
        let mut params = Vec::new();
        loop {
            if matches!(self.peek(), Some(Tok::RParen)) {
                self.next()?;
                break;
            }
            let line = self.line();
            let pname = match self.next()? {
                Tok::Percent(s) => s,
                other => bail!("line {}: expected '%param', found '{}'", line, other),
            };
            self.expect(Tok::Colon)?;
            let ty = self.parse_ty()?;
            params.push((scope.var(&pname), ty));
            if matches!(self.peek(), Some(Tok::Comma)) {
                self.next()?;
            }
        }
        let ret = if matches!(self.peek(), Some(Tok::Arrow)) {
            self.next()?;
            Some(self.parse_ty()?)
        } else {
            None
        };

        let mut linkage = Linkage::External;
        let mut is_entry = false;
        let mut no_inline = false;
        let mut unnamed_addr = UnnamedAddr::None;
        loop {
            if self.eat_ident("internal") {
                linkage = Linkage::Internal;
            } else if self.eat_ident("external") {
                linkage = Linkage::External;
            } else if self.eat_ident("entry") {
                is_entry = true;
            } else if self.eat_ident("noinline") {
                no_inline = true;
            } else if self.eat_ident("unnamed_addr") {
                unnamed_addr = UnnamedAddr::Global;
            } else if self.eat_ident("local_unnamed_addr") {
                unnamed_addr = UnnamedAddr::Local;
            } else {
                break;
            }
        }

        self.expect(Tok::LBrace)?;
        let mut blocks = Vec::new();
        loop {
            if matches!(self.peek(), Some(Tok::RBrace)) {
                self.next()?;
                break;
            }
            blocks.push(self.parse_block(&mut scope)?);
        }
        let line = self.line();
        if blocks.is_empty() {
            bail!("line {}: function @{} has an empty body", line, name);
        }
        for (lname, lid) in &scope.labels {
            if !scope.defined_labels.contains(lid) {
                bail!("line {}: label '{}' referenced but never defined in @{}", line, lname, name);
            }
        }

        let entry_block = blocks[0].id;
        let id = *self
            .funcs_by_name
            .get(&name)
            .with_context(|| format!("function @{} missing from pre-scan", name))?;
        let f = self.module.func_mut(id).expect("defined function vanished");
        f.params = params;
        f.ret = ret;
        f.blocks = blocks;
        f.entry_block = entry_block;
        f.linkage = linkage;
        f.is_entry = is_entry;
        f.no_inline = no_inline;
        f.unnamed_addr = unnamed_addr;
        f.next_var = scope.next_var;
        f.next_block = scope.next_block;
        Ok(())
    }

    fn parse_block(&mut self, scope: &mut FuncScope) -> Result<Block> {
        let label = self.expect_ident()?;
        self.expect(Tok::Colon)?;
        let id = scope.label(&label);
        let line = self.line();
        if scope.defined_labels.contains(&id) {
            bail!("line {}: duplicate label '{}'", line, label);
        }
        scope.defined_labels.push(id);

        let mut instrs = Vec::new();
        let terminator = loop {
            match self.parse_statement(scope)? {
                Statement::Instr(i) => instrs.push(i),
                Statement::Terminator(t) => break t,
            }
        };
        Ok(Block {
            id,
            instrs,
            terminator,
        })
    }

    // ── Types, constants, operands ───────────────────────────────────────

    fn parse_ty(&mut self) -> Result<Ty> {
        let line = self.line();
        match self.next()? {
            Tok::Ident(s) => match s.as_str() {
                "i8" => Ok(Ty::I8),
                "i16" => Ok(Ty::I16),
                "i32" => Ok(Ty::I32),
                "i64" => Ok(Ty::I64),
                "ptr" => Ok(Ty::Ptr),
                other => bail!("line {}: unknown type '{}'", line, other),
            },
            Tok::LBracket => {
                let len = self.expect_int()?;
                let x = self.expect_ident()?;
                if x != "x" {
                    bail!("line {}: expected 'x' in array type, found '{}'", line, x);
                }
                let elem = self.parse_ty()?;
                self.expect(Tok::RBracket)?;
                Ok(Ty::Array(Box::new(elem), len as u32))
            }
            Tok::LBrace => {
                let mut fields = Vec::new();
                loop {
                    if matches!(self.peek(), Some(Tok::RBrace)) {
                        self.next()?;
                        break;
                    }
                    fields.push(self.parse_ty()?);
                    if matches!(self.peek(), Some(Tok::Comma)) {
                        self.next()?;
                    }
                }
                Ok(Ty::Struct(fields))
            }
            other => bail!("line {}: expected type, found '{}'", line, other),
        }
    }

    /// Whether the upcoming token could start a constant.
    fn at_const(&self) -> bool {
        match self.peek() {
            Some(Tok::At(_)) | Some(Tok::LBrace) | Some(Tok::LBracket) => true,
            Some(Tok::Ident(s)) => matches!(
                s.as_str(),
                "i8" | "i16" | "i32" | "i64" | "null" | "undef" | "elemaddr"
            ),
            _ => false,
        }
    }

    fn parse_const(&mut self) -> Result<Const> {
        let line = self.line();
        match self.next()? {
            Tok::At(name) => self.resolve_symbol(&name, line),
            Tok::Ident(s) => match s.as_str() {
                "null" => Ok(Const::Null),
                "undef" => Ok(Const::Undef(self.parse_ty()?)),
                "elemaddr" => {
                    self.expect(Tok::LParen)?;
                    let base_ty = self.parse_ty()?;
                    self.expect(Tok::Comma)?;
                    let base = self.parse_const()?;
                    let mut indices = Vec::new();
                    while matches!(self.peek(), Some(Tok::Comma)) {
                        self.next()?;
                        indices.push(self.expect_int()? as u32);
                    }
                    self.expect(Tok::RParen)?;
                    Ok(Const::ElemAddr {
                        base_ty,
                        base: Box::new(base),
                        indices,
                    })
                }
                "i8" | "i16" | "i32" | "i64" => {
                    let ty = match s.as_str() {
                        "i8" => Ty::I8,
                        "i16" => Ty::I16,
                        "i32" => Ty::I32,
                        _ => Ty::I64,
                    };
                    let value = self.expect_int()?;
                    Ok(Const::Int { ty, value })
                }
                other => bail!("line {}: expected constant, found '{}'", line, other),
            },
            Tok::LBrace => {
                let mut elems = Vec::new();
                loop {
                    if matches!(self.peek(), Some(Tok::RBrace)) {
                        self.next()?;
                        break;
                    }
                    elems.push(self.parse_const()?);
                    if matches!(self.peek(), Some(Tok::Comma)) {
                        self.next()?;
                    }
                }
                let ty = Ty::Struct(elems.iter().map(Const::ty).collect());
                Ok(Const::Aggregate { ty, elems })
            }
            Tok::LBracket => {
                let mut elems = Vec::new();
                loop {
                    if matches!(self.peek(), Some(Tok::RBracket)) {
                        self.next()?;
                        break;
                    }
                    elems.push(self.parse_const()?);
                    if matches!(self.peek(), Some(Tok::Comma)) {
                        self.next()?;
                    }
                }
                let Some(first) = elems.first() else {
                    bail!("line {}: empty array constant has no element type", line);
                };
                let elem_ty = first.ty();
                if let Some(bad) = elems.iter().find(|e| e.ty() != elem_ty) {
                    bail!(
                        "line {}: array element type mismatch: {} vs {}",
                        line,
                        bad.ty(),
                        elem_ty
                    );
                }
                let ty = Ty::Array(Box::new(elem_ty), elems.len() as u32);
                Ok(Const::Aggregate { ty, elems })
            }
            other => bail!("line {}: expected constant, found '{}'", line, other),
        }
    }

    fn parse_operand(&mut self, scope: &mut FuncScope) -> Result<Operand> {
        if let Some(Tok::Percent(_)) = self.peek() {
            let Tok::Percent(name) = self.next()? else {
                unreachable!()
            };
            return Ok(Operand::Var(scope.var(&name)));
        }
        Ok(Operand::Const(self.parse_const()?))
    }

    // ── Statements ───────────────────────────────────────────────────────

    fn parse_statement(&mut self, scope: &mut FuncScope) -> Result<Statement> {
        let line = self.line();
        // `%dest = op ...`
        if let Some(Tok::Percent(_)) = self.peek() {
            let Tok::Percent(name) = self.next()? else {
                unreachable!()
            };
            let dest = scope.var(&name);
            self.expect(Tok::Equals)?;
            let instr = self.parse_instr(Some(dest), scope)?;
            return Ok(Statement::Instr(instr));
        }

        let word = self.expect_ident()?;
        match word.as_str() {
            "ret" => {
                let value = if self.at_operand_start() {
                    Some(self.parse_operand(scope)?)
                } else {
                    None
                };
                Ok(Statement::Terminator(Terminator::Return { value }))
            }
            "br" => {
                // A bare identifier that cannot start a constant is an
                // unconditional target label.
                if matches!(self.peek(), Some(Tok::Ident(_))) && !self.at_const() {
                    let target = scope.label(&self.expect_ident()?);
                    Ok(Statement::Terminator(Terminator::Jump { target }))
                } else {
                    let condition = self.parse_operand(scope)?;
                    self.expect(Tok::Comma)?;
                    let if_true = scope.label(&self.expect_ident()?);
                    self.expect(Tok::Comma)?;
                    let if_false = scope.label(&self.expect_ident()?);
                    Ok(Statement::Terminator(Terminator::BranchIf {
                        condition,
                        if_true,
                        if_false,
                    }))
                }
            }
            "switch" => {
                let value = self.parse_operand(scope)?;
                self.expect(Tok::Comma)?;
                let default = scope.label(&self.expect_ident()?);
                self.expect(Tok::LBracket)?;
                let mut cases = Vec::new();
                loop {
                    if matches!(self.peek(), Some(Tok::RBracket)) {
                        self.next()?;
                        break;
                    }
                    let v = self.expect_int()?;
                    self.expect(Tok::Comma)?;
                    let target = scope.label(&self.expect_ident()?);
                    cases.push((v, target));
                }
                Ok(Statement::Terminator(Terminator::Switch {
                    value,
                    default,
                    cases,
                }))
            }
            "unreachable" => Ok(Statement::Terminator(Terminator::Unreachable)),
            "store" => {
                let value = self.parse_operand(scope)?;
                self.expect(Tok::Comma)?;
                let addr = self.parse_operand(scope)?;
                Ok(Statement::Instr(Instr::Store { value, addr }))
            }
            "call" | "asm" => {
                // Void call/asm in statement position.
                self.pos -= 1;
                let instr = self.parse_instr(None, scope)?;
                Ok(Statement::Instr(instr))
            }
            other => bail!("line {}: unexpected statement '{}'", line, other),
        }
    }

    fn at_operand_start(&self) -> bool {
        matches!(self.peek(), Some(Tok::Percent(_))) || self.at_const()
    }

    fn parse_instr(&mut self, dest: Option<VarId>, scope: &mut FuncScope) -> Result<Instr> {
        let line = self.line();
        let word = self.expect_ident()?;
        if let Some(op) = BinOp::from_mnemonic(&word) {
            let Some(dest) = dest else {
                bail!("line {}: '{}' requires a destination", line, word);
            };
            let ty = self.parse_ty()?;
            let lhs = self.parse_operand(scope)?;
            self.expect(Tok::Comma)?;
            let rhs = self.parse_operand(scope)?;
            return Ok(Instr::BinOp {
                dest,
                op,
                ty,
                lhs,
                rhs,
            });
        }
        match word.as_str() {
            "load" => {
                let Some(dest) = dest else {
                    bail!("line {}: 'load' requires a destination", line);
                };
                let ty = self.parse_ty()?;
                self.expect(Tok::Comma)?;
                let addr = self.parse_operand(scope)?;
                Ok(Instr::Load { dest, ty, addr })
            }
            "store" => {
                if dest.is_some() {
                    bail!("line {}: 'store' has no result", line);
                }
                let value = self.parse_operand(scope)?;
                self.expect(Tok::Comma)?;
                let addr = self.parse_operand(scope)?;
                Ok(Instr::Store { value, addr })
            }
            "alloca" => {
                let Some(dest) = dest else {
                    bail!("line {}: 'alloca' requires a destination", line);
                };
                let ty = self.parse_ty()?;
                let align = if self.eat_ident("align") {
                    Some(self.expect_int()? as u32)
                } else {
                    None
                };
                Ok(Instr::Alloca {
                    dest,
                    ty,
                    align,
                    name: None,
                })
            }
            "elemaddr" => {
                let Some(dest) = dest else {
                    bail!("line {}: 'elemaddr' requires a destination", line);
                };
                let base_ty = self.parse_ty()?;
                self.expect(Tok::Comma)?;
                let base = self.parse_operand(scope)?;
                let mut indices = Vec::new();
                while matches!(self.peek(), Some(Tok::Comma)) {
                    self.next()?;
                    indices.push(self.expect_int()? as u32);
                }
                if indices.is_empty() {
                    bail!("line {}: 'elemaddr' needs at least one index", line);
                }
                Ok(Instr::ElemAddr {
                    dest,
                    base_ty,
                    base,
                    indices,
                })
            }
            "phi" => {
                let Some(dest) = dest else {
                    bail!("line {}: 'phi' requires a destination", line);
                };
                let ty = self.parse_ty()?;
                self.expect(Tok::Comma)?;
                let mut incoming = Vec::new();
                loop {
                    self.expect(Tok::LBracket)?;
                    let op = self.parse_operand(scope)?;
                    self.expect(Tok::Comma)?;
                    let label = scope.label(&self.expect_ident()?);
                    self.expect(Tok::RBracket)?;
                    incoming.push((op, label));
                    if matches!(self.peek(), Some(Tok::Comma)) {
                        self.next()?;
                    } else {
                        break;
                    }
                }
                Ok(Instr::Phi { dest, ty, incoming })
            }
            "call" => {
                let callee = match self.peek() {
                    Some(Tok::At(_)) => {
                        let name = self.expect_at()?;
                        let Some(&f) = self.funcs_by_name.get(&name) else {
                            bail!("line {}: call of unknown function @{}", line, name);
                        };
                        Callee::Direct(f)
                    }
                    _ => {
                        // Indirect: explicit return type, then the pointer.
                        let ret = if self.eat_ident("void") {
                            None
                        } else {
                            Some(self.parse_ty()?)
                        };
                        let ptr = self.parse_operand(scope)?;
                        Callee::Indirect { ptr, ret }
                    }
                };
                let args = self.parse_call_args(scope)?;
                Ok(Instr::Call { dest, callee, args })
            }
            "asm" => {
                let ret = if self.eat_ident("void") {
                    None
                } else if !matches!(self.peek(), Some(Tok::Str(_))) {
                    Some(self.parse_ty()?)
                } else {
                    None
                };
                let text = match self.next()? {
                    Tok::Str(s) => s,
                    other => bail!("line {}: expected asm string, found '{}'", line, other),
                };
                let args = self.parse_call_args(scope)?;
                Ok(Instr::Call {
                    dest,
                    callee: Callee::Asm { text, ret },
                    args,
                })
            }
            other => bail!("line {}: unknown instruction '{}'", line, other),
        }
    }

    fn parse_call_args(&mut self, scope: &mut FuncScope) -> Result<Vec<Operand>> {
        self.expect(Tok::LParen)?;
        let mut args = Vec::new();
        loop {
            if matches!(self.peek(), Some(Tok::RParen)) {
                self.next()?;
                break;
            }
            args.push(self.parse_operand(scope)?);
            if matches!(self.peek(), Some(Tok::Comma)) {
                self.next()?;
            }
        }
        Ok(args)
    }
}

enum Statement {
    Instr(Instr),
    Terminator(Terminator),
}
