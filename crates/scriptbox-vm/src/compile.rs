//! AST to bytecode. Two passes: collect top-level method definitions so
//! calls may be forward references, then emit the top-level body followed by
//! each method body.

use std::collections::HashMap;

use crate::ast::{BinOp, Expr, ExprKind, Stmt, UnOp};
use crate::chunk::{Chunk, Constant, FuncSpec, Op, BUILTIN_LEN, BUILTIN_PUSH};
use crate::error::SyntaxError;

pub fn compile(path: &str, stmts: &[Stmt]) -> Result<Chunk, SyntaxError> {
    let mut c = Compiler::new(path);
    c.collect_defs(stmts)?;
    c.top_level(stmts)?;
    c.method_bodies(stmts)?;
    Ok(c.finish())
}

struct Compiler<'a> {
    path: &'a str,
    ops: Vec<Op>,
    lines: Vec<u32>,
    consts: Vec<Constant>,
    const_ids: HashMap<Constant, u32>,
    funcs: Vec<FuncSpec>,
    func_ids: HashMap<String, u32>,
    locals: Vec<String>,
    top_nlocals: u16,
    in_method: bool,
    block_depth: u32,
    /// Patch sites for `break` in each enclosing loop.
    loops: Vec<Vec<usize>>,
}

impl<'a> Compiler<'a> {
    fn new(path: &'a str) -> Self {
        Self {
            path,
            ops: Vec::new(),
            lines: Vec::new(),
            consts: Vec::new(),
            const_ids: HashMap::new(),
            funcs: Vec::new(),
            func_ids: HashMap::new(),
            locals: Vec::new(),
            top_nlocals: 0,
            in_method: false,
            block_depth: 0,
            loops: Vec::new(),
        }
    }

    fn error(&self, line: u32, col: u32, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            path: self.path.to_string(),
            line,
            column: col,
            message: message.into(),
        }
    }

    fn emit(&mut self, op: Op, line: u32) -> usize {
        self.ops.push(op);
        self.lines.push(line);
        self.ops.len() - 1
    }

    fn here(&self) -> u32 {
        self.ops.len() as u32
    }

    fn patch(&mut self, site: usize, target: u32) {
        self.ops[site] = match self.ops[site] {
            Op::Jump(_) => Op::Jump(target),
            Op::JumpUnless(_) => Op::JumpUnless(target),
            Op::JumpIfTruePeek(_) => Op::JumpIfTruePeek(target),
            Op::JumpIfFalsePeek(_) => Op::JumpIfFalsePeek(target),
            other => panic!("patching non-jump {other:?}"),
        };
    }

    fn constant(&mut self, c: Constant) -> u32 {
        if let Some(&id) = self.const_ids.get(&c) {
            return id;
        }
        let id = self.consts.len() as u32;
        self.consts.push(c.clone());
        self.const_ids.insert(c, id);
        id
    }

    fn local(&self, name: &str) -> Option<u32> {
        self.locals.iter().position(|l| l == name).map(|i| i as u32)
    }

    fn define_local(&mut self, name: &str, line: u32, col: u32) -> Result<u32, SyntaxError> {
        if let Some(i) = self.local(name) {
            return Ok(i);
        }
        if self.locals.len() >= u16::MAX as usize {
            return Err(self.error(line, col, "too many local variables"));
        }
        self.locals.push(name.to_string());
        Ok(self.locals.len() as u32 - 1)
    }

    // ---- pass 1 ----

    fn collect_defs(&mut self, stmts: &[Stmt]) -> Result<(), SyntaxError> {
        for stmt in stmts {
            if let Stmt::Def {
                name,
                params,
                line,
                col,
                ..
            } = stmt
            {
                if self.func_ids.contains_key(name) {
                    return Err(self.error(*line, *col, format!("method '{name}' redefined")));
                }
                if params.len() > u8::MAX as usize {
                    return Err(self.error(*line, *col, "too many parameters"));
                }
                let name_id = self.constant(Constant::Str(name.clone()));
                let id = self.funcs.len() as u32;
                self.funcs.push(FuncSpec {
                    name: name_id,
                    arity: params.len() as u8,
                    entry: 0,
                    nlocals: 0,
                });
                self.func_ids.insert(name.clone(), id);
            }
        }
        Ok(())
    }

    // ---- pass 2 ----

    fn top_level(&mut self, stmts: &[Stmt]) -> Result<(), SyntaxError> {
        self.body(stmts, true)?;
        self.emit(Op::Halt, last_line(stmts));
        self.top_nlocals = self.locals.len() as u16;
        Ok(())
    }

    fn method_bodies(&mut self, stmts: &[Stmt]) -> Result<(), SyntaxError> {
        for stmt in stmts {
            if let Stmt::Def {
                name,
                params,
                body,
                line,
                col,
            } = stmt
            {
                let id = self.func_ids[name];
                self.funcs[id as usize].entry = self.here();
                self.locals = params.clone();
                self.in_method = true;
                let result = self.body(body, true);
                self.in_method = false;
                result?;
                self.emit(Op::Return, last_line_at(body, *line));
                if self.locals.len() > u16::MAX as usize {
                    return Err(self.error(*line, *col, "too many local variables"));
                }
                self.funcs[id as usize].nlocals = self.locals.len() as u16;
            }
        }
        self.locals = Vec::new();
        Ok(())
    }

    /// Compile a statement list. With `tail`, the last statement's value is
    /// left on the stack; otherwise every statement value is discarded.
    fn body(&mut self, stmts: &[Stmt], tail: bool) -> Result<(), SyntaxError> {
        if stmts.is_empty() {
            if tail {
                self.emit(Op::LoadNil, 1);
            }
            return Ok(());
        }
        let (last, rest) = stmts.split_last().unwrap();
        for stmt in rest {
            self.stmt(stmt, false)?;
        }
        self.stmt(last, tail)
    }

    fn stmt(&mut self, stmt: &Stmt, tail: bool) -> Result<(), SyntaxError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.expr(expr)?;
                if !tail {
                    self.emit(Op::Pop, expr.line);
                }
                Ok(())
            }
            Stmt::If { arms, else_body } => self.if_stmt(arms, else_body.as_deref(), tail),
            Stmt::While { cond, body } => {
                let start = self.here();
                self.expr(cond)?;
                let exit = self.emit(Op::JumpUnless(0), cond.line);
                self.loops.push(Vec::new());
                self.block_depth += 1;
                let result = self.body(body, false);
                self.block_depth -= 1;
                let breaks = self.loops.pop().unwrap();
                result?;
                self.emit(Op::Jump(start), cond.line);
                let end = self.here();
                self.patch(exit, end);
                for site in breaks {
                    self.patch(site, end);
                }
                if tail {
                    self.emit(Op::LoadNil, cond.line);
                }
                Ok(())
            }
            Stmt::Def { line, col, .. } => {
                if self.in_method || self.block_depth > 0 {
                    Err(self.error(
                        *line,
                        *col,
                        "method definitions are only allowed at the top level",
                    ))
                } else {
                    // Body emitted separately, after the top-level code.
                    if tail {
                        self.emit(Op::LoadNil, *line);
                    }
                    Ok(())
                }
            }
            Stmt::Return { value, line, col } => {
                if !self.in_method {
                    return Err(self.error(*line, *col, "'return' outside of method"));
                }
                match value {
                    Some(expr) => self.expr(expr)?,
                    None => {
                        self.emit(Op::LoadNil, *line);
                    }
                }
                self.emit(Op::Return, *line);
                Ok(())
            }
            Stmt::Raise { value, line, .. } => {
                self.expr(value)?;
                self.emit(Op::Raise, *line);
                Ok(())
            }
            Stmt::Break { line, col } => {
                if self.loops.is_empty() {
                    return Err(self.error(*line, *col, "'break' outside of loop"));
                }
                let site = self.emit(Op::Jump(0), *line);
                self.loops.last_mut().unwrap().push(site);
                Ok(())
            }
        }
    }

    fn if_stmt(
        &mut self,
        arms: &[(Expr, Vec<Stmt>)],
        else_body: Option<&[Stmt]>,
        tail: bool,
    ) -> Result<(), SyntaxError> {
        let mut ends = Vec::new();
        let mut next = None;
        for (cond, body) in arms {
            if let Some(site) = next.take() {
                self.patch(site, self.here());
            }
            self.expr(cond)?;
            next = Some(self.emit(Op::JumpUnless(0), cond.line));
            self.block_depth += 1;
            let result = self.body(body, tail);
            self.block_depth -= 1;
            result?;
            ends.push(self.emit(Op::Jump(0), cond.line));
        }
        if let Some(site) = next {
            self.patch(site, self.here());
        }
        match else_body {
            Some(body) => {
                self.block_depth += 1;
                let result = self.body(body, tail);
                self.block_depth -= 1;
                result?;
            }
            None => {
                if tail {
                    self.emit(Op::LoadNil, 1);
                }
            }
        }
        let end = self.here();
        for site in ends {
            self.patch(site, end);
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), SyntaxError> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Nil => {
                self.emit(Op::LoadNil, line);
            }
            ExprKind::True => {
                self.emit(Op::LoadTrue, line);
            }
            ExprKind::False => {
                self.emit(Op::LoadFalse, line);
            }
            ExprKind::Int(i) => {
                if let Ok(small) = i32::try_from(*i) {
                    self.emit(Op::LoadInt(small), line);
                } else {
                    let id = self.constant(Constant::Int(*i));
                    self.emit(Op::LoadConst(id), line);
                }
            }
            ExprKind::Str(s) => {
                let id = self.constant(Constant::Str(s.clone()));
                self.emit(Op::LoadConst(id), line);
            }
            ExprKind::Sym(s) => {
                let id = self.constant(Constant::Sym(s.clone()));
                self.emit(Op::LoadConst(id), line);
            }
            ExprKind::Array(items) => {
                for item in items {
                    self.expr(item)?;
                }
                self.emit(Op::NewArray(items.len() as u32), line);
            }
            ExprKind::Map(pairs) => {
                for (key, value) in pairs {
                    self.expr(key)?;
                    self.expr(value)?;
                }
                self.emit(Op::NewMap(pairs.len() as u32), line);
            }
            ExprKind::Local(name) => match self.local(name) {
                Some(i) => {
                    self.emit(Op::GetLocal(i), line);
                }
                None => {
                    return Err(self.error(
                        line,
                        expr.col,
                        format!("undefined local variable or method '{name}'"),
                    ))
                }
            },
            ExprKind::Slot(name) => {
                let id = self.constant(Constant::Str(name.clone()));
                self.emit(Op::GetSlot(id), line);
            }
            ExprKind::Assign(name, value) => {
                self.expr(value)?;
                let i = self.define_local(name, line, expr.col)?;
                self.emit(Op::SetLocal(i), line);
            }
            ExprKind::SlotAssign(name, value) => {
                self.expr(value)?;
                let id = self.constant(Constant::Str(name.clone()));
                self.emit(Op::SetSlot(id), line);
            }
            ExprKind::Index(container, index) => {
                self.expr(container)?;
                self.expr(index)?;
                self.emit(Op::Index, line);
            }
            ExprKind::Unary(op, operand) => {
                self.expr(operand)?;
                let op = match op {
                    UnOp::Neg => Op::Neg,
                    UnOp::Not => Op::Not,
                };
                self.emit(op, line);
            }
            ExprKind::Binary(op, lhs, rhs) => {
                self.expr(lhs)?;
                self.expr(rhs)?;
                let op = match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Mod => Op::Mod,
                    BinOp::Eq => Op::Eq,
                    BinOp::Ne => Op::Ne,
                    BinOp::Lt => Op::Lt,
                    BinOp::Le => Op::Le,
                    BinOp::Gt => Op::Gt,
                    BinOp::Ge => Op::Ge,
                };
                self.emit(op, line);
            }
            ExprKind::And(lhs, rhs) => {
                self.expr(lhs)?;
                let skip = self.emit(Op::JumpIfFalsePeek(0), line);
                self.emit(Op::Pop, line);
                self.expr(rhs)?;
                self.patch(skip, self.here());
            }
            ExprKind::Or(lhs, rhs) => {
                self.expr(lhs)?;
                let skip = self.emit(Op::JumpIfTruePeek(0), line);
                self.emit(Op::Pop, line);
                self.expr(rhs)?;
                self.patch(skip, self.here());
            }
            ExprKind::Call(name, args) => {
                for arg in args {
                    self.expr(arg)?;
                }
                let argc = args.len() as u32;
                if let Some(&id) = self.func_ids.get(name) {
                    self.emit(Op::CallFunc(id, argc), line);
                } else {
                    let builtin = match name.as_str() {
                        "len" => BUILTIN_LEN,
                        "push" => BUILTIN_PUSH,
                        _ => {
                            return Err(self.error(
                                line,
                                expr.col,
                                format!("undefined method '{name}'"),
                            ))
                        }
                    };
                    self.emit(Op::CallBuiltin(builtin, argc), line);
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Chunk {
        Chunk {
            path: self.path.to_string(),
            ops: self.ops,
            lines: self.lines,
            consts: self.consts,
            funcs: self.funcs,
            top_nlocals: self.top_nlocals,
        }
    }
}

fn last_line(stmts: &[Stmt]) -> u32 {
    last_line_at(stmts, 1)
}

fn last_line_at(stmts: &[Stmt], fallback: u32) -> u32 {
    match stmts.last() {
        Some(Stmt::Expr(expr)) => expr.line,
        Some(Stmt::If { arms, .. }) => arms.first().map(|(c, _)| c.line).unwrap_or(fallback),
        Some(Stmt::While { cond, .. }) => cond.line,
        Some(Stmt::Def { line, .. })
        | Some(Stmt::Return { line, .. })
        | Some(Stmt::Raise { line, .. })
        | Some(Stmt::Break { line, .. }) => *line,
        None => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn compile_src(src: &str) -> Result<Chunk, SyntaxError> {
        compile("test.rb", &parse("test.rb", src)?)
    }

    #[test]
    fn literals_and_pool() {
        let chunk = compile_src("\"a\"\n\"a\"\n\"a\"").unwrap();
        // Identical literals share one pool entry.
        assert_eq!(chunk.consts, vec![Constant::Str("a".to_string())]);
        assert_eq!(chunk.ops.last(), Some(&Op::Halt));
    }

    #[test]
    fn statement_values_are_dropped_except_last() {
        let chunk = compile_src("1\n2").unwrap();
        assert_eq!(
            chunk.ops,
            vec![Op::LoadInt(1), Op::Pop, Op::LoadInt(2), Op::Halt]
        );
    }

    #[test]
    fn unknown_local_is_a_compile_error() {
        let err = compile_src("x + 1").unwrap_err();
        assert!(err.message.contains("undefined local variable"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn forward_calls_resolve() {
        let chunk = compile_src("first()\ndef first\n  1\nend").unwrap();
        assert_eq!(chunk.funcs.len(), 1);
        assert!(chunk.ops.contains(&Op::CallFunc(0, 0)));
        assert_eq!(chunk.func_name(0), "first");
    }

    #[test]
    fn nested_def_is_rejected() {
        let err = compile_src("def outer\n  def inner\n  end\nend").unwrap_err();
        assert!(err.message.contains("top level"));
    }

    #[test]
    fn def_inside_a_block_is_rejected() {
        let err = compile_src("if true\n  def f\n  end\nend").unwrap_err();
        assert!(err.message.contains("top level"));
    }

    #[test]
    fn return_outside_method_is_rejected() {
        let err = compile_src("return 1").unwrap_err();
        assert!(err.message.contains("outside of method"));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let err = compile_src("break").unwrap_err();
        assert!(err.message.contains("outside of loop"));
    }

    #[test]
    fn builtins_resolve_when_not_shadowed() {
        let chunk = compile_src("len(\"abc\")").unwrap();
        assert!(chunk.ops.contains(&Op::CallBuiltin(BUILTIN_LEN, 1)));
        let chunk = compile_src("def len(s)\n  0\nend\nlen(\"abc\")").unwrap();
        assert!(chunk.ops.contains(&Op::CallFunc(0, 1)));
    }

    #[test]
    fn big_literal_goes_through_the_pool() {
        let chunk = compile_src("9000000000").unwrap();
        assert_eq!(chunk.consts, vec![Constant::Int(9_000_000_000)]);
    }
}
