//! The dispatch loop.
//!
//! [`Interp`] executes a [`Chunk`] against the guest heap. Before every
//! instruction the installed [`EvalHooks`] is consulted; its error return is
//! the abort channel the sandbox uses to stop runaway scripts. Top-level
//! slots survive across runs, which is what makes inject-eval-extract work.

use crate::chunk::{Chunk, Constant, Op, BUILTIN_LEN, BUILTIN_PUSH};
use crate::error::{EvalAbort, GuestException};
use crate::heap::{GuestHeap, GuestValue, SymbolId};

/// Guest call depth cap. Recursion past this aborts with
/// [`EvalAbort::StackExhausted`] rather than growing without bound.
const MAX_FRAMES: usize = 8 * 1024;

/// Consulted once per instruction, before the instruction runs. `is_call` is
/// set for ops that push a call frame.
pub trait EvalHooks {
    fn on_instruction(&mut self, is_call: bool) -> Result<(), EvalAbort>;
}

/// Hookless execution, used by the compiler's own tests.
pub struct NoHooks;

impl EvalHooks for NoHooks {
    fn on_instruction(&mut self, _is_call: bool) -> Result<(), EvalAbort> {
        Ok(())
    }
}

struct CallRecord {
    ret_pc: usize,
    /// Caller's frame base, restored on return.
    base: usize,
    func: u32,
}

pub struct Interp {
    heap: GuestHeap,
    slots: Vec<(SymbolId, GuestValue)>,
}

impl Interp {
    pub fn new(heap: GuestHeap) -> Interp {
        Interp {
            heap,
            slots: Vec::new(),
        }
    }

    pub fn heap(&self) -> &GuestHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut GuestHeap {
        &mut self.heap
    }

    pub fn slot(&self, name: &str) -> Option<GuestValue> {
        let id = self.slots.iter().find_map(|(sym, value)| {
            (self.heap.symbol_name(*sym) == name).then_some(*value)
        });
        id
    }

    pub fn set_slot(&mut self, name: &str, value: GuestValue) {
        let sym = self.heap.intern(name);
        self.set_slot_sym(sym, value);
    }

    fn set_slot_sym(&mut self, sym: SymbolId, value: GuestValue) {
        for (existing, slot) in &mut self.slots {
            if *existing == sym {
                *slot = value;
                return;
            }
        }
        self.slots.push((sym, value));
    }

    fn slot_sym(&self, sym: SymbolId) -> GuestValue {
        self.slots
            .iter()
            .find_map(|(existing, value)| (*existing == sym).then_some(*value))
            .unwrap_or(GuestValue::Nil)
    }

    /// Execute a chunk to completion, returning the value of its last
    /// top-level expression.
    pub fn run(
        &mut self,
        chunk: &Chunk,
        hooks: &mut dyn EvalHooks,
    ) -> Result<GuestValue, EvalAbort> {
        let mut stack: Vec<GuestValue> = Vec::with_capacity(64);
        let mut calls: Vec<CallRecord> = Vec::new();
        let mut base = 0usize;
        let mut pc = 0usize;
        stack.resize(chunk.top_nlocals as usize, GuestValue::Nil);

        let result = loop {
            let op = match chunk.ops.get(pc) {
                Some(op) => *op,
                None => {
                    break Err(EvalAbort::Internal(format!(
                        "instruction pointer out of range at {pc}"
                    )))
                }
            };
            if let Err(abort) = hooks.on_instruction(op.is_call()) {
                break Err(abort);
            }
            match self.step(chunk, op, &mut stack, &mut calls, &mut base, &mut pc) {
                Ok(Flow::Next) => {}
                Ok(Flow::Done(value)) => break Ok(value),
                Err(abort) => break Err(abort),
            }
        };
        match result {
            Err(EvalAbort::Exception(mut exc)) => {
                if exc.backtrace.is_empty() {
                    exc.backtrace = backtrace(chunk, pc, &calls);
                }
                Err(EvalAbort::Exception(exc))
            }
            other => other,
        }
    }

    fn step(
        &mut self,
        chunk: &Chunk,
        op: Op,
        stack: &mut Vec<GuestValue>,
        calls: &mut Vec<CallRecord>,
        base: &mut usize,
        pc: &mut usize,
    ) -> Result<Flow, EvalAbort> {
        let heap = &mut self.heap;
        match op {
            Op::LoadNil => stack.push(GuestValue::Nil),
            Op::LoadTrue => stack.push(GuestValue::True),
            Op::LoadFalse => stack.push(GuestValue::False),
            Op::LoadInt(i) => stack.push(GuestValue::Fixnum(i as i64)),
            Op::LoadConst(i) => {
                let value = match &chunk.consts[i as usize] {
                    Constant::Int(i) => GuestValue::Fixnum(*i),
                    Constant::Str(s) => {
                        let bytes = s.clone();
                        heap.new_str(bytes.as_bytes())?
                    }
                    Constant::Sym(s) => {
                        let name = s.clone();
                        GuestValue::Sym(heap.intern(&name))
                    }
                };
                stack.push(value);
            }
            Op::Pop => {
                pop(stack)?;
            }
            Op::GetLocal(i) => {
                // Checked: a tampered chunk can carry any operand.
                let value = *stack
                    .get(*base + i as usize)
                    .ok_or_else(|| EvalAbort::Internal("local slot out of frame".to_string()))?;
                stack.push(value);
            }
            Op::SetLocal(i) => {
                let value = *peek(stack)?;
                let slot = stack
                    .get_mut(*base + i as usize)
                    .ok_or_else(|| EvalAbort::Internal("local slot out of frame".to_string()))?;
                *slot = value;
            }
            Op::GetSlot(i) => {
                let sym = self.slot_const(chunk, i)?;
                stack.push(self.slot_sym(sym));
            }
            Op::SetSlot(i) => {
                let sym = self.slot_const(chunk, i)?;
                let value = *peek(stack)?;
                self.set_slot_sym(sym, value);
            }
            Op::NewArray(n) => {
                let items = pop_n(stack, n as usize)?;
                let value = self.heap.new_array(&items)?;
                stack.push(value);
            }
            Op::NewMap(n) => {
                let flat = pop_n(stack, n as usize * 2)?;
                let pairs: Vec<_> = flat.chunks(2).map(|p| (p[0], p[1])).collect();
                let value = self.heap.new_map(&pairs)?;
                stack.push(value);
            }
            Op::Index => {
                let index = pop(stack)?;
                let container = pop(stack)?;
                stack.push(index_value(&self.heap, container, index)?);
            }
            Op::Add => {
                let rhs = pop(stack)?;
                let lhs = pop(stack)?;
                stack.push(add(&mut self.heap, lhs, rhs)?);
            }
            Op::Sub => binop_int(stack, "-", |a, b| a.checked_sub(b))?,
            Op::Mul => {
                let rhs = pop(stack)?;
                let lhs = pop(stack)?;
                stack.push(mul(&mut self.heap, lhs, rhs)?);
            }
            Op::Div => binop_div(stack, false)?,
            Op::Mod => binop_div(stack, true)?,
            Op::Neg => {
                let value = pop(stack)?;
                match value {
                    GuestValue::Fixnum(i) => {
                        let negated = i
                            .checked_neg()
                            .ok_or_else(|| range_error("integer overflow in -"))?;
                        stack.push(GuestValue::Fixnum(negated));
                    }
                    other => {
                        return Err(type_error(format!(
                            "undefined method '-@' for {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Op::Not => {
                let value = pop(stack)?;
                stack.push(GuestValue::from_bool(!value.truthy()));
            }
            Op::Eq => {
                let rhs = pop(stack)?;
                let lhs = pop(stack)?;
                let eq = self.heap.deep_eq(lhs, rhs, 0)?;
                stack.push(GuestValue::from_bool(eq));
            }
            Op::Ne => {
                let rhs = pop(stack)?;
                let lhs = pop(stack)?;
                let eq = self.heap.deep_eq(lhs, rhs, 0)?;
                stack.push(GuestValue::from_bool(!eq));
            }
            Op::Lt => compare(&self.heap, stack, "<", |o| o.is_lt())?,
            Op::Le => compare(&self.heap, stack, "<=", |o| o.is_le())?,
            Op::Gt => compare(&self.heap, stack, ">", |o| o.is_gt())?,
            Op::Ge => compare(&self.heap, stack, ">=", |o| o.is_ge())?,
            Op::Jump(t) => {
                *pc = t as usize;
                return Ok(Flow::Next);
            }
            Op::JumpUnless(t) => {
                if !pop(stack)?.truthy() {
                    *pc = t as usize;
                    return Ok(Flow::Next);
                }
            }
            Op::JumpIfTruePeek(t) => {
                if peek(stack)?.truthy() {
                    *pc = t as usize;
                    return Ok(Flow::Next);
                }
            }
            Op::JumpIfFalsePeek(t) => {
                if !peek(stack)?.truthy() {
                    *pc = t as usize;
                    return Ok(Flow::Next);
                }
            }
            Op::CallFunc(f, argc) => {
                let spec = chunk.funcs[f as usize];
                if argc as usize != spec.arity as usize {
                    return Err(argument_error(spec.arity as usize, argc as usize));
                }
                if calls.len() >= MAX_FRAMES {
                    return Err(EvalAbort::StackExhausted);
                }
                let new_base = stack.len() - argc as usize;
                stack.resize(new_base + spec.nlocals as usize, GuestValue::Nil);
                calls.push(CallRecord {
                    ret_pc: *pc + 1,
                    base: *base,
                    func: f,
                });
                *base = new_base;
                *pc = spec.entry as usize;
                return Ok(Flow::Next);
            }
            Op::CallBuiltin(id, argc) => {
                let result = builtin(&mut self.heap, id, argc, stack)?;
                stack.push(result);
            }
            Op::Return => {
                let value = pop(stack)?;
                let record = calls.pop().ok_or_else(|| {
                    EvalAbort::Internal("return with no call frame".to_string())
                })?;
                stack.truncate(*base);
                stack.push(value);
                *base = record.base;
                *pc = record.ret_pc;
                return Ok(Flow::Next);
            }
            Op::Raise => {
                let value = pop(stack)?;
                return match value {
                    GuestValue::Str(r) => {
                        let message = String::from_utf8_lossy(self.heap.str_bytes(r)).into_owned();
                        Err(EvalAbort::Exception(GuestException::new(
                            "RuntimeError",
                            message,
                        )))
                    }
                    other => Err(type_error(format!(
                        "exception message must be a String, got {}",
                        other.type_name()
                    ))),
                };
            }
            Op::Halt => {
                let value = pop(stack)?;
                return Ok(Flow::Done(value));
            }
        }
        *pc += 1;
        Ok(Flow::Next)
    }

    fn slot_const(&mut self, chunk: &Chunk, i: u32) -> Result<SymbolId, EvalAbort> {
        match &chunk.consts[i as usize] {
            Constant::Str(name) => {
                let name = name.clone();
                Ok(self.heap.intern(&name))
            }
            other => Err(EvalAbort::Internal(format!(
                "slot name constant is {other:?}"
            ))),
        }
    }
}

enum Flow {
    Next,
    Done(GuestValue),
}

fn backtrace(chunk: &Chunk, pc: usize, calls: &[CallRecord]) -> Vec<String> {
    let mut out = Vec::with_capacity(calls.len() + 1);
    let mut cur_pc = pc.min(chunk.lines.len().saturating_sub(1));
    for record in calls.iter().rev() {
        let line = chunk.lines[cur_pc];
        out.push(format!(
            "{}:{}:in `{}'",
            chunk.path,
            line,
            chunk.func_name(record.func)
        ));
        cur_pc = (record.ret_pc - 1).min(chunk.lines.len().saturating_sub(1));
    }
    out.push(format!("{}:{}", chunk.path, chunk.lines[cur_pc]));
    out
}

fn pop(stack: &mut Vec<GuestValue>) -> Result<GuestValue, EvalAbort> {
    stack
        .pop()
        .ok_or_else(|| EvalAbort::Internal("value stack underflow".to_string()))
}

fn peek(stack: &[GuestValue]) -> Result<&GuestValue, EvalAbort> {
    stack
        .last()
        .ok_or_else(|| EvalAbort::Internal("value stack underflow".to_string()))
}

fn pop_n(stack: &mut Vec<GuestValue>, n: usize) -> Result<Vec<GuestValue>, EvalAbort> {
    if stack.len() < n {
        return Err(EvalAbort::Internal("value stack underflow".to_string()));
    }
    Ok(stack.split_off(stack.len() - n))
}

fn type_error(message: impl Into<String>) -> EvalAbort {
    EvalAbort::Exception(GuestException::new("TypeError", message))
}

fn range_error(message: impl Into<String>) -> EvalAbort {
    EvalAbort::Exception(GuestException::new("RangeError", message))
}

fn argument_error(expected: usize, given: usize) -> EvalAbort {
    EvalAbort::Exception(GuestException::new(
        "ArgumentError",
        format!("wrong number of arguments (given {given}, expected {expected})"),
    ))
}

fn int_pair(lhs: GuestValue, rhs: GuestValue, op: &str) -> Result<(i64, i64), EvalAbort> {
    match (lhs, rhs) {
        (GuestValue::Fixnum(a), GuestValue::Fixnum(b)) => Ok((a, b)),
        (GuestValue::Fixnum(_), other) => Err(type_error(format!(
            "{} can't be coerced into Integer",
            other.type_name()
        ))),
        (other, _) => Err(type_error(format!(
            "undefined method '{}' for {}",
            op,
            other.type_name()
        ))),
    }
}

fn binop_int(
    stack: &mut Vec<GuestValue>,
    op: &str,
    f: impl Fn(i64, i64) -> Option<i64>,
) -> Result<(), EvalAbort> {
    let rhs = pop(stack)?;
    let lhs = pop(stack)?;
    let (a, b) = int_pair(lhs, rhs, op)?;
    let result = f(a, b).ok_or_else(|| range_error(format!("integer overflow in {op}")))?;
    stack.push(GuestValue::Fixnum(result));
    Ok(())
}

fn add(heap: &mut GuestHeap, lhs: GuestValue, rhs: GuestValue) -> Result<GuestValue, EvalAbort> {
    match (lhs, rhs) {
        (GuestValue::Fixnum(a), GuestValue::Fixnum(b)) => a
            .checked_add(b)
            .map(GuestValue::Fixnum)
            .ok_or_else(|| range_error("integer overflow in +")),
        (GuestValue::Str(a), GuestValue::Str(b)) => heap.str_concat(a, b),
        (GuestValue::Str(_), other) => Err(type_error(format!(
            "no implicit conversion of {} into String",
            other.type_name()
        ))),
        _ => int_pair(lhs, rhs, "+").map(|_| unreachable!()),
    }
}

fn mul(heap: &mut GuestHeap, lhs: GuestValue, rhs: GuestValue) -> Result<GuestValue, EvalAbort> {
    match (lhs, rhs) {
        (GuestValue::Fixnum(a), GuestValue::Fixnum(b)) => a
            .checked_mul(b)
            .map(GuestValue::Fixnum)
            .ok_or_else(|| range_error("integer overflow in *")),
        (GuestValue::Str(s), GuestValue::Fixnum(n)) => {
            if n < 0 {
                return Err(EvalAbort::Exception(GuestException::new(
                    "ArgumentError",
                    "negative argument",
                )));
            }
            heap.str_repeat(s, n as usize)
        }
        _ => int_pair(lhs, rhs, "*").map(|_| unreachable!()),
    }
}

/// Division and modulo with Ruby semantics: quotient floors, remainder takes
/// the divisor's sign.
fn binop_div(stack: &mut Vec<GuestValue>, modulo: bool) -> Result<(), EvalAbort> {
    let rhs = pop(stack)?;
    let lhs = pop(stack)?;
    let (a, b) = int_pair(lhs, rhs, if modulo { "%" } else { "/" })?;
    if b == 0 {
        return Err(EvalAbort::Exception(GuestException::new(
            "ZeroDivisionError",
            "divided by 0",
        )));
    }
    if a == i64::MIN && b == -1 {
        return Err(range_error("integer overflow in /"));
    }
    let result = if modulo {
        let r = a % b;
        if r != 0 && (r < 0) != (b < 0) {
            r + b
        } else {
            r
        }
    } else {
        let q = a / b;
        if a % b != 0 && (a < 0) != (b < 0) {
            q - 1
        } else {
            q
        }
    };
    stack.push(GuestValue::Fixnum(result));
    Ok(())
}

fn compare(
    heap: &GuestHeap,
    stack: &mut Vec<GuestValue>,
    op: &str,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<(), EvalAbort> {
    let rhs = pop(stack)?;
    let lhs = pop(stack)?;
    let ordering = match (lhs, rhs) {
        (GuestValue::Fixnum(a), GuestValue::Fixnum(b)) => a.cmp(&b),
        (GuestValue::Str(a), GuestValue::Str(b)) => heap.str_bytes(a).cmp(heap.str_bytes(b)),
        (a, b) => {
            return Err(type_error(format!(
                "comparison of {} with {} failed ('{}')",
                a.type_name(),
                b.type_name(),
                op
            )))
        }
    };
    stack.push(GuestValue::from_bool(accept(ordering)));
    Ok(())
}

fn index_value(
    heap: &GuestHeap,
    container: GuestValue,
    index: GuestValue,
) -> Result<GuestValue, EvalAbort> {
    match container {
        GuestValue::Array(r) => {
            let i = match index {
                GuestValue::Fixnum(i) => i,
                other => {
                    return Err(type_error(format!(
                        "no implicit conversion of {} into Integer",
                        other.type_name()
                    )))
                }
            };
            let len = heap.array_len(r) as i64;
            let i = if i < 0 { i + len } else { i };
            if i < 0 || i >= len {
                return Ok(GuestValue::Nil);
            }
            Ok(heap.array_get(r, i as usize).unwrap_or(GuestValue::Nil))
        }
        GuestValue::Map(r) => Ok(heap.map_get(r, index)?.unwrap_or(GuestValue::Nil)),
        GuestValue::Str(_) => Err(type_error("string indexing is not supported")),
        other => Err(type_error(format!(
            "undefined method '[]' for {}",
            other.type_name()
        ))),
    }
}

fn builtin(
    heap: &mut GuestHeap,
    id: u32,
    argc: u32,
    stack: &mut Vec<GuestValue>,
) -> Result<GuestValue, EvalAbort> {
    match id {
        BUILTIN_LEN => {
            if argc != 1 {
                return Err(argument_error(1, argc as usize));
            }
            let value = pop(stack)?;
            let len = match value {
                GuestValue::Str(r) => String::from_utf8_lossy(heap.str_bytes(r)).chars().count(),
                GuestValue::Array(r) => heap.array_len(r),
                GuestValue::Map(r) => heap.map_len(r),
                other => {
                    return Err(type_error(format!(
                        "undefined method 'len' for {}",
                        other.type_name()
                    )))
                }
            };
            Ok(GuestValue::Fixnum(len as i64))
        }
        BUILTIN_PUSH => {
            if argc != 2 {
                return Err(argument_error(2, argc as usize));
            }
            let value = pop(stack)?;
            let target = pop(stack)?;
            match target {
                GuestValue::Array(r) => {
                    heap.array_push(r, value)?;
                    Ok(target)
                }
                other => Err(type_error(format!(
                    "undefined method 'push' for {}",
                    other.type_name()
                ))),
            }
        }
        _ => Err(EvalAbort::Internal(format!("unknown builtin {id}"))),
    }
}
