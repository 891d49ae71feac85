//! Compiled instruction sequences. A [`Chunk`] is the portable unit the
//! compiler emits and the interpreter executes: a flat op stream plus the
//! constant pool, function table, and per-op source lines.

/// One virtual-machine instruction.
///
/// Operand widths are fixed by the serialized form: jump targets and pool
/// indices are `u32`, argument counts `u32`, immediates `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    LoadNil,
    LoadTrue,
    LoadFalse,
    /// Small integer immediate. Larger literals go through the pool.
    LoadInt(i32),
    LoadConst(u32),
    Pop,
    GetLocal(u32),
    /// Leaves the assigned value on the stack.
    SetLocal(u32),
    GetSlot(u32),
    /// Leaves the assigned value on the stack.
    SetSlot(u32),
    NewArray(u32),
    NewMap(u32),
    Index,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Jump(u32),
    /// Pops the condition.
    JumpUnless(u32),
    /// Peeks the condition, used for `||` short circuits.
    JumpIfTruePeek(u32),
    /// Peeks the condition, used for `&&` short circuits.
    JumpIfFalsePeek(u32),
    /// Call a user-defined function by table index with `argc` arguments.
    CallFunc(u32, u32),
    /// Call a builtin by id with `argc` arguments.
    CallBuiltin(u32, u32),
    Return,
    /// Raise RuntimeError with the message on top of the stack.
    Raise,
    Halt,
}

impl Op {
    /// Whether executing this op pushes a new call frame. The governor
    /// inspects native stack headroom on these.
    pub fn is_call(self) -> bool {
        matches!(self, Op::CallFunc(..) | Op::CallBuiltin(..))
    }

    /// Serialized form, (tag, a, b). Stable across releases; the wire
    /// version byte is bumped if this table ever changes.
    pub(crate) fn encode(self) -> (u8, u32, u32) {
        match self {
            Op::LoadNil => (0, 0, 0),
            Op::LoadTrue => (1, 0, 0),
            Op::LoadFalse => (2, 0, 0),
            Op::LoadInt(i) => (3, i as u32, 0),
            Op::LoadConst(i) => (4, i, 0),
            Op::Pop => (5, 0, 0),
            Op::GetLocal(i) => (6, i, 0),
            Op::SetLocal(i) => (7, i, 0),
            Op::GetSlot(i) => (8, i, 0),
            Op::SetSlot(i) => (9, i, 0),
            Op::NewArray(n) => (10, n, 0),
            Op::NewMap(n) => (11, n, 0),
            Op::Index => (12, 0, 0),
            Op::Add => (13, 0, 0),
            Op::Sub => (14, 0, 0),
            Op::Mul => (15, 0, 0),
            Op::Div => (16, 0, 0),
            Op::Mod => (17, 0, 0),
            Op::Neg => (18, 0, 0),
            Op::Not => (19, 0, 0),
            Op::Eq => (20, 0, 0),
            Op::Ne => (21, 0, 0),
            Op::Lt => (22, 0, 0),
            Op::Le => (23, 0, 0),
            Op::Gt => (24, 0, 0),
            Op::Ge => (25, 0, 0),
            Op::Jump(t) => (26, t, 0),
            Op::JumpUnless(t) => (27, t, 0),
            Op::JumpIfTruePeek(t) => (28, t, 0),
            Op::JumpIfFalsePeek(t) => (29, t, 0),
            Op::CallFunc(f, argc) => (30, f, argc),
            Op::CallBuiltin(id, argc) => (31, id, argc),
            Op::Return => (32, 0, 0),
            Op::Raise => (33, 0, 0),
            Op::Halt => (34, 0, 0),
        }
    }

    pub(crate) fn decode(tag: u8, a: u32, b: u32) -> Option<Op> {
        Some(match tag {
            0 => Op::LoadNil,
            1 => Op::LoadTrue,
            2 => Op::LoadFalse,
            3 => Op::LoadInt(a as i32),
            4 => Op::LoadConst(a),
            5 => Op::Pop,
            6 => Op::GetLocal(a),
            7 => Op::SetLocal(a),
            8 => Op::GetSlot(a),
            9 => Op::SetSlot(a),
            10 => Op::NewArray(a),
            11 => Op::NewMap(a),
            12 => Op::Index,
            13 => Op::Add,
            14 => Op::Sub,
            15 => Op::Mul,
            16 => Op::Div,
            17 => Op::Mod,
            18 => Op::Neg,
            19 => Op::Not,
            20 => Op::Eq,
            21 => Op::Ne,
            22 => Op::Lt,
            23 => Op::Le,
            24 => Op::Gt,
            25 => Op::Ge,
            26 => Op::Jump(a),
            27 => Op::JumpUnless(a),
            28 => Op::JumpIfTruePeek(a),
            29 => Op::JumpIfFalsePeek(a),
            30 => Op::CallFunc(a, b),
            31 => Op::CallBuiltin(a, b),
            32 => Op::Return,
            33 => Op::Raise,
            34 => Op::Halt,
            _ => return None,
        })
    }
}

pub const BUILTIN_LEN: u32 = 0;
pub const BUILTIN_PUSH: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i64),
    Str(String),
    Sym(String),
}

/// Entry in a chunk's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncSpec {
    /// Pool index of the function name (a `Constant::Str`).
    pub name: u32,
    pub arity: u8,
    /// Op index of the function body.
    pub entry: u32,
    /// Parameters plus locals; the frame size.
    pub nlocals: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Source path, reported in backtraces.
    pub path: String,
    pub ops: Vec<Op>,
    /// Source line of each op, parallel to `ops`.
    pub lines: Vec<u32>,
    pub consts: Vec<Constant>,
    pub funcs: Vec<FuncSpec>,
    /// Frame size of the top-level body.
    pub top_nlocals: u16,
}

impl Chunk {
    pub fn func_name(&self, index: u32) -> &str {
        let spec = &self.funcs[index as usize];
        match &self.consts[spec.name as usize] {
            Constant::Str(name) => name,
            _ => "?",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_encoding_round_trips() {
        let ops = [
            Op::LoadNil,
            Op::LoadInt(-7),
            Op::LoadConst(3),
            Op::SetLocal(2),
            Op::NewMap(4),
            Op::JumpUnless(19),
            Op::CallFunc(1, 2),
            Op::CallBuiltin(BUILTIN_PUSH, 2),
            Op::Halt,
        ];
        for op in ops {
            let (tag, a, b) = op.encode();
            assert_eq!(Op::decode(tag, a, b), Some(op));
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(Op::decode(200, 0, 0), None);
    }

    #[test]
    fn call_class_ops() {
        assert!(Op::CallFunc(0, 0).is_call());
        assert!(Op::CallBuiltin(BUILTIN_LEN, 1).is_call());
        assert!(!Op::Add.is_call());
    }
}
