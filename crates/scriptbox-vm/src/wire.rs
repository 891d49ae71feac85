//! Binary form of a compiled chunk. Always little-endian so the byte image,
//! and therefore its content hash, is identical across hosts.
//!
//! Layout: magic, version, endian tag, then path, constant pool, function
//! table, top-level frame size, and the op stream. All lengths are `u32`.

use thiserror::Error;

use crate::chunk::{Chunk, Constant, FuncSpec, Op};

const MAGIC: &[u8; 4] = b"SBIS";
const VERSION: u8 = 1;
const ENDIAN: u8 = b'L';

const CONST_INT: u8 = 0;
const CONST_STR: u8 = 1;
const CONST_SYM: u8 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("bad magic, not an instruction sequence")]
    BadMagic,
    #[error("unsupported instruction sequence version {0}")]
    UnsupportedVersion(u8),
    #[error("truncated instruction sequence")]
    Truncated,
    #[error("unknown opcode tag {0}")]
    BadOpcode(u8),
    #[error("unknown constant tag {0}")]
    BadConstTag(u8),
    #[error("string constant is not valid utf-8")]
    BadUtf8,
    #[error("instruction sequence references out-of-range {0}")]
    BadIndex(&'static str),
}

pub fn encode(chunk: &Chunk) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + chunk.ops.len() * 13);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(ENDIAN);
    put_bytes(&mut out, chunk.path.as_bytes());
    put_u32(&mut out, chunk.consts.len() as u32);
    for c in &chunk.consts {
        match c {
            Constant::Int(i) => {
                out.push(CONST_INT);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Constant::Str(s) => {
                out.push(CONST_STR);
                put_bytes(&mut out, s.as_bytes());
            }
            Constant::Sym(s) => {
                out.push(CONST_SYM);
                put_bytes(&mut out, s.as_bytes());
            }
        }
    }
    put_u32(&mut out, chunk.funcs.len() as u32);
    for f in &chunk.funcs {
        put_u32(&mut out, f.name);
        out.push(f.arity);
        put_u32(&mut out, f.entry);
        out.extend_from_slice(&f.nlocals.to_le_bytes());
    }
    out.extend_from_slice(&chunk.top_nlocals.to_le_bytes());
    put_u32(&mut out, chunk.ops.len() as u32);
    for (op, line) in chunk.ops.iter().zip(&chunk.lines) {
        let (tag, a, b) = op.encode();
        out.push(tag);
        put_u32(&mut out, a);
        put_u32(&mut out, b);
        put_u32(&mut out, *line);
    }
    out
}

pub fn decode(data: &[u8]) -> Result<Chunk, WireError> {
    let mut r = Reader { data, pos: 0 };
    if r.take(4)? != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = r.u8()?;
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    if r.u8()? != ENDIAN {
        return Err(WireError::BadMagic);
    }
    let path = r.string()?;
    let nconsts = r.u32()? as usize;
    let mut consts = Vec::with_capacity(nconsts.min(1 << 16));
    for _ in 0..nconsts {
        consts.push(match r.u8()? {
            CONST_INT => Constant::Int(i64::from_le_bytes(
                r.take(8)?.try_into().map_err(|_| WireError::Truncated)?,
            )),
            CONST_STR => Constant::Str(r.string()?),
            CONST_SYM => Constant::Sym(r.string()?),
            tag => return Err(WireError::BadConstTag(tag)),
        });
    }
    let nfuncs = r.u32()? as usize;
    let mut funcs = Vec::with_capacity(nfuncs.min(1 << 16));
    for _ in 0..nfuncs {
        let name = r.u32()?;
        let arity = r.u8()?;
        let entry = r.u32()?;
        let nlocals = u16::from_le_bytes(r.take(2)?.try_into().map_err(|_| WireError::Truncated)?);
        funcs.push(FuncSpec {
            name,
            arity,
            entry,
            nlocals,
        });
    }
    let top_nlocals = u16::from_le_bytes(r.take(2)?.try_into().map_err(|_| WireError::Truncated)?);
    let nops = r.u32()? as usize;
    let mut ops = Vec::with_capacity(nops.min(1 << 20));
    let mut lines = Vec::with_capacity(nops.min(1 << 20));
    for _ in 0..nops {
        let tag = r.u8()?;
        let a = r.u32()?;
        let b = r.u32()?;
        let op = Op::decode(tag, a, b).ok_or(WireError::BadOpcode(tag))?;
        ops.push(op);
        lines.push(r.u32()?);
    }
    if r.pos != r.data.len() {
        return Err(WireError::BadMagic);
    }
    let chunk = Chunk {
        path,
        ops,
        lines,
        consts,
        funcs,
        top_nlocals,
    };
    validate(&chunk)?;
    Ok(chunk)
}

/// Reject chunks whose indices point outside their own tables. A chunk that
/// passes runs without bounds surprises in the dispatch loop.
fn validate(chunk: &Chunk) -> Result<(), WireError> {
    let nops = chunk.ops.len() as u32;
    let nconsts = chunk.consts.len() as u32;
    let nfuncs = chunk.funcs.len() as u32;
    for op in &chunk.ops {
        let ok = match *op {
            Op::LoadConst(i) | Op::GetSlot(i) | Op::SetSlot(i) => i < nconsts,
            Op::Jump(t) | Op::JumpUnless(t) | Op::JumpIfTruePeek(t) | Op::JumpIfFalsePeek(t) => {
                t <= nops
            }
            Op::CallFunc(f, _) => f < nfuncs,
            _ => true,
        };
        if !ok {
            return Err(WireError::BadIndex("op operand"));
        }
    }
    for f in &chunk.funcs {
        if f.name >= nconsts || f.entry > nops {
            return Err(WireError::BadIndex("function entry"));
        }
        if !matches!(chunk.consts.get(f.name as usize), Some(Constant::Str(_))) {
            return Err(WireError::BadIndex("function name"));
        }
    }
    Ok(())
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.data.len() - self.pos < n {
            return Err(WireError::Truncated);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadUtf8)
    }
}
