//! Precompiled instruction sequences.
//!
//! Compiling once and evaluating many times skips the parser on the hot
//! path. The serialized form is stable, so its content hash identifies a
//! program across hosts and releases within one wire version.

use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

use scriptbox_core::hash::{hash_bytes, ContentHash};
use scriptbox_core::Error;
use scriptbox_vm::{compile_sources, wire, Chunk, Source};

/// Ceiling on the ops a precompiled program may contain. A larger program
/// could never finish under any reasonable runtime quota anyway.
pub const COMPILE_INSTRUCTION_QUOTA: u64 = 100_000;

/// Wall-clock budget for one compilation.
pub const COMPILE_TIME_QUOTA: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct InstructionSequence {
    chunk: Chunk,
    bytes: Vec<u8>,
    hash: OnceCell<ContentHash>,
}

impl InstructionSequence {
    /// Compile an ordered list of sources into one sequence, as if
    /// concatenated.
    pub fn compile(sources: &[Source]) -> Result<Self, Error> {
        if sources.is_empty() {
            return Err(Error::Config(
                "instruction sequence needs at least one source".to_string(),
            ));
        }
        let started = Instant::now();
        let chunk = compile_sources(sources)?;
        if started.elapsed() > COMPILE_TIME_QUOTA {
            return Err(Error::TimeQuotaReached {
                quota: COMPILE_TIME_QUOTA,
            });
        }
        if chunk.ops.len() as u64 > COMPILE_INSTRUCTION_QUOTA {
            return Err(Error::InstructionQuotaReached {
                quota: COMPILE_INSTRUCTION_QUOTA,
            });
        }
        let bytes = wire::encode(&chunk);
        Ok(Self {
            chunk,
            bytes,
            hash: OnceCell::new(),
        })
    }

    /// Rehydrate a sequence from its serialized form. Structure and indices
    /// are validated on decode; local-slot operands are checked at dispatch
    /// time, since jumps make frame extents undecidable here.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, Error> {
        let chunk = wire::decode(&bytes)
            .map_err(|err| Error::Config(format!("invalid instruction sequence: {err}")))?;
        Ok(Self {
            chunk,
            bytes,
            hash: OnceCell::new(),
        })
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Rolling hash of the serialized form, computed once.
    pub fn content_hash(&self) -> ContentHash {
        *self.hash.get_or_init(|| hash_bytes(&self.bytes))
    }

    pub fn path(&self) -> &str {
        &self.chunk.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(text: &str) -> Vec<Source> {
        vec![Source::new("checkout.rb", text)]
    }

    #[test]
    fn compiles_and_round_trips() {
        let iseq = InstructionSequence::compile(&source("@total = 1 + 2")).unwrap();
        assert!(iseq.size() > 0);
        let reloaded = InstructionSequence::from_bytes(iseq.as_bytes().to_vec()).unwrap();
        assert_eq!(reloaded.chunk(), iseq.chunk());
        assert_eq!(reloaded.content_hash(), iseq.content_hash());
    }

    #[test]
    fn hash_is_stable_and_input_sensitive() {
        let a = InstructionSequence::compile(&source("1 + 2")).unwrap();
        let b = InstructionSequence::compile(&source("1 + 2")).unwrap();
        let c = InstructionSequence::compile(&source("1 + 3")).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn syntax_errors_surface_with_position() {
        let err = InstructionSequence::compile(&source("1 +")).unwrap_err();
        assert!(matches!(err, Error::Syntax { .. }));
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        let err = InstructionSequence::from_bytes(b"not an iseq".to_vec()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn tampered_local_index_fails_instead_of_crashing() {
        use crate::engine::Engine;
        use scriptbox_vm::{Chunk, Op};

        // A well-formed blob whose local operand points outside the frame.
        let rogue = Chunk {
            path: "rogue.rb".to_string(),
            ops: vec![Op::GetLocal(100), Op::Halt],
            lines: vec![1, 1],
            consts: vec![],
            funcs: vec![],
            top_nlocals: 0,
        };
        let iseq = InstructionSequence::from_bytes(scriptbox_vm::wire::encode(&rogue)).unwrap();
        let mut engine = Engine::new(scriptbox_core::EngineConfig::default()).unwrap();
        let err = engine.load(&iseq).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn empty_source_list_is_rejected() {
        assert!(matches!(
            InstructionSequence::compile(&[]),
            Err(Error::Config(_))
        ));
    }
}
