//! scriptbox-vm: the guest interpreter.
//!
//! A small Ruby-flavored scripting language compiled to bytecode and executed
//! by a dispatch loop. The interpreter exposes exactly the collaborator
//! contract the sandbox requires:
//! - every guest-heap byte is drawn from the [`scriptbox_mem::Arena`]
//!   (allocation hook),
//! - an [`EvalHooks`] implementation is consulted once per dispatched
//!   instruction, before that instruction executes (execution hook),
//! - guest exceptions are introspectable with class, message, and backtrace,
//! - compiled chunks serialize to and from a versioned byte format.
//!
//! There is no rescue construct in the language, so guest code cannot
//! intercept the hook's abort channel.

pub mod ast;
pub mod chunk;
pub mod compile;
pub mod error;
pub mod heap;
pub mod lexer;
pub mod parser;
pub mod vm;
pub mod wire;

pub use chunk::{Chunk, Constant, Op};
pub use error::{EvalAbort, GuestException, SyntaxError};
pub use heap::{GuestHeap, GuestValue};
pub use vm::{EvalHooks, Interp, NoHooks};

use scriptbox_mem::Arena;

/// One source unit handed to the compiler.
#[derive(Debug, Clone)]
pub struct Source {
    pub path: String,
    pub text: String,
}

impl Source {
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }
}

/// Parse and compile a single source unit into a chunk.
pub fn compile_source(source: &Source) -> Result<Chunk, SyntaxError> {
    let stmts = parser::parse(&source.path, &source.text)?;
    compile::compile(&source.path, &stmts)
}

/// Parse and compile an ordered, non-empty list of sources into one chunk, as
/// if they were concatenated in order. Paths are preserved per statement for
/// error reporting of the unit that failed.
pub fn compile_sources(sources: &[Source]) -> Result<Chunk, SyntaxError> {
    assert!(!sources.is_empty(), "source list must be non-empty");
    let mut all = Vec::new();
    for source in sources {
        all.extend(parser::parse(&source.path, &source.text)?);
    }
    compile::compile(&sources[0].path, &all)
}

/// Build a fresh interpreter drawing from the given arena.
pub fn interp_with_arena(arena: Arena) -> Interp {
    Interp::new(GuestHeap::new(arena))
}
