//! scriptbox-mem: the capacity-bounded guest-heap arena.
//!
//! Every guest-heap allocation in the sandbox is drawn from an [`Arena`]: an
//! anonymous, page-rounded OS mapping with a free-space allocator carved
//! inside it. The capacity ceiling is enforced at two layers: the arena's own
//! allocation accounting and the fixed size of the mapping itself. An arena
//! never grows; allocation failure returns `None` and the caller decides what
//! that means (for the engine: a memory quota breach).
//!
//! This crate contains the only `unsafe` memory management in the workspace.

pub mod arena;
pub mod error;
pub mod tracking;

pub use arena::Arena;
pub use error::ArenaError;
pub use tracking::PeakTracker;
