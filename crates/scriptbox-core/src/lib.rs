#![forbid(unsafe_code)]
//! scriptbox-core: value model, error taxonomy, quota configuration, and
//! content hashing shared by every scriptbox crate.
//!
//! The concrete sandbox machinery (arena, interpreter, engine) lives in the
//! other crates; this one holds only the types that cross crate boundaries.

pub mod config;
pub mod error;
pub mod hash;
pub mod prelude;
pub mod value;

pub use config::{EngineConfig, EvalMode};
pub use error::{Error, Result};
pub use hash::ContentHash;
pub use value::Value;
