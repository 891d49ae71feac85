//! Convenient re-exports for downstream crates.

pub use crate::config::{EngineConfig, EvalMode, CAPACITY_MAX, CAPACITY_MIN, KIB, MIB};
pub use crate::error::{Error, Result};
pub use crate::hash::{hash_bytes, ContentHash};
pub use crate::value::Value;
