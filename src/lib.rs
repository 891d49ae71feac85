//! scriptbox: a quota-governed sandbox for embedding untrusted guest
//! scripts.
//!
//! An [`Engine`] is one sandbox instance: a capacity-bounded memory arena, a
//! bytecode interpreter for a small Ruby-flavored guest language, and a
//! governor that enforces instruction, memory, and wall-clock quotas. Values
//! cross in and out through named top-level slots.
//!
//! ```no_run
//! use scriptbox::{Engine, EngineConfig, Value};
//!
//! let mut engine = Engine::new(EngineConfig::default())?;
//! engine.inject("@prices", &Value::Array(vec![Value::Integer(300), Value::Integer(142)]))?;
//! engine.eval("sum.rb", "@total = @prices[0] + @prices[1]")?;
//! assert_eq!(engine.extract("@total")?, Value::Integer(442));
//! # Ok::<(), scriptbox::Error>(())
//! ```

pub use scriptbox_core::config::{CAPACITY_MAX, CAPACITY_MIN, KIB, MIB};
pub use scriptbox_core::{ContentHash, EngineConfig, Error, EvalMode, Result, Value};
pub use scriptbox_exec::{Engine, EngineStat, InstructionSequence};
pub use scriptbox_mem::Arena;
pub use scriptbox_vm::Source;
