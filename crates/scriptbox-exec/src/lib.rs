//! scriptbox-exec: quota enforcement and the embedder-facing engine.
//!
//! An [`Engine`] owns one interpreter, one arena, and one [`QuotaGovernor`].
//! Monitored evaluation runs the interpreter on a dedicated worker thread
//! under a deadline; the governor turns quota overruns into aborts at the
//! next instruction boundary. An engine that hits a quota is spent and
//! refuses further evaluation.

pub mod bridge;
pub mod engine;
pub mod governor;
pub mod iseq;
pub mod supervisor;

pub use engine::{Engine, EngineStat};
pub use governor::QuotaGovernor;
pub use iseq::InstructionSequence;
