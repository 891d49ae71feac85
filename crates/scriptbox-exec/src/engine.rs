//! The embedder-facing engine: one arena, one interpreter, one governor.
//!
//! The quota state is engine-scoped. Instructions accumulate across
//! evaluations, slots persist across evaluations, and the first quota, stack,
//! or internal failure marks the engine spent: every later evaluation fails
//! fast with [`Error::QuotaAlreadyReached`]. Build a fresh engine per unit of
//! untrusted work.

use std::time::Duration;

use serde::Serialize;

use scriptbox_core::{EngineConfig, Error, EvalMode, Result, Value};
use scriptbox_mem::Arena;
use scriptbox_vm::{compile_source, interp_with_arena, Chunk, EvalAbort, Interp, Source};

use crate::bridge;
use crate::governor::{stack_position, QuotaGovernor};
use crate::iseq::InstructionSequence;
use crate::supervisor::run_monitored;

/// Point-in-time resource usage of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStat {
    pub instructions: u64,
    pub memory_used: usize,
    pub memory_peak: usize,
    pub memory_capacity: usize,
}

pub struct Engine {
    interp: Interp,
    governor: QuotaGovernor,
    config: EngineConfig,
    tainted: bool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Engine> {
        config.validate()?;
        let arena = Arena::new(config.memory_capacity)?;
        Ok(Engine {
            interp: interp_with_arena(arena),
            governor: QuotaGovernor::new(config.instruction_quota),
            config,
            tainted: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a quota/stack/internal failure has made this engine refuse
    /// further work.
    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn stat(&self) -> EngineStat {
        let arena = self.interp.heap().arena();
        EngineStat {
            instructions: self.governor.instruction_count(),
            memory_used: arena.allocation(),
            memory_peak: arena.peak_allocation(),
            memory_capacity: arena.capacity(),
        }
    }

    /// Compile and evaluate one source unit, returning the value of its last
    /// top-level expression.
    pub fn eval(&mut self, path: &str, source: &str) -> Result<Value> {
        if self.tainted {
            return Err(Error::QuotaAlreadyReached);
        }
        let chunk = compile_source(&Source::new(path, source))?;
        self.run_chunk(&chunk)
    }

    /// Evaluate a precompiled instruction sequence. Equivalent to evaluating
    /// the sources it was compiled from.
    pub fn load(&mut self, iseq: &InstructionSequence) -> Result<Value> {
        if self.tainted {
            return Err(Error::QuotaAlreadyReached);
        }
        self.run_chunk(iseq.chunk())
    }

    /// Copy a host value into the guest as top-level slot `@name`.
    pub fn inject(&mut self, name: &str, value: &Value) -> Result<()> {
        if self.tainted {
            return Err(Error::QuotaAlreadyReached);
        }
        let slot = slot_name(name)?;
        let guest = match bridge::to_guest(&mut self.interp, value) {
            Ok(guest) => guest,
            Err(err) => {
                if err.taints_engine() {
                    self.tainted = true;
                }
                return Err(err);
            }
        };
        self.interp.set_slot(slot, guest);
        Ok(())
    }

    /// Copy top-level slot `@name` out of the guest. An unset slot reads as
    /// [`Value::Nil`].
    pub fn extract(&self, name: &str) -> Result<Value> {
        if self.tainted {
            return Err(Error::QuotaAlreadyReached);
        }
        let slot = slot_name(name)?;
        match self.interp.slot(slot) {
            Some(value) => bridge::to_host(&self.interp, value),
            None => Ok(Value::Nil),
        }
    }

    fn run_chunk(&mut self, chunk: &Chunk) -> Result<Value> {
        let time_quota = self.config.time_quota;
        let interp = &mut self.interp;
        let governor = &mut self.governor;
        let outcome = match self.config.mode {
            EvalMode::Monitored => run_monitored(time_quota, |session| {
                governor.arm(
                    Some(session.deadline),
                    Some(session.cancel.clone()),
                    stack_position(),
                    session.stack_size,
                );
                let result = interp.run(chunk, governor);
                governor.disarm();
                result
            }),
            EvalMode::Unmonitored => interp.run(chunk, governor),
        };
        match outcome {
            Ok(value) => bridge::to_host(&self.interp, value),
            Err(abort) => {
                let err = abort_to_error(abort, time_quota);
                if err.taints_engine() {
                    self.tainted = true;
                }
                Err(err)
            }
        }
    }
}

fn abort_to_error(abort: EvalAbort, time_quota: Duration) -> Error {
    match abort {
        EvalAbort::InstructionQuotaReached { quota } => Error::InstructionQuotaReached { quota },
        EvalAbort::MemoryQuotaReached {
            requested,
            used,
            capacity,
        } => Error::MemoryQuotaReached {
            requested,
            used,
            capacity,
        },
        EvalAbort::TimeQuotaReached => Error::TimeQuotaReached { quota: time_quota },
        EvalAbort::StackExhausted => Error::StackExhausted,
        EvalAbort::Exception(exc) => Error::Runtime {
            guest_type: exc.class_name,
            message: exc.message,
            backtrace: exc.backtrace,
        },
        EvalAbort::Internal(message) => Error::Internal(message),
    }
}

/// Validate `@name` and strip the sigil.
fn slot_name(name: &str) -> Result<&str> {
    let bad = || Error::BadSlotName(name.to_string());
    let stripped = name.strip_prefix('@').ok_or_else(bad)?;
    let mut chars = stripped.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return Err(bad()),
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(stripped)
    } else {
        Err(bad())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptbox_core::config::MIB;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    fn engine_with(f: impl FnOnce(&mut EngineConfig)) -> Engine {
        let mut config = EngineConfig::default();
        f(&mut config);
        Engine::new(config).unwrap()
    }

    #[test]
    fn evaluates_and_returns_the_last_expression() {
        let mut engine = engine();
        let value = engine.eval("checkout.rb", "a = 2\na * 21").unwrap();
        assert_eq!(value, Value::Integer(42));
    }

    #[test]
    fn inject_eval_extract() {
        let mut engine = engine();
        engine
            .inject("@input", &Value::Array(vec![Value::Integer(1), Value::Integer(2)]))
            .unwrap();
        engine
            .eval("sum.rb", "@output = @input[0] + @input[1]")
            .unwrap();
        assert_eq!(engine.extract("@output").unwrap(), Value::Integer(3));
        assert_eq!(engine.extract("@never_set").unwrap(), Value::Nil);
    }

    #[test]
    fn slot_names_are_validated() {
        let mut engine = engine();
        for name in ["output", "@", "@9lives", "@bad-name", "@Upper"] {
            assert!(matches!(
                engine.inject(name, &Value::Nil),
                Err(Error::BadSlotName(_))
            ));
            assert!(matches!(engine.extract(name), Err(Error::BadSlotName(_))));
        }
    }

    #[test]
    fn guest_exceptions_do_not_taint() {
        let mut engine = engine();
        let err = engine.eval("boom.rb", "raise \"nope\"").unwrap_err();
        assert!(matches!(err, Error::Runtime { ref guest_type, .. } if guest_type == "RuntimeError"));
        assert!(!engine.is_tainted());
        assert_eq!(
            engine.eval("ok.rb", "1 + 1").unwrap(),
            Value::Integer(2)
        );
    }

    #[test]
    fn syntax_errors_do_not_taint() {
        let mut engine = engine();
        assert!(matches!(
            engine.eval("bad.rb", "1 +"),
            Err(Error::Syntax { .. })
        ));
        assert!(!engine.is_tainted());
    }

    #[test]
    fn instruction_quota_taints_the_engine() {
        let mut engine = engine_with(|c| c.instruction_quota = 1_000);
        let err = engine
            .eval("spin.rb", "while true\n  1\nend")
            .unwrap_err();
        assert_eq!(err, Error::InstructionQuotaReached { quota: 1_000 });
        assert!(engine.is_tainted());
        assert_eq!(
            engine.eval("after.rb", "1").unwrap_err(),
            Error::QuotaAlreadyReached
        );
        assert_eq!(
            engine.inject("@x", &Value::Nil).unwrap_err(),
            Error::QuotaAlreadyReached
        );
        assert_eq!(engine.stat().instructions, 1_000);
    }

    #[test]
    fn time_quota_aborts_promptly() {
        let mut engine = engine_with(|c| {
            c.time_quota = Duration::from_millis(50);
            c.instruction_quota = u64::MAX;
        });
        let started = std::time::Instant::now();
        let err = engine
            .eval("spin.rb", "while true\n  1\nend")
            .unwrap_err();
        assert_eq!(
            err,
            Error::TimeQuotaReached {
                quota: Duration::from_millis(50)
            }
        );
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(engine.is_tainted());
    }

    #[test]
    fn memory_quota_aborts_allocation() {
        let mut engine = engine_with(|c| c.memory_capacity = 256 * 1024);
        let err = engine
            .eval(
                "grow.rb",
                "s = \"xxxxxxxxxxxxxxxx\"\nwhile true\n  s = s + s\nend",
            )
            .unwrap_err();
        assert!(matches!(err, Error::MemoryQuotaReached { .. }));
        assert!(engine.is_tainted());
    }

    #[test]
    fn unmonitored_mode_still_enforces_instructions() {
        let mut engine = engine_with(|c| {
            c.mode = EvalMode::Unmonitored;
            c.instruction_quota = 1_000;
        });
        assert_eq!(
            engine.eval("ok.rb", "6 * 7").unwrap(),
            Value::Integer(42)
        );
        let err = engine
            .eval("spin.rb", "while true\n  1\nend")
            .unwrap_err();
        assert_eq!(err, Error::InstructionQuotaReached { quota: 1_000 });
    }

    #[test]
    fn stat_reports_memory_and_instructions() {
        let mut engine = engine_with(|c| c.memory_capacity = MIB);
        let before = engine.stat();
        assert_eq!(before.instructions, 0);
        engine.eval("alloc.rb", "@keep = \"0123456789\" * 100").unwrap();
        let after = engine.stat();
        assert!(after.instructions > 0);
        assert!(after.memory_used >= 1000);
        assert!(after.memory_peak >= after.memory_used);
        assert_eq!(after.memory_capacity, engine.config().memory_capacity);
    }

    #[test]
    fn invalid_capacity_is_rejected_up_front() {
        let config = EngineConfig {
            memory_capacity: 1024,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::new(config),
            Err(Error::InvalidCapacity { .. })
        ));
    }
}
