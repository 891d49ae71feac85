//! The quota governor: an [`EvalHooks`] implementation consulted before
//! every guest instruction.
//!
//! The instruction count is cumulative over the engine's lifetime; it is
//! never reset between evaluations, so a quota of N bounds the total work an
//! engine can ever do. The count is checked before it is incremented, which
//! makes the boundary exact: after an instruction-quota abort the count
//! equals the quota.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use scriptbox_vm::{EvalAbort, EvalHooks};

/// Native stack headroom required to dispatch a call. Matches the deepest
/// host recursion an instruction can trigger, with a wide margin.
pub const STACK_MINIMUM: usize = 0x10000;

/// Deadline and cancel-flag checks are amortized over this many
/// instructions. The clock read is the expensive part of the hook.
const TIME_CHECK_MASK: u64 = 0xff;

pub struct QuotaGovernor {
    instruction_quota: u64,
    instruction_count: u64,
    deadline: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
    stack_base: usize,
    stack_size: usize,
    check_stack: bool,
}

impl QuotaGovernor {
    pub fn new(instruction_quota: u64) -> Self {
        Self {
            instruction_quota,
            instruction_count: 0,
            deadline: None,
            cancel: None,
            stack_base: 0,
            stack_size: 0,
            check_stack: false,
        }
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn instruction_quota(&self) -> u64 {
        self.instruction_quota
    }

    /// Install the per-evaluation limits. Must be called on the thread that
    /// will run the evaluation: `stack_base` is an address near the top of
    /// that thread's stack.
    pub fn arm(
        &mut self,
        deadline: Option<Instant>,
        cancel: Option<Arc<AtomicBool>>,
        stack_base: usize,
        stack_size: usize,
    ) {
        self.deadline = deadline;
        self.cancel = cancel;
        self.stack_base = stack_base;
        self.stack_size = stack_size;
        self.check_stack = stack_size != 0;
    }

    /// Clear the per-evaluation limits. The instruction count stays.
    pub fn disarm(&mut self) {
        self.deadline = None;
        self.cancel = None;
        self.stack_base = 0;
        self.stack_size = 0;
        self.check_stack = false;
    }
}

/// An address near the top of the calling frame, used as a stack probe.
#[inline]
pub fn stack_position() -> usize {
    let marker = 0u8;
    &marker as *const u8 as usize
}

impl EvalHooks for QuotaGovernor {
    fn on_instruction(&mut self, is_call: bool) -> Result<(), EvalAbort> {
        if self.instruction_count >= self.instruction_quota {
            return Err(EvalAbort::InstructionQuotaReached {
                quota: self.instruction_quota,
            });
        }
        self.instruction_count += 1;

        if self.instruction_count & TIME_CHECK_MASK == 0 {
            if let Some(cancel) = &self.cancel {
                if cancel.load(Ordering::Relaxed) {
                    return Err(EvalAbort::TimeQuotaReached);
                }
            }
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(EvalAbort::TimeQuotaReached);
                }
            }
        }

        if is_call && self.check_stack {
            let used = self.stack_base.saturating_sub(stack_position());
            if used + STACK_MINIMUM > self.stack_size {
                return Err(EvalAbort::StackExhausted);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_boundary_is_exact() {
        let mut governor = QuotaGovernor::new(5);
        for _ in 0..5 {
            governor.on_instruction(false).unwrap();
        }
        assert_eq!(governor.instruction_count(), 5);
        let err = governor.on_instruction(false).unwrap_err();
        assert_eq!(err, EvalAbort::InstructionQuotaReached { quota: 5 });
        // The failed instruction did not count.
        assert_eq!(governor.instruction_count(), 5);
    }

    #[test]
    fn count_accumulates_across_evaluations() {
        let mut governor = QuotaGovernor::new(10);
        for _ in 0..6 {
            governor.on_instruction(false).unwrap();
        }
        governor.disarm();
        governor.arm(None, None, stack_position(), 0);
        for _ in 0..4 {
            governor.on_instruction(false).unwrap();
        }
        assert!(governor.on_instruction(false).is_err());
    }

    #[test]
    fn cancel_flag_aborts_at_a_check_point() {
        let mut governor = QuotaGovernor::new(u64::MAX);
        let cancel = Arc::new(AtomicBool::new(false));
        governor.arm(None, Some(Arc::clone(&cancel)), 0, 0);
        for _ in 0..300 {
            governor.on_instruction(false).unwrap();
        }
        cancel.store(true, Ordering::Relaxed);
        let err = (0..300)
            .find_map(|_| governor.on_instruction(false).err())
            .expect("cancel must abort within one check interval");
        assert_eq!(err, EvalAbort::TimeQuotaReached);
    }

    #[test]
    fn expired_deadline_aborts() {
        let mut governor = QuotaGovernor::new(u64::MAX);
        governor.arm(Some(Instant::now()), None, 0, 0);
        let err = (0..300)
            .find_map(|_| governor.on_instruction(false).err())
            .expect("deadline must abort within one check interval");
        assert_eq!(err, EvalAbort::TimeQuotaReached);
    }

    #[test]
    fn shallow_stack_fails_calls_only() {
        let mut governor = QuotaGovernor::new(u64::MAX);
        // Pretend the whole stack is smaller than the required headroom.
        governor.arm(None, None, stack_position(), STACK_MINIMUM / 2);
        governor.on_instruction(false).unwrap();
        assert_eq!(
            governor.on_instruction(true).unwrap_err(),
            EvalAbort::StackExhausted
        );
    }
}
