//! Monitored evaluation: run a closure on a dedicated worker thread under a
//! wall-clock deadline.
//!
//! The worker is never killed. When the deadline passes, the monitor raises
//! the shared cancel flag and keeps waiting; the governor observes the flag
//! at an instruction boundary and unwinds the worker cleanly. A timeout
//! outranks whatever the worker itself reports while being cancelled.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use scriptbox_vm::EvalAbort;

/// Stack size of the evaluation worker. The governor's headroom checks are
/// relative to this figure.
pub const WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Per-evaluation limits handed to the worker closure, valid on the worker
/// thread only.
pub struct Session {
    pub deadline: Instant,
    pub cancel: Arc<AtomicBool>,
    pub stack_size: usize,
}

/// Signals completion when the worker exits, normally or by panic.
struct DoneGuard<'a> {
    done: &'a Mutex<bool>,
    condvar: &'a Condvar,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.condvar.notify_all();
    }
}

/// Run `body` on a worker thread, waiting at most `time_quota` before
/// requesting cancellation.
pub fn run_monitored<T, F>(time_quota: Duration, body: F) -> Result<T, EvalAbort>
where
    T: Send,
    F: FnOnce(&Session) -> Result<T, EvalAbort> + Send,
{
    let deadline = Instant::now() + time_quota;
    let cancel = Arc::new(AtomicBool::new(false));
    let done = Mutex::new(false);
    let condvar = Condvar::new();
    let outcome: Mutex<Option<Result<T, EvalAbort>>> = Mutex::new(None);

    thread::scope(|scope| {
        let worker = thread::Builder::new()
            .name("scriptbox-eval".to_string())
            .stack_size(WORKER_STACK_SIZE)
            .spawn_scoped(scope, {
                let session = Session {
                    deadline,
                    cancel: Arc::clone(&cancel),
                    stack_size: WORKER_STACK_SIZE,
                };
                let done = &done;
                let condvar = &condvar;
                let outcome = &outcome;
                move || {
                    let _guard = DoneGuard { done, condvar };
                    let result = body(&session);
                    *outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
                }
            })
            .map_err(|err| EvalAbort::Internal(format!("failed to spawn eval worker: {err}")))?;

        let mut timed_out = false;
        let mut finished = done.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *finished {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                cancel.store(true, std::sync::atomic::Ordering::Relaxed);
                while !*finished {
                    finished = condvar
                        .wait(finished)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                break;
            }
            finished = condvar
                .wait_timeout(finished, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(finished);

        let panicked = worker.join().is_err();
        if timed_out {
            // The deadline verdict stands even if the worker recorded its
            // own abort while unwinding.
            return Err(EvalAbort::TimeQuotaReached);
        }
        if panicked {
            return Err(EvalAbort::Internal("eval worker panicked".to_string()));
        }
        outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| {
                Err(EvalAbort::Internal(
                    "eval worker exited without a result".to_string(),
                ))
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn fast_work_returns_its_value() {
        let result = run_monitored(Duration::from_secs(1), |_session| Ok(21 * 2));
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn worker_errors_pass_through() {
        let result: Result<(), _> = run_monitored(Duration::from_secs(1), |_session| {
            Err(EvalAbort::StackExhausted)
        });
        assert_eq!(result, Err(EvalAbort::StackExhausted));
    }

    #[test]
    fn timeout_cancels_a_cooperative_worker() {
        let started = Instant::now();
        let result: Result<(), _> = run_monitored(Duration::from_millis(50), |session| {
            while !session.cancel.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
            Ok(())
        });
        assert_eq!(result, Err(EvalAbort::TimeQuotaReached));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn timeout_outranks_the_worker_verdict() {
        let result: Result<(), _> = run_monitored(Duration::from_millis(50), |session| {
            while !session.cancel.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
            Err(EvalAbort::InstructionQuotaReached { quota: 1 })
        });
        assert_eq!(result, Err(EvalAbort::TimeQuotaReached));
    }

    #[test]
    fn worker_panic_is_an_internal_error() {
        let result: Result<(), _> =
            run_monitored(Duration::from_secs(1), |_session| panic!("boom"));
        assert!(matches!(result, Err(EvalAbort::Internal(_))));
    }
}
