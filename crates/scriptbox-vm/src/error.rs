//! Error channels of the interpreter.
//!
//! [`EvalAbort`] is the single designated unwind channel out of guest
//! execution. It is the error type of the dispatch loop's `Result`, so it
//! propagates through every layer of the VM and is normalized exactly once at
//! the engine boundary. Guest code has no construct that can observe or
//! intercept it.

use thiserror::Error;

use scriptbox_core::Error as CoreError;

/// A guest exception: what the script itself raised (or provoked).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestException {
    pub class_name: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

impl GuestException {
    pub fn new(class_name: &str, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.to_string(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }
}

/// Terminal outcome of an aborted evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalAbort {
    #[error("instruction quota reached: {quota}")]
    InstructionQuotaReached { quota: u64 },

    #[error("memory quota reached: requested {requested} bytes")]
    MemoryQuotaReached {
        requested: usize,
        used: usize,
        capacity: usize,
    },

    #[error("time quota reached")]
    TimeQuotaReached,

    #[error("native stack exhausted")]
    StackExhausted,

    #[error("{}: {}", .0.class_name, .0.message)]
    Exception(GuestException),

    #[error("internal error: {0}")]
    Internal(String),
}

/// A parse or compile failure, reported for the first error encountered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}:{line}:{column}: {message}")]
pub struct SyntaxError {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl From<SyntaxError> for CoreError {
    fn from(err: SyntaxError) -> Self {
        CoreError::Syntax {
            path: err.path,
            line: err.line,
            column: err.column,
            message: err.message,
        }
    }
}
