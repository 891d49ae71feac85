use std::time::Duration;

use thiserror::Error;

/// Canonical result for the sandbox.
pub type Result<T> = std::result::Result<T, Error>;

/// The complete error taxonomy of the sandbox. Every failure an embedder can
/// observe is exactly one of these cases.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(
        "memory capacity must be between {min_bytes}B and {max_bytes}B \
         (requested {requested}B rounded to {rounded}B)"
    )]
    InvalidCapacity {
        requested: usize,
        rounded: usize,
        min_bytes: usize,
        max_bytes: usize,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{path}:{line}:{column}: {message}")]
    Syntax {
        path: String,
        line: u32,
        column: u32,
        message: String,
    },

    /// A guest exception that terminated evaluation.
    #[error("{guest_type}: {message}")]
    Runtime {
        guest_type: String,
        message: String,
        backtrace: Vec<String>,
    },

    #[error("instruction quota reached: {quota}")]
    InstructionQuotaReached { quota: u64 },

    #[error(
        "memory quota reached: failed to allocate {requested} bytes \
         ({used} in use out of {capacity})"
    )]
    MemoryQuotaReached {
        requested: usize,
        used: usize,
        capacity: usize,
    },

    #[error("time quota reached: {quota:?}")]
    TimeQuotaReached { quota: Duration },

    #[error("native stack exhausted")]
    StackExhausted,

    /// The engine already hit a quota/stack/internal failure and refuses to
    /// run anything else.
    #[error("quota error already reached, operation aborted")]
    QuotaAlreadyReached,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid slot name {0:?}, expected @name")]
    BadSlotName(String),

    // ---- value conversion cases ----
    #[error("cannot convert {0} values across the bridge")]
    UnsupportedType(&'static str),

    #[error("integer does not fit in the host integer range")]
    OutOfRange,

    #[error("value nesting exceeds the maximum conversion depth")]
    TooDeep,
}

impl Error {
    /// True for failures that leave the engine unusable: once one of these is
    /// returned, every further operation must fail fast with
    /// [`Error::QuotaAlreadyReached`].
    pub fn taints_engine(&self) -> bool {
        matches!(
            self,
            Error::InstructionQuotaReached { .. }
                | Error::MemoryQuotaReached { .. }
                | Error::TimeQuotaReached { .. }
                | Error::StackExhausted
                | Error::Internal(_)
        )
    }
}
