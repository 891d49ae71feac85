use thiserror::Error;

use scriptbox_core::Error as CoreError;

/// Result type local to scriptbox-mem.
pub type Result<T> = std::result::Result<T, ArenaError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error(
        "arena capacity must be between {min}B and {max}B \
         (requested {requested}B rounded to {rounded}B)"
    )]
    InvalidCapacity {
        requested: usize,
        rounded: usize,
        min: usize,
        max: usize,
    },

    #[error("failed to map {rounded}B arena (rounded from {requested}B): errno {errno}")]
    MapFailed {
        requested: usize,
        rounded: usize,
        errno: i32,
    },
}

impl From<ArenaError> for CoreError {
    fn from(err: ArenaError) -> Self {
        match err {
            ArenaError::InvalidCapacity {
                requested,
                rounded,
                min,
                max,
            } => CoreError::InvalidCapacity {
                requested,
                rounded,
                min_bytes: min,
                max_bytes: max,
            },
            ArenaError::MapFailed { .. } => CoreError::Internal(err.to_string()),
        }
    }
}
