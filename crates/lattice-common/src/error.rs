//! Error types for LatticeDB.

use thiserror::Error;

/// Result type alias using LatticeError.
pub type Result<T> = std::result::Result<T, LatticeError>;

/// Errors that can occur in LatticeDB index operations.
///
/// A missing key is not an error: `remove` and `search` report absence
/// through their `bool` return value.
#[derive(Debug, Error)]
pub enum LatticeError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Storage errors
    #[error("corrupt page {page_no}: {reason}")]
    CorruptPage { page_no: u32, reason: String },

    #[error("buffer pool exhausted, all frames pinned")]
    PoolExhausted,

    // Construction errors
    #[error("key size mismatch: expected {expected} bytes, got {actual}")]
    KeySizeMismatch { expected: usize, actual: usize },

    #[error("invalid tree configuration: {0}")]
    InvalidConfig(String),

    // Defensive checks
    #[error("structural invariant violated: {0}")]
    InvariantViolated(String),
}

impl LatticeError {
    /// Builds a CorruptPage error for the given page.
    pub fn corrupt(page_no: u32, reason: impl Into<String>) -> Self {
        Self::CorruptPage {
            page_no,
            reason: reason.into(),
        }
    }
}
