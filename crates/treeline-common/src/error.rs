//! Error types for Treeline.

use thiserror::Error;

/// Result type alias using TreelineError.
pub type Result<T> = std::result::Result<T, TreelineError>;

/// Errors that can occur in Treeline operations.
#[derive(Debug, Error)]
pub enum TreelineError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read past end of file: page {page_no}")]
    ReadPastEnd { page_no: u32 },

    // Transaction errors
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    // Buffer pool errors
    #[error("buffer pool full, no clean page to evict")]
    BufferPoolFull,

    // Structural errors
    #[error("page full, unable to insert")]
    PageFull,

    #[error("tuple not found: {0}")]
    TupleNotFound(String),

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("invalid parent: {0}")]
    InvalidParent(String),

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("page corrupted: {page_no}, reason: {reason}")]
    PageCorrupted { page_no: u32, reason: String },

    #[error("no file registered for table {0}")]
    NoSuchTable(u32),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl TreelineError {
    /// Returns true if this error signals a transaction abort.
    ///
    /// Callers seeing an abort are expected to complete the transaction
    /// with `commit = false` and may retry from the top.
    pub fn is_abort(&self) -> bool {
        matches!(self, TreelineError::TransactionAborted(_))
    }
}
