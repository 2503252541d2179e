//! Storage layer error types.

use thiserror::Error;

use crate::storage::page::PageId;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page buffer must be {expected} bytes, got {actual}")]
    InvalidPageBuffer { expected: usize, actual: usize },

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Corrupt log file at offset {offset}: {reason}")]
    CorruptLog { offset: u64, reason: String },

    #[error("Log entry encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Storage handle is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
