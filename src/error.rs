//! Engine-level error type.
//!
//! Every fallible engine call returns [`Result`]. Conditions the engine cannot
//! recover from (log append failures, page write-back failures, I/O errors in
//! the middle of an undo) do not surface here; they go through [`fatal`].

use std::fmt::Display;

use thiserror::Error;

use crate::operation::{OperationId, RecordId};
use crate::storage::error::StorageError;
use crate::storage::page::{PageId, PageType};
use crate::storage::wal::LSN;
use crate::transaction::{TransactionId, TransactionState};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transaction table is full ({0} active transactions)")]
    TransactionTableFull(usize),

    #[error("Buffer pool exhausted: all {0} pages are pinned")]
    BufferPoolExhausted(usize),

    #[error("Transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error("Transaction {0} is in invalid state: {1}")]
    InvalidTransactionState(TransactionId, TransactionState),

    #[error("Unknown operation id {0}")]
    UnknownOperation(OperationId),

    #[error("Operation id {0} is already registered")]
    DuplicateOperation(OperationId),

    #[error("Page {page} has type {actual:?}, expected {expected:?}")]
    PageTypeMismatch {
        page: PageId,
        expected: PageType,
        actual: PageType,
    },

    #[error("Invalid record {rid}: {reason}")]
    InvalidRecord { rid: RecordId, reason: String },

    #[error("Invalid operation argument: {0}")]
    InvalidArgument(String),

    #[error("Corrupt log entry at {lsn}: {reason}")]
    CorruptLog { lsn: LSN, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Engine is closed")]
    Closed,
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(StorageError::Io(err))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Escalate an unrecoverable failure.
///
/// The engine cannot make progress once the log or a page write-back has
/// failed. The diagnostic is logged and the process aborts; other threads
/// must not keep running against latches and pages left half-updated.
#[cold]
pub fn fatal(context: &str, err: impl Display) -> ! {
    log::error!("fatal: {}: {}", context, err);
    eprintln!("fatal: {}: {}", context, err);
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::testing::{expect_abort, in_abort_child};
    use anyhow::Result;

    #[test]
    fn test_fatal_aborts_the_process() -> Result<()> {
        if in_abort_child() {
            fatal("write back of Page(0)", "disk gone");
        }
        expect_abort(
            "error::tests::test_fatal_aborts_the_process",
            "fatal: write back of Page(0): disk gone",
        )
    }
}
