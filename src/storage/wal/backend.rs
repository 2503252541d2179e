//! The log backend abstraction.

use super::record::{LogEntry, LSN};
use crate::storage::error::StorageResult;

/// Durability level a force has to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForceMode {
    /// Commit durability: the transaction's Commit entry must survive a crash.
    Commit,
    /// WAL durability: enough of the log to justify writing a page back.
    Wal,
}

/// An append-only sequence of log entries keyed by LSN.
pub trait LogBackend: Send + Sync {
    /// Assign the next LSN to `entry`, append it and return the LSN.
    /// The entry may stay buffered in memory until the next force.
    fn write_entry(&self, entry: &mut LogEntry) -> StorageResult<LSN>;

    /// Entry at `lsn`. Reading at or past the tail, or before the
    /// truncation point, yields `None`.
    fn read_entry(&self, lsn: LSN) -> StorageResult<Option<LogEntry>>;

    /// LSN of the entry that follows `entry`.
    fn next_entry(&self, entry: &LogEntry) -> StorageResult<LSN>;

    /// LSN the next appended entry will receive.
    fn next_available_lsn(&self) -> LSN;

    /// Lowest LSN that is not yet guaranteed durable in `mode`.
    fn first_unstable_lsn(&self, mode: ForceMode) -> LSN;

    /// Block until everything appended so far is durable in `mode`.
    fn force_tail(&self, mode: ForceMode) -> StorageResult<()>;

    /// Discard every entry strictly before `lsn`.
    fn truncate(&self, lsn: LSN) -> StorageResult<()>;

    fn truncation_point(&self) -> LSN;

    /// False for logs that do not survive the process.
    fn is_durable(&self) -> bool;

    fn close(&self) -> StorageResult<()>;
}
