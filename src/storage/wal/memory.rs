//! Log kept entirely in memory.
//!
//! LSNs are entry indices. Nothing survives the process, so every appended
//! entry is reported as stable and forces are no-ops. Used for unit tests and
//! for measuring the engine without fsync cost.

use std::collections::VecDeque;

use parking_lot::RwLock;

use super::backend::{ForceMode, LogBackend};
use super::record::{LogEntry, LSN};
use crate::storage::error::StorageResult;

struct MemoryLogState {
    entries: VecDeque<LogEntry>,
    /// LSN of `entries[0]`; also the truncation point.
    base: LSN,
    next: LSN,
}

pub struct InMemoryLog {
    state: RwLock<MemoryLogState>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryLogState {
                entries: VecDeque::new(),
                base: LSN(1),
                next: LSN(1),
            }),
        }
    }

    /// Number of entries still held.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBackend for InMemoryLog {
    fn write_entry(&self, entry: &mut LogEntry) -> StorageResult<LSN> {
        let mut state = self.state.write();
        let lsn = state.next;
        entry.lsn = lsn;
        state.entries.push_back(entry.clone());
        state.next = lsn.next();
        Ok(lsn)
    }

    fn read_entry(&self, lsn: LSN) -> StorageResult<Option<LogEntry>> {
        let state = self.state.read();
        if lsn < state.base || lsn >= state.next {
            return Ok(None);
        }
        Ok(state.entries.get((lsn.0 - state.base.0) as usize).cloned())
    }

    fn next_entry(&self, entry: &LogEntry) -> StorageResult<LSN> {
        Ok(entry.lsn.next())
    }

    fn next_available_lsn(&self) -> LSN {
        self.state.read().next
    }

    fn first_unstable_lsn(&self, _mode: ForceMode) -> LSN {
        self.state.read().next
    }

    fn force_tail(&self, _mode: ForceMode) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&self, lsn: LSN) -> StorageResult<()> {
        let mut state = self.state.write();
        let target = lsn.min(state.next);
        while state.base < target {
            state.entries.pop_front();
            state.base = state.base.next();
        }
        Ok(())
    }

    fn truncation_point(&self) -> LSN {
        self.state.read().base
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::record::LogBody;
    use crate::transaction::TransactionId;

    fn append(log: &InMemoryLog, body: LogBody) -> LSN {
        let mut entry = LogEntry::new(TransactionId(1), LSN::INVALID, body);
        log.write_entry(&mut entry).unwrap()
    }

    #[test]
    fn test_append_and_read() {
        let log = InMemoryLog::new();
        assert!(!log.is_durable());

        let first = append(&log, LogBody::Begin);
        let second = append(&log, LogBody::Commit);
        assert!(second > first);
        assert_eq!(log.next_available_lsn(), second.next());
        assert_eq!(log.first_unstable_lsn(ForceMode::Commit), second.next());

        let entry = log.read_entry(first).unwrap().unwrap();
        assert_eq!(entry.lsn, first);
        assert_eq!(entry.body, LogBody::Begin);
        assert_eq!(log.next_entry(&entry).unwrap(), second);

        // At the tail: not found rather than an error.
        assert!(log.read_entry(second.next()).unwrap().is_none());
    }

    #[test]
    fn test_truncate() {
        let log = InMemoryLog::new();
        let lsns: Vec<_> = (0..5).map(|_| append(&log, LogBody::Begin)).collect();

        log.truncate(lsns[3]).unwrap();
        assert_eq!(log.truncation_point(), lsns[3]);
        assert_eq!(log.len(), 2);
        assert!(log.read_entry(lsns[2]).unwrap().is_none());
        assert_eq!(log.read_entry(lsns[3]).unwrap().unwrap().lsn, lsns[3]);

        // Truncating backwards is a no-op; past the tail clamps to the tail.
        log.truncate(lsns[0]).unwrap();
        assert_eq!(log.truncation_point(), lsns[3]);
        log.truncate(LSN(1000)).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.truncation_point(), log.next_available_lsn());
    }
}
