//! Fixed-capacity transaction table.
//!
//! One slot per concurrently running transaction, each behind its own mutex,
//! holding the transaction's prevLSN (head of its undo chain) and recLSN
//! (first LSN it still needs for undo, which pins log truncation).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::id::TransactionId;
use super::state::TransactionState;
use crate::error::{EngineError, Result};
use crate::storage::wal::LSN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEntry {
    pub xid: TransactionId,
    /// LSN of the transaction's most recent log entry.
    pub prev_lsn: LSN,
    /// LSN of the transaction's first update, if it has logged one.
    pub rec_lsn: Option<LSN>,
    pub state: TransactionState,
}

impl TransactionEntry {
    fn new(xid: TransactionId, state: TransactionState) -> Self {
        Self {
            xid,
            prev_lsn: LSN::INVALID,
            rec_lsn: None,
            state,
        }
    }
}

struct TableIndex {
    by_xid: HashMap<TransactionId, usize>,
    free: Vec<usize>,
}

pub struct TransactionTable {
    slots: Vec<Mutex<Option<TransactionEntry>>>,
    index: Mutex<TableIndex>,
    next_xid: AtomicU64,
}

impl TransactionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            index: Mutex::new(TableIndex {
                by_xid: HashMap::with_capacity(capacity),
                free: (0..capacity).rev().collect(),
            }),
            next_xid: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Allocate a slot for a new transaction.
    ///
    /// Fails with `TransactionTableFull` when every slot is taken; the caller
    /// may retry once another transaction finishes.
    pub fn begin(&self) -> Result<TransactionId> {
        let xid = TransactionId(self.next_xid.fetch_add(1, Ordering::SeqCst));
        self.insert(TransactionEntry::new(xid, TransactionState::Active))?;
        Ok(xid)
    }

    /// Re-create an entry found in the log during recovery.
    pub fn restore(&self, entry: TransactionEntry) -> Result<()> {
        self.bump_next_xid(entry.xid);
        self.insert(entry)
    }

    /// Make sure ids handed out later are greater than `xid`.
    pub fn bump_next_xid(&self, xid: TransactionId) {
        self.next_xid.fetch_max(xid.0 + 1, Ordering::SeqCst);
    }

    fn insert(&self, entry: TransactionEntry) -> Result<()> {
        let mut index = self.index.lock();
        if index.by_xid.contains_key(&entry.xid) {
            return Err(EngineError::InvalidTransactionState(
                entry.xid,
                entry.state,
            ));
        }
        let slot = index
            .free
            .pop()
            .ok_or(EngineError::TransactionTableFull(self.slots.len()))?;
        index.by_xid.insert(entry.xid, slot);
        *self.slots[slot].lock() = Some(entry);
        Ok(())
    }

    fn slot_of(&self, xid: TransactionId) -> Result<usize> {
        self.index
            .lock()
            .by_xid
            .get(&xid)
            .copied()
            .ok_or(EngineError::TransactionNotFound(xid))
    }

    /// Run `f` on the entry for `xid` under its slot mutex.
    pub fn with_entry<R>(
        &self,
        xid: TransactionId,
        f: impl FnOnce(&mut TransactionEntry) -> R,
    ) -> Result<R> {
        let slot = self.slot_of(xid)?;
        let mut guard = self.slots[slot].lock();
        match guard.as_mut() {
            Some(entry) if entry.xid == xid => Ok(f(entry)),
            _ => Err(EngineError::TransactionNotFound(xid)),
        }
    }

    pub fn get(&self, xid: TransactionId) -> Result<TransactionEntry> {
        self.with_entry(xid, |entry| entry.clone())
    }

    pub fn prev_lsn(&self, xid: TransactionId) -> Result<LSN> {
        self.with_entry(xid, |entry| entry.prev_lsn)
    }

    pub fn state(&self, xid: TransactionId) -> Result<TransactionState> {
        self.with_entry(xid, |entry| entry.state)
    }

    pub fn set_state(&self, xid: TransactionId, state: TransactionState) -> Result<()> {
        self.with_entry(xid, |entry| entry.state = state)
    }

    /// Release the slot of a finished transaction.
    pub fn end(&self, xid: TransactionId) -> Result<()> {
        let mut index = self.index.lock();
        let slot = index
            .by_xid
            .remove(&xid)
            .ok_or(EngineError::TransactionNotFound(xid))?;
        *self.slots[slot].lock() = None;
        index.free.push(slot);
        Ok(())
    }

    pub fn contains(&self, xid: TransactionId) -> bool {
        self.index.lock().by_xid.contains_key(&xid)
    }

    /// True if `xid` has a slot and can still log updates.
    pub fn is_active(&self, xid: TransactionId) -> bool {
        self.state(xid).map(|s| s.is_active()).unwrap_or(false)
    }

    /// Number of occupied slots.
    pub fn active_count(&self) -> usize {
        self.index.lock().by_xid.len()
    }

    /// Ids of every transaction holding a slot, in ascending order.
    pub fn list_active(&self) -> Vec<TransactionId> {
        let mut xids: Vec<_> = self.index.lock().by_xid.keys().copied().collect();
        xids.sort();
        xids
    }

    /// Oldest LSN any running transaction may still need for undo.
    pub fn min_rec_lsn(&self) -> Option<LSN> {
        self.slots
            .iter()
            .filter_map(|slot| slot.lock().as_ref().and_then(|entry| entry.rec_lsn))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_begin_and_end() {
        let table = TransactionTable::new(4);

        let x1 = table.begin().unwrap();
        let x2 = table.begin().unwrap();
        assert_ne!(x1, x2);
        assert_eq!(table.active_count(), 2);
        assert_eq!(table.list_active(), vec![x1, x2]);

        let entry = table.get(x1).unwrap();
        assert_eq!(entry.prev_lsn, LSN::INVALID);
        assert_eq!(entry.rec_lsn, None);
        assert_eq!(entry.state, TransactionState::Active);

        table.end(x1).unwrap();
        assert!(!table.contains(x1));
        assert!(matches!(
            table.get(x1),
            Err(EngineError::TransactionNotFound(_))
        ));
        assert_eq!(table.active_count(), 1);
    }

    #[test]
    fn test_table_full() {
        let table = TransactionTable::new(2);
        let x1 = table.begin().unwrap();
        table.begin().unwrap();

        assert!(matches!(
            table.begin(),
            Err(EngineError::TransactionTableFull(2))
        ));

        // Retryable: a finished transaction frees its slot.
        table.end(x1).unwrap();
        assert!(table.begin().is_ok());
    }

    #[test]
    fn test_min_rec_lsn() {
        let table = TransactionTable::new(4);
        let x1 = table.begin().unwrap();
        let x2 = table.begin().unwrap();
        assert_eq!(table.min_rec_lsn(), None);

        table
            .with_entry(x2, |e| {
                e.rec_lsn = Some(LSN(50));
                e.prev_lsn = LSN(50);
            })
            .unwrap();
        table.with_entry(x1, |e| e.rec_lsn = Some(LSN(70))).unwrap();
        assert_eq!(table.min_rec_lsn(), Some(LSN(50)));

        table.end(x2).unwrap();
        assert_eq!(table.min_rec_lsn(), Some(LSN(70)));
    }

    #[test]
    fn test_restore_bumps_ids() {
        let table = TransactionTable::new(4);
        table
            .restore(TransactionEntry {
                xid: TransactionId(40),
                prev_lsn: LSN(9),
                rec_lsn: Some(LSN(3)),
                state: TransactionState::Prepared,
            })
            .unwrap();

        assert_eq!(table.state(TransactionId(40)).unwrap(), TransactionState::Prepared);
        assert!(!table.is_active(TransactionId(40)));
        assert!(table.begin().unwrap() > TransactionId(40));
    }

    #[test]
    fn test_concurrent_begin_end() {
        let table = Arc::new(TransactionTable::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let xid = table.begin().unwrap();
                        table.with_entry(xid, |e| e.prev_lsn = LSN(xid.0)).unwrap();
                        assert_eq!(table.prev_lsn(xid).unwrap(), LSN(xid.0));
                        table.end(xid).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.active_count(), 0);
    }
}
