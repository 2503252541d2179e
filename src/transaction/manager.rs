//! Transaction manager: begin, update, commit, abort.
//!
//! Updates follow one protocol. The page is write-latched, the operation is
//! applied, the update entry is appended (chained on the transaction's
//! prevLSN), and the page is stamped with the new LSN before the latch drops.
//! Abort walks the chain backwards, undoing each update and logging a CLR for
//! it, so a crash in the middle of an abort never undoes anything twice.

use std::sync::Arc;

use log::{debug, warn};

use super::id::TransactionId;
use super::state::TransactionState;
use super::table::TransactionTable;
use crate::error::{fatal, EngineError, Result};
use crate::operation::{OperationId, OperationRegistry};
use crate::storage::allocation::AllocationPolicy;
use crate::storage::buffer::{BufferManager, PageReadGuard, PageWriteGuard};
use crate::storage::page::{PageId, PageType};
use crate::storage::wal::{LogBody, LogEntry, LogManager, UpdateLog, LSN};

pub struct TransactionManager {
    table: Arc<TransactionTable>,
    log: Arc<LogManager>,
    buffers: Arc<dyn BufferManager>,
    registry: Arc<OperationRegistry>,
    allocation: Arc<AllocationPolicy>,
}

impl TransactionManager {
    pub fn new(
        table: Arc<TransactionTable>,
        log: Arc<LogManager>,
        buffers: Arc<dyn BufferManager>,
        registry: Arc<OperationRegistry>,
        allocation: Arc<AllocationPolicy>,
    ) -> Self {
        Self {
            table,
            log,
            buffers,
            registry,
            allocation,
        }
    }

    pub fn table(&self) -> &Arc<TransactionTable> {
        &self.table
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn buffers(&self) -> &Arc<dyn BufferManager> {
        &self.buffers
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn allocation(&self) -> &Arc<AllocationPolicy> {
        &self.allocation
    }

    /// Start a transaction. Fails with `TransactionTableFull` when every slot is taken.
    pub fn begin(&self) -> Result<TransactionId> {
        let xid = self.table.begin()?;
        self.log.log_begin(xid)?;
        debug!("{} began", xid);
        Ok(xid)
    }

    fn expect_state(
        &self,
        xid: TransactionId,
        allowed: impl Fn(TransactionState) -> bool,
    ) -> Result<TransactionState> {
        let state = self.table.state(xid)?;
        if allowed(state) {
            Ok(state)
        } else {
            Err(EngineError::InvalidTransactionState(xid, state))
        }
    }

    /// Apply `op` with `arg` to `page` on behalf of `xid`.
    pub fn update(
        &self,
        xid: TransactionId,
        page: PageId,
        op: OperationId,
        arg: Vec<u8>,
    ) -> Result<LSN> {
        self.expect_state(xid, |s| s.is_active())?;
        let page_ref = self.buffers.load_page(xid, page, PageType::Uninitialized)?;
        let mut guard = page_ref.write();
        self.apply(xid, &mut guard, op, arg)
    }

    /// Like [`update`](Self::update), with the argument computed from the page
    /// under its write latch. `build` returning `None` logs nothing.
    pub fn update_with<F>(
        &self,
        xid: TransactionId,
        page: PageId,
        op: OperationId,
        build: F,
    ) -> Result<Option<LSN>>
    where
        F: FnOnce(&PageWriteGuard<'_>) -> Result<Option<Vec<u8>>>,
    {
        self.expect_state(xid, |s| s.is_active())?;
        let page_ref = self.buffers.load_page(xid, page, PageType::Uninitialized)?;
        let mut guard = page_ref.write();
        let Some(arg) = build(&guard)? else {
            return Ok(None);
        };
        self.apply(xid, &mut guard, op, arg).map(Some)
    }

    fn apply(
        &self,
        xid: TransactionId,
        guard: &mut PageWriteGuard<'_>,
        op: OperationId,
        arg: Vec<u8>,
    ) -> Result<LSN> {
        self.registry.redo(op, guard, &arg)?;
        let lsn = self.log.log_update(xid, guard.page_id(), op, arg)?;
        guard.stamp_lsn(lsn);
        Ok(lsn)
    }

    /// Run `f` over `page` under its read latch.
    pub fn read<R>(
        &self,
        xid: TransactionId,
        page: PageId,
        f: impl FnOnce(&PageReadGuard<'_>) -> R,
    ) -> Result<R> {
        let page_ref = self.buffers.load_page(xid, page, PageType::Uninitialized)?;
        let guard = page_ref.read();
        Ok(f(&guard))
    }

    /// Make `xid` durable, then release its slot.
    pub fn commit(&self, xid: TransactionId) -> Result<()> {
        self.expect_state(xid, |s| s.can_finish())?;
        self.log.log_commit(xid)?;
        self.table.set_state(xid, TransactionState::Committed)?;
        self.finish(xid)?;
        debug!("{} committed", xid);
        Ok(())
    }

    /// Force a Prepare entry. A prepared transaction survives crashes until
    /// the caller commits or aborts it.
    pub fn prepare(&self, xid: TransactionId) -> Result<()> {
        self.expect_state(xid, |s| s.is_active())?;
        self.log.log_prepare(xid)?;
        self.table.set_state(xid, TransactionState::Prepared)?;
        debug!("{} prepared", xid);
        Ok(())
    }

    /// Roll `xid` back and release its slot.
    ///
    /// Once the Abort entry is written the rollback cannot fail halfway:
    /// any error while undoing is fatal.
    pub fn abort(&self, xid: TransactionId) -> Result<()> {
        self.expect_state(xid, |s| s.can_finish() || s == TransactionState::Aborting)?;
        self.table.set_state(xid, TransactionState::Aborting)?;
        self.log.log_abort(xid)?;
        if let Err(e) = self.rollback(xid) {
            fatal(&format!("rollback of {}", xid), e);
        }
        self.table.set_state(xid, TransactionState::Aborted)?;
        self.finish(xid)?;
        debug!("{} aborted", xid);
        Ok(())
    }

    fn finish(&self, xid: TransactionId) -> Result<()> {
        self.log.log_end(xid)?;
        self.table.end(xid)?;
        self.allocation.transaction_completed(xid);
        Ok(())
    }

    /// Undo every update of `xid` not yet compensated.
    fn rollback(&self, xid: TransactionId) -> Result<()> {
        let mut lsn = self.table.prev_lsn(xid)?;
        while lsn.is_valid() {
            let entry = self.log.read_entry(lsn)?.ok_or_else(|| EngineError::CorruptLog {
                lsn,
                reason: format!("undo chain of {} is broken", xid),
            })?;
            lsn = match &entry.body {
                LogBody::Update(update) => {
                    self.undo_update(xid, &entry, update)?;
                    entry.prev_lsn
                }
                LogBody::Clr(clr) => clr.undo_next,
                _ => entry.prev_lsn,
            };
        }
        Ok(())
    }

    /// Reverse one update entry and log its CLR.
    pub(crate) fn undo_update(
        &self,
        xid: TransactionId,
        entry: &LogEntry,
        update: &UpdateLog,
    ) -> Result<LSN> {
        let page_ref = self
            .buffers
            .load_page(xid, update.page, PageType::Uninitialized)?;
        let mut guard = page_ref.write();
        self.registry.undo(update.op, &mut guard, &update.arg)?;
        let clr = self.log.log_clr(xid, entry)?;
        guard.stamp_lsn(clr);
        Ok(clr)
    }

    pub fn is_active(&self, xid: TransactionId) -> bool {
        self.table.is_active(xid)
    }

    pub fn active_count(&self) -> usize {
        self.table.active_count()
    }

    /// Transactions left in the prepared state.
    pub fn prepared(&self) -> Vec<TransactionId> {
        self.table
            .list_active()
            .into_iter()
            .filter(|&xid| matches!(self.table.state(xid), Ok(TransactionState::Prepared)))
            .collect()
    }
}

/// A handle to a transaction that automatically aborts on drop if still active.
pub struct Transaction {
    xid: TransactionId,
    manager: Arc<TransactionManager>,
    finished: bool,
}

impl Transaction {
    pub fn begin(manager: Arc<TransactionManager>) -> Result<Self> {
        let xid = manager.begin()?;
        Ok(Self {
            xid,
            manager,
            finished: false,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.xid
    }

    pub fn update(&self, page: PageId, op: OperationId, arg: Vec<u8>) -> Result<LSN> {
        self.manager.update(self.xid, page, op, arg)
    }

    pub fn read<R>(&self, page: PageId, f: impl FnOnce(&PageReadGuard<'_>) -> R) -> Result<R> {
        self.manager.read(self.xid, page, f)
    }

    pub fn prepare(&self) -> Result<()> {
        self.manager.prepare(self.xid)
    }

    /// Commit. On failure the handle is dropped unfinished, which aborts the
    /// transaction if it is still active.
    pub fn commit(mut self) -> Result<()> {
        self.manager.commit(self.xid)?;
        self.finished = true;
        Ok(())
    }

    pub fn abort(mut self) -> Result<()> {
        self.manager.abort(self.xid)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let unfinished = matches!(
            self.manager.table().state(self.xid),
            Ok(TransactionState::Active | TransactionState::Aborting)
        );
        if unfinished {
            if let Err(e) = self.manager.abort(self.xid) {
                warn!("abort of dropped {} failed: {}", self.xid, e);
            }
        }
    }
}
