//! Log manager: the transaction-aware face of the write-ahead log.
//!
//! The manager threads each transaction's entries into a backward chain via
//! the transaction table's prevLSN, records the transaction's recLSN, and
//! decides how a force is carried out (group force for commits when it is
//! configured, a plain tail force otherwise).

use std::sync::Arc;

use log::debug;

use super::backend::{ForceMode, LogBackend};
use super::group_force::{GroupForce, GroupForceConfig};
use super::record::{ClrLog, LogBody, LogEntry, UpdateLog, LSN};
use crate::error::{fatal, EngineError, Result};
use crate::operation::OperationId;
use crate::storage::page::PageId;
use crate::transaction::{TransactionId, TransactionTable};

/// Forcing the log ahead of a page write-back.
///
/// Buffer managers depend on this rather than on [`LogManager`] itself.
pub trait LogForce: Send + Sync {
    /// Return once every entry up to and including `lsn` is durable in WAL mode.
    fn force_to(&self, lsn: LSN);
}

pub struct LogManager {
    backend: Arc<dyn LogBackend>,
    transactions: Arc<TransactionTable>,
    group_force: Option<GroupForce>,
}

impl LogManager {
    pub fn new(
        backend: Arc<dyn LogBackend>,
        transactions: Arc<TransactionTable>,
        group_force: Option<GroupForceConfig>,
    ) -> Self {
        let group_force = group_force
            .map(|config| GroupForce::new(backend.clone(), transactions.clone(), config));
        Self {
            backend,
            transactions,
            group_force,
        }
    }

    pub fn backend(&self) -> &Arc<dyn LogBackend> {
        &self.backend
    }

    pub fn transactions(&self) -> &Arc<TransactionTable> {
        &self.transactions
    }

    fn append(&self, entry: &mut LogEntry) -> LSN {
        match self.backend.write_entry(entry) {
            Ok(lsn) => lsn,
            Err(e) => fatal("log append", e),
        }
    }

    /// Append `body` to the chain of `xid`.
    fn write_common(&self, xid: TransactionId, body: LogBody) -> Result<LSN> {
        self.transactions.with_entry(xid, |slot| {
            let mut entry = LogEntry::new(xid, slot.prev_lsn, body);
            let lsn = self.append(&mut entry);
            slot.prev_lsn = lsn;
            if slot.rec_lsn.is_none() {
                slot.rec_lsn = Some(lsn);
            }
            lsn
        })
    }

    pub fn log_begin(&self, xid: TransactionId) -> Result<LSN> {
        self.write_common(xid, LogBody::Begin)
    }

    pub fn log_update(
        &self,
        xid: TransactionId,
        page: PageId,
        op: OperationId,
        arg: Vec<u8>,
    ) -> Result<LSN> {
        self.write_common(xid, LogBody::Update(UpdateLog { page, op, arg }))
    }

    /// Log the compensation of `update`, which must be one of `xid`'s updates.
    pub fn log_clr(&self, xid: TransactionId, update: &LogEntry) -> Result<LSN> {
        let LogBody::Update(body) = &update.body else {
            return Err(EngineError::CorruptLog {
                lsn: update.lsn,
                reason: format!("cannot compensate a {} entry", update.body.name()),
            });
        };
        self.write_common(
            xid,
            LogBody::Clr(ClrLog {
                compensated: update.lsn,
                undo_next: update.prev_lsn,
                update: Some(body.clone()),
            }),
        )
    }

    /// A CLR with no page effect; rewinds the undo chain of `xid` to `undo_next`.
    pub fn log_dummy_clr(&self, xid: TransactionId, undo_next: LSN) -> Result<LSN> {
        self.write_common(
            xid,
            LogBody::Clr(ClrLog {
                compensated: LSN::INVALID,
                undo_next,
                update: None,
            }),
        )
    }

    /// Append the Commit entry and wait until it is durable.
    pub fn log_commit(&self, xid: TransactionId) -> Result<LSN> {
        let lsn = self.write_common(xid, LogBody::Commit)?;
        self.force(lsn, ForceMode::Commit);
        Ok(lsn)
    }

    /// Append the Prepare entry and wait until it is durable.
    pub fn log_prepare(&self, xid: TransactionId) -> Result<LSN> {
        let lsn = self.write_common(xid, LogBody::Prepare)?;
        self.force(lsn, ForceMode::Commit);
        Ok(lsn)
    }

    pub fn log_abort(&self, xid: TransactionId) -> Result<LSN> {
        self.write_common(xid, LogBody::Abort)
    }

    pub fn log_end(&self, xid: TransactionId) -> Result<LSN> {
        self.write_common(xid, LogBody::End)
    }

    /// Make `lsn` durable in `mode`. A failed force is fatal.
    pub fn force(&self, lsn: LSN, mode: ForceMode) {
        let result = match (&self.group_force, mode) {
            (Some(group), ForceMode::Commit) => group.force(lsn),
            _ if self.backend.first_unstable_lsn(mode) <= lsn => self.backend.force_tail(mode),
            _ => Ok(()),
        };
        if let Err(e) = result {
            fatal("log force", e);
        }
    }

    pub fn force_tail(&self, mode: ForceMode) {
        if let Err(e) = self.backend.force_tail(mode) {
            fatal("log force", e);
        }
    }

    pub fn read_entry(&self, lsn: LSN) -> Result<Option<LogEntry>> {
        Ok(self.backend.read_entry(lsn)?)
    }

    pub fn next_entry(&self, entry: &LogEntry) -> Result<LSN> {
        Ok(self.backend.next_entry(entry)?)
    }

    /// Iterate forward over the log starting at `lsn`.
    pub fn iter_from(&self, lsn: LSN) -> LogIter<'_> {
        LogIter {
            log: self,
            next: Some(lsn),
        }
    }

    /// Discard entries before `lsn`. Callers must clamp `lsn` to a safe point.
    pub fn truncate(&self, lsn: LSN) -> Result<()> {
        debug!("truncating log to {}", lsn);
        Ok(self.backend.truncate(lsn)?)
    }

    pub fn truncation_point(&self) -> LSN {
        self.backend.truncation_point()
    }

    pub fn first_unstable_lsn(&self, mode: ForceMode) -> LSN {
        self.backend.first_unstable_lsn(mode)
    }

    pub fn next_available_lsn(&self) -> LSN {
        self.backend.next_available_lsn()
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_durable()
    }

    pub fn close(&self) -> Result<()> {
        Ok(self.backend.close()?)
    }
}

impl LogForce for LogManager {
    fn force_to(&self, lsn: LSN) {
        self.force(lsn, ForceMode::Wal);
    }
}

/// Forward iterator over log entries.
pub struct LogIter<'a> {
    log: &'a LogManager,
    next: Option<LSN>,
}

impl Iterator for LogIter<'_> {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let lsn = self.next.take()?;
        match self.log.read_entry(lsn) {
            Ok(Some(entry)) => match self.log.next_entry(&entry) {
                Ok(next) => {
                    self.next = Some(next);
                    Some(Ok(entry))
                }
                Err(e) => Some(Err(e)),
            },
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
