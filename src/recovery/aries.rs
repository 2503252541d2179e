//! ARIES (Algorithm for Recovery and Isolation Exploiting Semantics) implementation.
//!
//! Implements the three phases of ARIES over the log that survives from the
//! truncation point:
//! 1. Analysis: rebuild the outcome of every transaction seen in the log
//! 2. Redo: repeat history, guarded by the page LSN
//! 3. Undo: roll back losers in reverse LSN order, logging a CLR per update
//!
//! Recovery is idempotent. A crash in the middle of it leaves CLRs whose
//! `undo_next` lets the next run skip the work already done.

use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use log::{debug, info};

use crate::error::{EngineError, Result};
use crate::storage::page::{PageId, PageType};
use crate::storage::wal::{ForceMode, LogBody, LogEntry, LSN};
use crate::transaction::{TransactionEntry, TransactionId, TransactionManager, TransactionState};

/// What the log says about a transaction at the end of analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Running,
    Aborting,
    Prepared,
    Committed,
    Ended,
}

#[derive(Debug)]
struct Analyzed {
    first_lsn: LSN,
    last_lsn: LSN,
    outcome: Outcome,
    saw_abort: bool,
}

/// Recovery statistics.
#[derive(Debug, Default)]
pub struct RecoveryStats {
    /// Number of records analyzed.
    pub records_analyzed: usize,
    /// Number of records whose effect was reapplied to a page.
    pub records_redone: usize,
    /// Number of updates rolled back.
    pub records_undone: usize,
    /// Number of CLRs written.
    pub clrs_written: usize,
    /// Transactions rolled back.
    pub losers: Vec<TransactionId>,
    /// Transactions left in the prepared state.
    pub prepared: Vec<TransactionId>,
    /// Highest page id touched by a surviving log entry.
    pub max_page: Option<PageId>,
    /// Recovery start LSN.
    pub recovery_start_lsn: LSN,
    /// Recovery end LSN.
    pub recovery_end_lsn: LSN,
}

/// ARIES recovery manager.
pub struct AriesRecovery {
    manager: Arc<TransactionManager>,
}

impl AriesRecovery {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        AriesRecovery { manager }
    }

    /// Perform full ARIES recovery.
    pub fn recover(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats {
            recovery_start_lsn: self.manager.log().truncation_point(),
            ..RecoveryStats::default()
        };

        let transactions = self.analysis_phase(&mut stats)?;
        self.redo_phase(&mut stats)?;
        self.undo_phase(&transactions, &mut stats)?;
        self.finish(&transactions, &mut stats)?;

        self.manager.log().force_tail(ForceMode::Commit);
        stats.recovery_end_lsn = self.manager.log().next_available_lsn();
        info!(
            "recovery done: {} analyzed, {} redone, {} undone, {} losers, {} prepared",
            stats.records_analyzed,
            stats.records_redone,
            stats.records_undone,
            stats.losers.len(),
            stats.prepared.len()
        );
        Ok(stats)
    }

    fn entries(&self) -> impl Iterator<Item = Result<LogEntry>> + '_ {
        let log = self.manager.log();
        log.iter_from(log.truncation_point())
    }

    /// Phase 1: Analysis - Reconstruct state at crash time.
    fn analysis_phase(
        &self,
        stats: &mut RecoveryStats,
    ) -> Result<BTreeMap<TransactionId, Analyzed>> {
        let mut transactions: BTreeMap<TransactionId, Analyzed> = BTreeMap::new();

        for entry in self.entries() {
            let entry = entry?;
            stats.records_analyzed += 1;
            self.manager.table().bump_next_xid(entry.xid);
            if let Some(page) = entry.page() {
                stats.max_page = stats.max_page.max(Some(page));
            }

            let txn = transactions.entry(entry.xid).or_insert(Analyzed {
                first_lsn: entry.lsn,
                last_lsn: entry.lsn,
                outcome: Outcome::Running,
                saw_abort: false,
            });
            txn.last_lsn = entry.lsn;
            match entry.body {
                LogBody::Commit => txn.outcome = Outcome::Committed,
                LogBody::Prepare => txn.outcome = Outcome::Prepared,
                LogBody::Abort => {
                    txn.outcome = Outcome::Aborting;
                    txn.saw_abort = true;
                }
                LogBody::End => txn.outcome = Outcome::Ended,
                LogBody::Begin | LogBody::Update(_) | LogBody::Clr(_) => {}
            }
        }

        debug!(
            "analysis: {} entries, {} transactions",
            stats.records_analyzed,
            transactions.len()
        );
        Ok(transactions)
    }

    /// Phase 2: Redo - Repeat all operations from log.
    ///
    /// Updates and CLRs of every transaction are reapplied, losers included;
    /// a page whose LSN already covers an entry is left alone.
    fn redo_phase(&self, stats: &mut RecoveryStats) -> Result<()> {
        let buffers = self.manager.buffers();
        let registry = self.manager.registry();

        for entry in self.entries() {
            let entry = entry?;
            let (update, compensation) = match &entry.body {
                LogBody::Update(update) => (update, false),
                LogBody::Clr(clr) => match &clr.update {
                    Some(update) => (update, true),
                    None => continue,
                },
                _ => continue,
            };

            let page =
                buffers.load_page(TransactionId::NONE, update.page, PageType::Uninitialized)?;
            let mut guard = page.write();
            if guard.lsn() >= entry.lsn {
                continue;
            }
            if compensation {
                registry.undo(update.op, &mut guard, &update.arg)?;
            } else {
                registry.redo(update.op, &mut guard, &update.arg)?;
            }
            guard.stamp_lsn(entry.lsn);
            stats.records_redone += 1;
        }

        debug!("redo: {} entries reapplied", stats.records_redone);
        Ok(())
    }

    /// Phase 3: Undo - Undo incomplete transactions.
    ///
    /// Losers are re-entered into the transaction table so their CLRs chain
    /// onto the surviving log. The undo walks all losers at once, always
    /// taking the highest outstanding LSN.
    fn undo_phase(
        &self,
        transactions: &BTreeMap<TransactionId, Analyzed>,
        stats: &mut RecoveryStats,
    ) -> Result<()> {
        let table = self.manager.table();
        let log = self.manager.log();
        let mut pending: BinaryHeap<(LSN, TransactionId)> = BinaryHeap::new();

        for (&xid, txn) in transactions {
            if !matches!(txn.outcome, Outcome::Running | Outcome::Aborting) {
                continue;
            }
            table.restore(TransactionEntry {
                xid,
                prev_lsn: txn.last_lsn,
                rec_lsn: Some(txn.first_lsn),
                state: TransactionState::Aborting,
            })?;
            if !txn.saw_abort {
                log.log_abort(xid)?;
            }
            stats.losers.push(xid);
            pending.push((txn.last_lsn, xid));
        }

        while let Some((lsn, xid)) = pending.pop() {
            let entry = log.read_entry(lsn)?.ok_or_else(|| EngineError::CorruptLog {
                lsn,
                reason: format!("undo chain of {} is broken", xid),
            })?;
            let next = match &entry.body {
                LogBody::Update(update) => {
                    self.manager.undo_update(xid, &entry, update)?;
                    stats.records_undone += 1;
                    stats.clrs_written += 1;
                    entry.prev_lsn
                }
                LogBody::Clr(clr) => clr.undo_next,
                _ => entry.prev_lsn,
            };
            if next.is_valid() {
                pending.push((next, xid));
            }
        }

        debug!(
            "undo: {} updates rolled back for {} losers",
            stats.records_undone,
            stats.losers.len()
        );
        Ok(())
    }

    /// Close out every transaction whose outcome is decided, and bring the
    /// prepared ones back into the table.
    fn finish(
        &self,
        transactions: &BTreeMap<TransactionId, Analyzed>,
        stats: &mut RecoveryStats,
    ) -> Result<()> {
        let table = self.manager.table();
        let log = self.manager.log();

        for &xid in &stats.losers {
            table.set_state(xid, TransactionState::Aborted)?;
            log.log_end(xid)?;
            table.end(xid)?;
        }

        for (&xid, txn) in transactions {
            match txn.outcome {
                Outcome::Committed => {
                    table.restore(TransactionEntry {
                        xid,
                        prev_lsn: txn.last_lsn,
                        rec_lsn: Some(txn.first_lsn),
                        state: TransactionState::Committed,
                    })?;
                    log.log_end(xid)?;
                    table.end(xid)?;
                }
                Outcome::Prepared => {
                    table.restore(TransactionEntry {
                        xid,
                        prev_lsn: txn.last_lsn,
                        rec_lsn: Some(txn.first_lsn),
                        state: TransactionState::Prepared,
                    })?;
                    stats.prepared.push(xid);
                }
                Outcome::Running | Outcome::Aborting | Outcome::Ended => {}
            }
        }
        Ok(())
    }
}
