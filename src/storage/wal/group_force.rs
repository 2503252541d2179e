//! Group force: batch concurrent commit forces into one fsync.
//!
//! A committing thread registers as pending and, while fewer transactions
//! are waiting than are active, sleeps on a condition variable for at most
//! the configured wait. Whoever forces first wakes everyone; a waiter whose
//! LSN became durable meanwhile returns without forcing. A waiter that times
//! out forces on its own, so a quiet system never blocks longer than `wait`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::{Condvar, Mutex};

use super::backend::{ForceMode, LogBackend};
use super::record::LSN;
use crate::storage::error::StorageResult;
use crate::transaction::TransactionTable;

/// Tuning for [`GroupForce`]. The thresholds are heuristics, not correctness
/// requirements; any values still give durable commits.
#[derive(Debug, Clone)]
pub struct GroupForceConfig {
    /// Longest a committer waits for company before forcing alone.
    pub wait: Duration,
    /// Wait only while more than this many transactions are active.
    pub min_active: usize,
    /// Above this many active transactions, wait until `quorum` of them are pending.
    pub large_active: usize,
    pub quorum: f64,
}

impl Default for GroupForceConfig {
    fn default() -> Self {
        GroupForceConfig {
            wait: Duration::from_millis(10),
            min_active: 1,
            large_active: 20,
            quorum: 0.95,
        }
    }
}

pub struct GroupForce {
    log: Arc<dyn LogBackend>,
    transactions: Arc<TransactionTable>,
    config: GroupForceConfig,
    pending: Mutex<usize>,
    too_few: Condvar,
}

impl GroupForce {
    pub fn new(
        log: Arc<dyn LogBackend>,
        transactions: Arc<TransactionTable>,
        config: GroupForceConfig,
    ) -> Self {
        Self {
            log,
            transactions,
            config,
            pending: Mutex::new(0),
            too_few: Condvar::new(),
        }
    }

    fn is_stable(&self, lsn: LSN) -> bool {
        self.log.first_unstable_lsn(ForceMode::Commit) > lsn
    }

    fn should_wait(&self, pending: usize, active: usize) -> bool {
        (active > self.config.min_active && pending < active)
            || (active > self.config.large_active
                && (pending as f64) < active as f64 * self.config.quorum)
    }

    /// Return once `lsn` is durable in commit mode.
    pub fn force(&self, lsn: LSN) -> StorageResult<()> {
        let mut pending = self.pending.lock();
        if self.is_stable(lsn) {
            return Ok(());
        }

        *pending += 1;
        if self.log.is_durable() {
            let deadline = Instant::now() + self.config.wait;
            let active = self.transactions.active_count();

            if self.should_wait(*pending, active) {
                trace!("group force: {} pending of {} active", *pending, active);
                while !self.too_few.wait_until(&mut pending, deadline).timed_out() {
                    if self.is_stable(lsn) {
                        *pending -= 1;
                        return Ok(());
                    }
                }
            }
        }

        // Another thread may have forced while we slept.
        let result = if self.is_stable(lsn) {
            Ok(())
        } else {
            let result = self.log.force_tail(ForceMode::Commit);
            trace!("group force: forced {} for {} waiters", lsn, *pending);
            self.too_few.notify_all();
            result
        };
        *pending -= 1;
        result
    }

    pub fn pending(&self) -> usize {
        *self.pending.lock()
    }
}
