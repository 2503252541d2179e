//! The engine handle.
//!
//! [`EngineHandle`] owns every shared component (log, transaction table,
//! dirty page table, buffer manager, allocation policy) and wires them
//! together at [`init`](EngineHandle::init). There is no global state: two
//! handles over different directories are fully independent.

pub mod config;

pub use config::{EngineConfig, LogKind};

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::error::{EngineError, Result};
use crate::operation::slotted::{self, SlottedPage, MAX_RECORD_SIZE};
use crate::operation::{OperationId, OperationRegistry, RecordId};
use crate::recovery::{AriesRecovery, RecoveryStats, TruncationWorker, Truncator};
use crate::storage::allocation::AllocationPolicy;
use crate::storage::buffer::{new_buffer_manager, BufferManager, PageReadGuard};
use crate::storage::dirty_page_table::DirtyPageTable;
use crate::storage::disk::{FilePageHandle, MemoryPageHandle, PageHandle};
use crate::storage::page::{PageId, PageType};
use crate::storage::wal::{FileLog, ForceMode, InMemoryLog, LogBackend, LogManager, LSN};
use crate::transaction::{TransactionId, TransactionManager, TransactionTable};

pub struct EngineHandle {
    config: EngineConfig,
    pages: Arc<dyn PageHandle>,
    log: Arc<LogManager>,
    buffers: Arc<dyn BufferManager>,
    allocation: Arc<AllocationPolicy>,
    transactions: Arc<TransactionManager>,
    truncator: Arc<Truncator>,
    worker: Option<TruncationWorker>,
    next_page: AtomicU64,
    recovery: RecoveryStats,
}

impl EngineHandle {
    /// Open (or create) the page store and log `config` describes, then recover.
    pub fn init(config: EngineConfig) -> Result<Self> {
        if let Some(dir) = &config.data_dir {
            fs::create_dir_all(dir)?;
        }

        let log: Arc<dyn LogBackend> = match (config.log, config.log_path()) {
            (LogKind::InMemory, _) => Arc::new(InMemoryLog::new()),
            (LogKind::File, Some(path)) => Arc::new(FileLog::open(&path)?),
            (LogKind::File, None) => {
                return Err(EngineError::InvalidArgument(
                    "a file log needs a data directory".to_string(),
                ))
            }
        };
        let pages: Arc<dyn PageHandle> = match config.page_path() {
            Some(path) => Arc::new(FilePageHandle::open(&path)?),
            None => Arc::new(MemoryPageHandle::new()),
        };

        Self::init_with(config, log, pages)
    }

    /// Build an engine over existing backends. Handing the same backends to a
    /// second engine after [`simulate_crash`](Self::simulate_crash) recovers
    /// from exactly what survived.
    pub fn init_with(
        config: EngineConfig,
        log: Arc<dyn LogBackend>,
        pages: Arc<dyn PageHandle>,
    ) -> Result<Self> {
        let table = Arc::new(TransactionTable::new(config.max_transactions));
        let log = Arc::new(LogManager::new(log, table.clone(), config.group_force.clone()));
        let buffers = new_buffer_manager(
            &config.buffer,
            pages.clone(),
            log.clone(),
            Arc::new(DirtyPageTable::new()),
        );
        let allocation = Arc::new(AllocationPolicy::new());
        let transactions = Arc::new(TransactionManager::new(
            table.clone(),
            log.clone(),
            buffers.clone(),
            Arc::new(OperationRegistry::with_builtin()),
            allocation.clone(),
        ));

        let recovery = AriesRecovery::new(transactions.clone()).recover()?;
        let stored = pages.num_pages()?;
        let logged = recovery.max_page.map_or(0, |page| page.0 + 1);

        let truncator = Arc::new(Truncator::new(
            log.clone(),
            buffers.clone(),
            table,
            config.truncation.clone(),
        ));
        let worker = config
            .truncation
            .enabled
            .then(|| TruncationWorker::start(truncator.clone()));

        let engine = Self {
            config,
            pages,
            log,
            buffers,
            allocation,
            transactions,
            truncator,
            worker,
            next_page: AtomicU64::new(stored.max(logged)),
            recovery,
        };
        engine.load_free_space()?;

        info!(
            "engine initialized: {} pages, log at {}, {} prepared transactions",
            engine.next_page.load(Ordering::SeqCst),
            engine.log.next_available_lsn(),
            engine.recovery.prepared.len()
        );
        Ok(engine)
    }

    /// Register every formatted page with the allocation policy.
    fn load_free_space(&self) -> Result<()> {
        for id in 0..self.next_page.load(Ordering::SeqCst) {
            let free = self.transactions.read(TransactionId::NONE, PageId(id), |page| {
                (page.page_type() == PageType::Slotted)
                    .then(|| SlottedPage::new(&page[..]).free_space())
            })?;
            if let Some(free) = free {
                self.allocation.add_page(PageId(id), free);
            }
        }
        Ok(())
    }

    /// Write every dirty page back and close the log and the page store.
    ///
    /// Transactions still running are left to the next recovery, which rolls
    /// them back.
    pub fn deinit(mut self) -> Result<()> {
        self.stop_truncation();
        let running = self.transactions.active_count();
        if running > 0 {
            warn!("shutting down with {} transactions still open", running);
        }
        self.log.force_tail(ForceMode::Commit);
        self.buffers.flush_all()?;
        self.pages.force()?;
        self.buffers.close()?;
        self.log.close()?;
        self.pages.close()?;
        info!("engine shut down");
        Ok(())
    }

    /// Drop the engine without writing anything back, as a crash would.
    pub fn simulate_crash(mut self) {
        self.stop_truncation();
        self.buffers.simulate_crash();
        info!("engine crashed on purpose");
    }

    fn stop_truncation(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }

    pub fn begin(&self) -> Result<TransactionId> {
        self.transactions.begin()
    }

    pub fn commit(&self, xid: TransactionId) -> Result<()> {
        self.transactions.commit(xid)
    }

    pub fn abort(&self, xid: TransactionId) -> Result<()> {
        self.transactions.abort(xid)
    }

    pub fn prepare(&self, xid: TransactionId) -> Result<()> {
        self.transactions.prepare(xid)
    }

    /// Transactions in the prepared state, including ones recovered from the log.
    pub fn prepared_transactions(&self) -> Vec<TransactionId> {
        self.transactions.prepared()
    }

    /// Apply a registered operation to a page.
    pub fn update(
        &self,
        xid: TransactionId,
        page: PageId,
        op: OperationId,
        arg: Vec<u8>,
    ) -> Result<LSN> {
        self.transactions.update(xid, page, op, arg)
    }

    pub fn read_page<R>(
        &self,
        xid: TransactionId,
        page: PageId,
        f: impl FnOnce(&PageReadGuard<'_>) -> R,
    ) -> Result<R> {
        self.transactions.read(xid, page, f)
    }

    /// Allocate a zeroed record of `size` bytes.
    pub fn alloc(&self, xid: TransactionId, size: usize) -> Result<RecordId> {
        if size == 0 || size > MAX_RECORD_SIZE {
            return Err(EngineError::InvalidArgument(format!(
                "record size {} is outside 1..={}",
                size, MAX_RECORD_SIZE
            )));
        }

        loop {
            let page = match self.allocation.find_page(xid, size) {
                Some(page) => page,
                None => self.format_page(xid)?,
            };
            if !self.allocation.alloced_from_page(xid, page) {
                continue;
            }

            let mut slot = None;
            self.transactions
                .update_with(xid, page, slotted::ALLOC, |guard| {
                    if guard.page_type() != PageType::Slotted {
                        return Ok(None);
                    }
                    let Some(arg) = SlottedPage::new(&guard[..]).plan_alloc(size as u16) else {
                        return Ok(None);
                    };
                    slot = Some(arg.slot);
                    slotted::encode(&arg).map(Some)
                })?;

            // Either way the recorded free space was stale or is now.
            let free = self.free_space(xid, page)?;
            self.allocation.update_freespace_locked(xid, page, free);
            if let Some(slot) = slot {
                return Ok(RecordId {
                    page,
                    slot,
                    size: size as u16,
                });
            }
        }
    }

    /// Format a fresh page at the end of the store.
    fn format_page(&self, xid: TransactionId) -> Result<PageId> {
        let page = PageId(self.next_page.fetch_add(1, Ordering::SeqCst));
        self.transactions
            .update(xid, page, slotted::PAGE_INIT, Vec::new())?;
        self.allocation.add_page(page, self.free_space(xid, page)?);
        Ok(page)
    }

    fn free_space(&self, xid: TransactionId, page: PageId) -> Result<usize> {
        self.transactions
            .read(xid, page, |guard| SlottedPage::new(&guard[..]).free_space())
    }

    /// Overwrite the record `rid` with `data`, which must match its size.
    pub fn set(&self, xid: TransactionId, rid: RecordId, data: &[u8]) -> Result<LSN> {
        let lsn = self
            .transactions
            .update_with(xid, rid.page, slotted::SET, |guard| {
                let arg = slotted::set_arg(guard, rid, data)?;
                slotted::encode(&arg).map(Some)
            })?;
        Ok(lsn.unwrap_or_default())
    }

    pub fn read(&self, xid: TransactionId, rid: RecordId) -> Result<Vec<u8>> {
        self.transactions.read(xid, rid.page, |guard| {
            if guard.page_type() != PageType::Slotted {
                return Err(EngineError::PageTypeMismatch {
                    page: rid.page,
                    expected: PageType::Slotted,
                    actual: guard.page_type(),
                });
            }
            SlottedPage::new(&guard[..])
                .record(rid.slot)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| EngineError::InvalidRecord {
                    rid,
                    reason: "no such record".to_string(),
                })
        })?
    }

    /// Free the record `rid`. Its space is not reused before `xid` completes.
    pub fn dealloc(&self, xid: TransactionId, rid: RecordId) -> Result<LSN> {
        let lsn = self
            .transactions
            .update_with(xid, rid.page, slotted::DEALLOC, |guard| {
                let arg = slotted::dealloc_arg(guard, rid)?;
                slotted::encode(&arg).map(Some)
            })?;
        self.allocation.dealloced_from_page(xid, rid.page);
        Ok(lsn.unwrap_or_default())
    }

    /// Truncate the log now. See [`Truncator::truncate_now`].
    pub fn truncate_now(&self, force: bool) -> Result<bool> {
        self.truncator.truncate_now(force)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn buffers(&self) -> &Arc<dyn BufferManager> {
        &self.buffers
    }

    pub fn dirty_pages(&self) -> &Arc<DirtyPageTable> {
        self.buffers.dirty_pages()
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn table(&self) -> &Arc<TransactionTable> {
        self.transactions.table()
    }

    pub fn allocation(&self) -> &Arc<AllocationPolicy> {
        &self.allocation
    }

    pub fn truncator(&self) -> &Arc<Truncator> {
        &self.truncator
    }

    /// What recovery found when this engine started.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    /// Number of pages the engine has formatted or found on disk.
    pub fn page_count(&self) -> u64 {
        self.next_page.load(Ordering::SeqCst)
    }
}
