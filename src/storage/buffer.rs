//! Buffer managers: the page cache between callers and the page handle.
//!
//! Every manager hands out pinned [`PageRef`]s, keeps the pin counts in step
//! with a replacement policy, and writes dirty pages back under the WAL rule:
//! before a page image with LSN `L` reaches the page handle, the log is forced
//! through `L`.
//!
//! - [`PageArrayManager`]: in-memory, unbounded, never evicts
//! - [`BufferHash`]: bounded, one mutex around the page table
//! - [`ConcurrentBufferManager`]: bounded, sharded page table

pub mod clock;
pub mod concurrent;
pub mod guard;
pub mod hash;
pub mod lru;
pub mod lru_fast;
pub mod page_array;
pub mod replacer;
pub mod sharded;
pub mod threadsafe;

pub use clock::ClockPolicy;
pub use concurrent::ConcurrentBufferManager;
pub use guard::{PageReadGuard, PageRef, PageWriteGuard};
pub use hash::BufferHash;
pub use lru::LruPolicy;
pub use lru_fast::LruFastPolicy;
pub use page_array::PageArrayManager;
pub use replacer::{ReplacementPolicy, SharedReplacementPolicy};
pub use sharded::ShardedPolicy;
pub use threadsafe::ThreadsafePolicy;

use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::error::{fatal, EngineError, Result};
use crate::storage::dirty_page_table::DirtyPageTable;
use crate::storage::disk::PageHandle;
use crate::storage::page::{trailer, Page, PageId, PageType};
use crate::storage::wal::LogForce;
use crate::transaction::TransactionId;

pub trait BufferManager: Send + Sync {
    /// Pin `page`, reading it through the page handle on a miss.
    ///
    /// A `hint` other than [`PageType::Uninitialized`] is checked against
    /// the type recorded in the page trailer; uninitialized pages match any
    /// hint.
    fn load_page(&self, xid: TransactionId, page: PageId, hint: PageType) -> Result<PageRef>;

    /// Pin `page` only if it is already cached. Never does I/O.
    fn get_cached_page(&self, xid: TransactionId, page: PageId) -> Option<PageRef>;

    /// Write `page` back if it is cached and dirty.
    fn write_back_page(&self, page: PageId) -> Result<()>;

    /// Write back every dirty page and force the page handle.
    fn flush_all(&self) -> Result<()>;

    /// Write back dirty pages in `[start, stop)` and force that range.
    fn force_range(&self, start: PageId, stop: PageId) -> Result<()>;

    /// Make every completed write-back durable.
    fn force_pages(&self) -> Result<()>;

    /// Whether written-back pages outlive a crash. When false, recovery has
    /// to replay the whole log.
    fn persists_pages(&self) -> bool {
        true
    }

    /// Flush everything and close the page handle. Later loads fail with
    /// [`EngineError::Closed`].
    fn close(&self) -> Result<()>;

    /// Drop every cached page without writing anything back.
    fn simulate_crash(&self);

    fn dirty_pages(&self) -> &Arc<DirtyPageTable>;

    /// Maximum number of cached pages, `None` when unbounded.
    fn capacity(&self) -> Option<usize>;

    fn cached_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    PageArray,
    Hash,
    Concurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Lru,
    LruFast,
    Clock,
    /// Fast LRU sharded over `buckets` independently locked cores.
    Concurrent { buckets: usize },
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub kind: BufferKind,
    pub policy: PolicyKind,
    /// Cached page limit for the bounded managers.
    pub capacity: usize,
    /// How long a loader waits for a pin to drop when every page is pinned.
    pub eviction_wait: Duration,
    /// Waits before a loader gives up with `BufferPoolExhausted`.
    pub eviction_retries: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            kind: BufferKind::Concurrent,
            policy: PolicyKind::Concurrent { buckets: 16 },
            capacity: 1024,
            eviction_wait: Duration::from_millis(50),
            eviction_retries: 20,
        }
    }
}

impl PolicyKind {
    pub fn build(self) -> Box<dyn SharedReplacementPolicy> {
        match self {
            PolicyKind::Lru => Box::new(ThreadsafePolicy::new(LruPolicy::new())),
            PolicyKind::LruFast => Box::new(ThreadsafePolicy::new(LruFastPolicy::new())),
            PolicyKind::Clock => Box::new(ThreadsafePolicy::new(ClockPolicy::new())),
            PolicyKind::Concurrent { buckets } => {
                Box::new(ShardedPolicy::new(buckets, LruFastPolicy::new))
            }
        }
    }
}

/// Build the manager `config` asks for.
pub fn new_buffer_manager(
    config: &BufferConfig,
    handle: Arc<dyn PageHandle>,
    log: Arc<dyn LogForce>,
    dirty_pages: Arc<DirtyPageTable>,
) -> Arc<dyn BufferManager> {
    match config.kind {
        BufferKind::PageArray => Arc::new(PageArrayManager::new(log, dirty_pages)),
        BufferKind::Hash => Arc::new(BufferHash::new(config.clone(), handle, log, dirty_pages)),
        BufferKind::Concurrent => Arc::new(ConcurrentBufferManager::new(
            config.clone(),
            handle,
            log,
            dirty_pages,
        )),
    }
}

/// Write one page image back, forcing the log through its LSN first.
///
/// Takes the page's read latch, so concurrent writers wait for the I/O. The
/// page is cleared from the dirty page table only after the write succeeds.
/// A failed write is fatal.
pub(crate) fn write_back(
    page: &Page,
    log: &dyn LogForce,
    handle: Option<&dyn PageHandle>,
    dirty_pages: &DirtyPageTable,
) {
    page.latch().read_lock();
    if page.is_dirty() {
        // SAFETY: the read latch is held until the end of this block.
        let bytes = unsafe { page.bytes() };
        let lsn = trailer::read_lsn(bytes);
        log.force_to(lsn);
        if let Some(handle) = handle {
            if let Err(e) = handle.write(page.id(), bytes) {
                fatal(&format!("write back of {}", page.id()), e);
            }
        }
        trace!("wrote back {} at {}", page.id(), lsn);
        page.set_dirty(false);
        dirty_pages.set_clean(page.id());
    }
    page.latch().unlock();
}

/// Reject a pinned page whose recorded type disagrees with `hint`.
pub(crate) fn check_page_type(page: &PageRef, hint: PageType) -> Result<()> {
    if hint == PageType::Uninitialized {
        return Ok(());
    }
    let actual = page.read().page_type();
    if actual == PageType::Uninitialized || actual == hint {
        Ok(())
    } else {
        Err(EngineError::PageTypeMismatch {
            page: page.page_id(),
            expected: hint,
            actual,
        })
    }
}
