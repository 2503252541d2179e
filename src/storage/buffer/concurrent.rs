//! Bounded buffer manager over a sharded page table.
//!
//! Hits only touch one `DashMap` shard and the page's pin word. A miss
//! reserves a slot on the `resident` counter (evicting when the pool is
//! full), publishes a write-latched placeholder page, and reads it in;
//! concurrent users of the same page pin the placeholder and block on its
//! latch until the read finishes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use super::guard::{PagePool, PageRef};
use super::replacer::SharedReplacementPolicy;
use super::{check_page_type, write_back, BufferConfig, BufferManager};
use crate::error::{fatal, EngineError, Result};
use crate::storage::dirty_page_table::DirtyPageTable;
use crate::storage::disk::PageHandle;
use crate::storage::page::{Page, PageId, PageType};
use crate::storage::wal::LogForce;
use crate::transaction::TransactionId;

pub struct ConcurrentBufferManager {
    inner: Arc<ConcurrentInner>,
}

struct ConcurrentInner {
    table: DashMap<PageId, Arc<Page>>,
    /// Slots in use, including pages still being read in.
    resident: AtomicUsize,
    policy: Box<dyn SharedReplacementPolicy>,
    handle: Arc<dyn PageHandle>,
    log: Arc<dyn LogForce>,
    dirty_pages: Arc<DirtyPageTable>,
    config: BufferConfig,
    closed: AtomicBool,
    wait_lock: Mutex<()>,
    released: Condvar,
}

enum Lookup {
    Pinned(PageRef),
    Evicting,
    Missing,
}

enum Eviction {
    Evicted,
    /// The candidate was pinned or already gone; try another.
    Skipped,
    NoCandidate,
}

impl PagePool for ConcurrentInner {
    fn release(&self, page: &Arc<Page>) {
        let remaining = page.unpin();
        self.policy.insert(page.id());
        if remaining == 0 {
            let _guard = self.wait_lock.lock();
            self.released.notify_all();
        }
    }

    fn dirty_pages(&self) -> &DirtyPageTable {
        &self.dirty_pages
    }
}

impl ConcurrentInner {
    fn write_back(&self, page: &Page) {
        write_back(
            page,
            self.log.as_ref(),
            Some(self.handle.as_ref()),
            &self.dirty_pages,
        );
    }

    fn wait_for_release(&self) {
        let mut guard = self.wait_lock.lock();
        self.released.wait_for(&mut guard, self.config.eviction_wait);
    }

    fn evict_one(&self) -> Eviction {
        let Some(victim_id) = self.policy.get_stale_and_remove() else {
            return Eviction::NoCandidate;
        };
        let Some(victim) = self.table.get(&victim_id).map(|entry| entry.value().clone()) else {
            return Eviction::Skipped;
        };
        if !victim.begin_eviction() {
            return Eviction::Skipped;
        }
        if victim.is_dirty() {
            debug!("evicting dirty {}", victim_id);
        }
        self.write_back(&victim);
        self.table
            .remove_if(&victim_id, |_, cached| Arc::ptr_eq(cached, &victim));
        self.resident.fetch_sub(1, Ordering::SeqCst);
        let _guard = self.wait_lock.lock();
        self.released.notify_all();
        Eviction::Evicted
    }

    /// Claim one slot of the pool, evicting to make room.
    fn reserve_slot(&self) -> Result<()> {
        let capacity = self.config.capacity;
        let mut waits = 0;
        loop {
            let current = self.resident.load(Ordering::SeqCst);
            if current < capacity {
                if self
                    .resident
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            match self.evict_one() {
                Eviction::Evicted | Eviction::Skipped => continue,
                Eviction::NoCandidate => {}
            }
            if waits >= self.config.eviction_retries {
                return Err(EngineError::BufferPoolExhausted(capacity));
            }
            waits += 1;
            self.wait_for_release();
        }
    }
}

impl ConcurrentBufferManager {
    pub fn new(
        config: BufferConfig,
        handle: Arc<dyn PageHandle>,
        log: Arc<dyn LogForce>,
        dirty_pages: Arc<DirtyPageTable>,
    ) -> Self {
        Self {
            inner: Arc::new(ConcurrentInner {
                table: DashMap::with_capacity(config.capacity),
                resident: AtomicUsize::new(0),
                policy: config.policy.build(),
                handle,
                log,
                dirty_pages,
                config,
                closed: AtomicBool::new(false),
                wait_lock: Mutex::new(()),
                released: Condvar::new(),
            }),
        }
    }

    fn cached(&self, page: PageId) -> Option<Arc<Page>> {
        self.inner.table.get(&page).map(|entry| entry.value().clone())
    }

    fn lookup(&self, page: PageId) -> Lookup {
        let Some(cached) = self.cached(page) else {
            return Lookup::Missing;
        };
        if !cached.try_pin() {
            return Lookup::Evicting;
        }
        self.inner.policy.remove(page);
        self.inner.policy.hit(page);
        Lookup::Pinned(PageRef::new(cached, self.inner.clone()))
    }

    fn load(&self, xid: TransactionId, id: PageId) -> Result<PageRef> {
        let inner = &self.inner;
        loop {
            if inner.closed.load(Ordering::SeqCst) {
                return Err(EngineError::Closed);
            }
            match self.lookup(id) {
                Lookup::Pinned(page_ref) => return Ok(page_ref),
                Lookup::Evicting => {
                    // The slot frees once the write-back is done.
                    inner.wait_for_release();
                    continue;
                }
                Lookup::Missing => {}
            }

            inner.reserve_slot()?;
            let page = Arc::new(Page::new_pinned(id));
            page.latch().write_lock();
            match inner.table.entry(id) {
                Entry::Occupied(_) => {
                    // Someone else is loading it; use theirs.
                    page.latch().unlock();
                    inner.resident.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
                Entry::Vacant(slot) => {
                    slot.insert(page.clone());
                }
            }
            inner.policy.remove(id);

            // The placeholder may already be pinned by other loaders, so a
            // failed read cannot be rolled back. Past-EOF reads never fail.
            // SAFETY: the write latch is held.
            if let Err(e) = inner.handle.read(id, unsafe { page.bytes_mut() }) {
                fatal(&format!("read of {}", id), e);
            }
            page.latch().unlock();
            let page_ref = PageRef::new(page, inner.clone());
            trace!("{} loaded {}", xid, id);
            return Ok(page_ref);
        }
    }
}

impl BufferManager for ConcurrentBufferManager {
    fn load_page(&self, xid: TransactionId, page: PageId, hint: PageType) -> Result<PageRef> {
        let page_ref = self.load(xid, page)?;
        check_page_type(&page_ref, hint)?;
        Ok(page_ref)
    }

    fn get_cached_page(&self, _xid: TransactionId, page: PageId) -> Option<PageRef> {
        match self.lookup(page) {
            Lookup::Pinned(page_ref) => Some(page_ref),
            Lookup::Evicting | Lookup::Missing => None,
        }
    }

    fn write_back_page(&self, page: PageId) -> Result<()> {
        if let Some(cached) = self.cached(page) {
            self.inner.write_back(&cached);
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        let pages: Vec<_> = self
            .inner
            .table
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for page in pages {
            self.inner.write_back(&page);
        }
        self.inner.handle.force()?;
        Ok(())
    }

    fn force_range(&self, start: PageId, stop: PageId) -> Result<()> {
        for page in self.inner.dirty_pages.dirty_pages_in(start, stop) {
            self.write_back_page(page)?;
        }
        self.inner.handle.force_range(start, stop)?;
        Ok(())
    }

    fn force_pages(&self) -> Result<()> {
        self.inner.handle.force()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.flush_all()?;
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.table.clear();
        self.inner.resident.store(0, Ordering::SeqCst);
        self.inner.handle.close()?;
        Ok(())
    }

    fn simulate_crash(&self) {
        self.inner.table.clear();
        self.inner.resident.store(0, Ordering::SeqCst);
    }

    fn dirty_pages(&self) -> &Arc<DirtyPageTable> {
        &self.inner.dirty_pages
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.inner.config.capacity)
    }

    fn cached_count(&self) -> usize {
        self.inner.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::testing::{
        expect_abort, in_abort_child, CheckedHandle, FailingReadHandle, RecordingLog,
    };
    use crate::storage::buffer::PolicyKind;
    use crate::storage::wal::LSN;
    use anyhow::Result;
    use std::thread;

    const XID: TransactionId = TransactionId(1);

    #[test]
    fn test_same_page_loaded_once() -> Result<()> {
        let log = Arc::new(RecordingLog::default());
        let manager = Arc::new(ConcurrentBufferManager::new(
            BufferConfig {
                capacity: 4,
                policy: PolicyKind::Concurrent { buckets: 2 },
                ..BufferConfig::default()
            },
            Arc::new(CheckedHandle::new(log.clone())),
            log,
            Arc::new(DirtyPageTable::new()),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || -> Result<()> {
                    for _ in 0..100 {
                        let page = manager.load_page(XID, PageId(9), PageType::Uninitialized)?;
                        let mut guard = page.write();
                        let value = guard[0].wrapping_add(1);
                        guard[0] = value;
                        let next = guard.lsn().0 + 1;
                        guard.stamp_lsn(LSN(next));
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap()?;
        }

        assert_eq!(manager.cached_count(), 1);
        let page = manager.load_page(XID, PageId(9), PageType::Uninitialized)?;
        let guard = page.read();
        assert_eq!(guard[0], (800 % 256) as u8);
        assert_eq!(guard.lsn(), LSN(800));
        Ok(())
    }

    #[test]
    fn test_read_error_aborts_the_process() -> Result<()> {
        if in_abort_child() {
            let manager = ConcurrentBufferManager::new(
                BufferConfig {
                    capacity: 2,
                    ..BufferConfig::default()
                },
                Arc::new(FailingReadHandle),
                Arc::new(RecordingLog::default()),
                Arc::new(DirtyPageTable::new()),
            );
            let _ = manager.load_page(XID, PageId(3), PageType::Uninitialized);
            return Ok(());
        }
        expect_abort(
            "storage::buffer::concurrent::tests::test_read_error_aborts_the_process",
            "read of Page(3)",
        )
    }

    #[test]
    fn test_resident_count_tracks_evictions() -> Result<()> {
        let log = Arc::new(RecordingLog::default());
        let manager = ConcurrentBufferManager::new(
            BufferConfig {
                capacity: 3,
                policy: PolicyKind::LruFast,
                ..BufferConfig::default()
            },
            Arc::new(CheckedHandle::new(log.clone())),
            log,
            Arc::new(DirtyPageTable::new()),
        );
        for page in 0..10 {
            manager.load_page(XID, PageId(page), PageType::Uninitialized)?;
        }
        assert_eq!(manager.cached_count(), 3);
        assert_eq!(manager.inner.resident.load(Ordering::SeqCst), 3);

        // LRU keeps the three most recent pages.
        for page in 7..10 {
            assert!(manager.get_cached_page(XID, PageId(page)).is_some());
        }
        Ok(())
    }
}
