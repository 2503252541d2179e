//! Bounded buffer manager with a single page-table mutex.
//!
//! The mutex covers the page table and the set of pages being read in; it is
//! released around page I/O. A page being read in is not in the table yet, so
//! concurrent loaders of the same page wait on `changed` until it shows up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::guard::{PagePool, PageRef};
use super::replacer::SharedReplacementPolicy;
use super::{check_page_type, write_back, BufferConfig, BufferManager};
use crate::error::{fatal, EngineError, Result};
use crate::storage::dirty_page_table::DirtyPageTable;
use crate::storage::disk::PageHandle;
use crate::storage::page::{Page, PageId, PageType};
use crate::storage::wal::LogForce;
use crate::transaction::TransactionId;

pub struct BufferHash {
    inner: Arc<HashInner>,
}

struct HashInner {
    state: Mutex<HashState>,
    /// Signalled when a page is loaded or evicted, or a pin count reaches zero.
    changed: Condvar,
    policy: Box<dyn SharedReplacementPolicy>,
    handle: Arc<dyn PageHandle>,
    log: Arc<dyn LogForce>,
    dirty_pages: Arc<DirtyPageTable>,
    config: BufferConfig,
}

#[derive(Default)]
struct HashState {
    pages: HashMap<PageId, Arc<Page>>,
    loading: HashSet<PageId>,
    closed: bool,
}

impl HashState {
    fn occupied(&self) -> usize {
        self.pages.len() + self.loading.len()
    }
}

impl PagePool for HashInner {
    fn release(&self, page: &Arc<Page>) {
        let remaining = page.unpin();
        self.policy.insert(page.id());
        if remaining == 0 {
            let _state = self.state.lock();
            self.changed.notify_all();
        }
    }

    fn dirty_pages(&self) -> &DirtyPageTable {
        &self.dirty_pages
    }
}

impl HashInner {
    fn write_back(&self, page: &Page) {
        write_back(
            page,
            self.log.as_ref(),
            Some(self.handle.as_ref()),
            &self.dirty_pages,
        );
    }

    /// Free one slot. Returns false when every cached page is pinned.
    fn evict_one(&self, state: &mut MutexGuard<'_, HashState>) -> bool {
        while let Some(victim_id) = self.policy.get_stale_and_remove() {
            let Some(victim) = state.pages.get(&victim_id).cloned() else {
                continue;
            };
            if !victim.begin_eviction() {
                // Pinned since the policy saw it; its release re-admits it.
                continue;
            }
            if victim.is_dirty() {
                debug!("evicting dirty {}", victim_id);
            }
            MutexGuard::unlocked(state, || self.write_back(&victim));
            state.pages.remove(&victim_id);
            self.changed.notify_all();
            return true;
        }
        false
    }
}

impl BufferHash {
    pub fn new(
        config: BufferConfig,
        handle: Arc<dyn PageHandle>,
        log: Arc<dyn LogForce>,
        dirty_pages: Arc<DirtyPageTable>,
    ) -> Self {
        Self {
            inner: Arc::new(HashInner {
                state: Mutex::new(HashState::default()),
                changed: Condvar::new(),
                policy: config.policy.build(),
                handle,
                log,
                dirty_pages,
                config,
            }),
        }
    }

    fn pin(&self, page: &Arc<Page>) -> Option<PageRef> {
        if !page.try_pin() {
            return None;
        }
        self.inner.policy.remove(page.id());
        self.inner.policy.hit(page.id());
        Some(PageRef::new(page.clone(), self.inner.clone()))
    }

    fn load(&self, xid: TransactionId, id: PageId) -> Result<PageRef> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let mut waits = 0;
        loop {
            if state.closed {
                return Err(EngineError::Closed);
            }
            if let Some(page) = state.pages.get(&id).cloned() {
                if let Some(page_ref) = self.pin(&page) {
                    return Ok(page_ref);
                }
                // Being evicted; it leaves the table once written back.
                inner.changed.wait(&mut state);
                continue;
            }
            if state.loading.contains(&id) {
                inner.changed.wait(&mut state);
                continue;
            }
            if state.occupied() < inner.config.capacity {
                break;
            }
            if inner.evict_one(&mut state) {
                // The table may have changed while the victim was written.
                continue;
            }
            if waits >= inner.config.eviction_retries {
                return Err(EngineError::BufferPoolExhausted(inner.config.capacity));
            }
            waits += 1;
            inner.changed.wait_for(&mut state, inner.config.eviction_wait);
        }

        state.loading.insert(id);
        let page = Arc::new(Page::new_pinned(id));
        // SAFETY: the page is not published until the read completes.
        let result = MutexGuard::unlocked(&mut state, || {
            inner.handle.read(id, unsafe { page.bytes_mut() })
        });
        if let Err(e) = result {
            // Past-EOF reads come back zero-filled; anything else is fatal.
            fatal(&format!("read of {}", id), e);
        }
        state.loading.remove(&id);
        inner.changed.notify_all();

        log::trace!("{} loaded {}", xid, id);
        state.pages.insert(id, page.clone());
        inner.policy.remove(id);
        Ok(PageRef::new(page, inner.clone()))
    }

    fn cached(&self, page: PageId) -> Option<Arc<Page>> {
        self.inner.state.lock().pages.get(&page).cloned()
    }
}

impl BufferManager for BufferHash {
    fn load_page(&self, xid: TransactionId, page: PageId, hint: PageType) -> Result<PageRef> {
        let page_ref = self.load(xid, page)?;
        check_page_type(&page_ref, hint)?;
        Ok(page_ref)
    }

    fn get_cached_page(&self, _xid: TransactionId, page: PageId) -> Option<PageRef> {
        let cached = self.cached(page)?;
        self.pin(&cached)
    }

    fn write_back_page(&self, page: PageId) -> Result<()> {
        if let Some(cached) = self.cached(page) {
            self.inner.write_back(&cached);
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        let pages: Vec<_> = self.inner.state.lock().pages.values().cloned().collect();
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
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.pages.clear();
        self.inner.changed.notify_all();
        drop(state);
        self.inner.handle.close()?;
        Ok(())
    }

    fn simulate_crash(&self) {
        let mut state = self.inner.state.lock();
        state.pages.clear();
        self.inner.changed.notify_all();
    }

    fn dirty_pages(&self) -> &Arc<DirtyPageTable> {
        &self.inner.dirty_pages
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.inner.config.capacity)
    }

    fn cached_count(&self) -> usize {
        self.inner.state.lock().pages.len()
    }
}
