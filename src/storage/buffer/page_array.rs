//! In-memory buffer manager.
//!
//! Pages are created zero-filled on first load and never leave memory. Write
//! back still forces the log and cleans the dirty page table, so the WAL
//! bookkeeping behaves as it does with a real page file. Nothing survives a
//! crash, so [`BufferManager::persists_pages`] is false.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::guard::{PagePool, PageRef};
use super::{check_page_type, write_back, BufferManager};
use crate::error::{EngineError, Result};
use crate::storage::dirty_page_table::DirtyPageTable;
use crate::storage::page::{Page, PageId, PageType};
use crate::storage::wal::LogForce;
use crate::transaction::TransactionId;

pub struct PageArrayManager {
    inner: Arc<PageArrayInner>,
}

struct PageArrayInner {
    pages: RwLock<HashMap<PageId, Arc<Page>>>,
    log: Arc<dyn LogForce>,
    dirty_pages: Arc<DirtyPageTable>,
    closed: AtomicBool,
}

impl PagePool for PageArrayInner {
    fn release(&self, page: &Arc<Page>) {
        page.unpin();
    }

    fn dirty_pages(&self) -> &DirtyPageTable {
        &self.dirty_pages
    }
}

impl PageArrayManager {
    pub fn new(log: Arc<dyn LogForce>, dirty_pages: Arc<DirtyPageTable>) -> Self {
        Self {
            inner: Arc::new(PageArrayInner {
                pages: RwLock::new(HashMap::new()),
                log,
                dirty_pages,
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn pin_existing(&self, page: PageId) -> Option<PageRef> {
        let pages = self.inner.pages.read();
        let cached = pages.get(&page)?;
        // Nothing here evicts, so a cached page can always be pinned.
        cached.try_pin().then(|| PageRef::new(cached.clone(), self.inner.clone()))
    }

    fn cached(&self, page: PageId) -> Option<Arc<Page>> {
        self.inner.pages.read().get(&page).cloned()
    }
}

impl BufferManager for PageArrayManager {
    fn load_page(&self, xid: TransactionId, page: PageId, hint: PageType) -> Result<PageRef> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        let page_ref = match self.pin_existing(page) {
            Some(page_ref) => page_ref,
            None => {
                let mut pages = self.inner.pages.write();
                match pages.get(&page) {
                    Some(cached) if cached.try_pin() => {
                        PageRef::new(cached.clone(), self.inner.clone())
                    }
                    _ => {
                        log::trace!("{} created {}", xid, page);
                        let fresh = Arc::new(Page::new_pinned(page));
                        pages.insert(page, fresh.clone());
                        PageRef::new(fresh, self.inner.clone())
                    }
                }
            }
        };
        check_page_type(&page_ref, hint)?;
        Ok(page_ref)
    }

    fn get_cached_page(&self, _xid: TransactionId, page: PageId) -> Option<PageRef> {
        self.pin_existing(page)
    }

    fn write_back_page(&self, page: PageId) -> Result<()> {
        if let Some(cached) = self.cached(page) {
            write_back(&cached, self.inner.log.as_ref(), None, &self.inner.dirty_pages);
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        let pages: Vec<_> = self.inner.pages.read().values().cloned().collect();
        for page in pages {
            write_back(&page, self.inner.log.as_ref(), None, &self.inner.dirty_pages);
        }
        Ok(())
    }

    fn force_range(&self, start: PageId, stop: PageId) -> Result<()> {
        for page in self.inner.dirty_pages.dirty_pages_in(start, stop) {
            self.write_back_page(page)?;
        }
        Ok(())
    }

    fn force_pages(&self) -> Result<()> {
        Ok(())
    }

    fn persists_pages(&self) -> bool {
        false
    }

    fn close(&self) -> Result<()> {
        self.flush_all()?;
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn simulate_crash(&self) {
        self.inner.pages.write().clear();
    }

    fn dirty_pages(&self) -> &Arc<DirtyPageTable> {
        &self.inner.dirty_pages
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn cached_count(&self) -> usize {
        self.inner.pages.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::testing::RecordingLog;
    use crate::storage::wal::LSN;
    use anyhow::Result;

    const XID: TransactionId = TransactionId(1);

    #[test]
    fn test_pages_persist_in_memory() -> Result<()> {
        let log = Arc::new(RecordingLog::default());
        let manager = PageArrayManager::new(log.clone(), Arc::new(DirtyPageTable::new()));

        for page in (0..100).rev() {
            let page_ref = manager.load_page(XID, PageId(page), PageType::Uninitialized)?;
            let mut guard = page_ref.write();
            guard[10] = page as u8;
            guard.stamp_lsn(LSN(page + 1));
        }
        assert_eq!(manager.cached_count(), 100);
        assert_eq!(manager.capacity(), None);

        for page in 0..100 {
            let page_ref = manager.get_cached_page(XID, PageId(page)).unwrap();
            assert_eq!(page_ref.read()[10], page as u8);
        }

        assert_eq!(manager.dirty_pages().dirty_count(), 100);
        manager.flush_all()?;
        assert_eq!(manager.dirty_pages().dirty_count(), 0);
        assert_eq!(log.forced(), LSN(100));
        Ok(())
    }

    #[test]
    fn test_sparse_page_ids() -> Result<()> {
        let manager = PageArrayManager::new(
            Arc::new(RecordingLog::default()),
            Arc::new(DirtyPageTable::new()),
        );
        let far = PageId(1 << 40);
        {
            let page_ref = manager.load_page(XID, far, PageType::Uninitialized)?;
            page_ref.write()[0] = 4;
        }
        manager.load_page(XID, PageId(u64::MAX), PageType::Uninitialized)?;

        assert_eq!(manager.cached_count(), 2);
        assert_eq!(manager.get_cached_page(XID, far).unwrap().read()[0], 4);
        assert!(manager.get_cached_page(XID, PageId(1)).is_none());
        Ok(())
    }

    #[test]
    fn test_pins_are_counted() -> Result<()> {
        let manager = PageArrayManager::new(
            Arc::new(RecordingLog::default()),
            Arc::new(DirtyPageTable::new()),
        );
        let a = manager.load_page(XID, PageId(4), PageType::Uninitialized)?;
        let b = manager.load_page(XID, PageId(4), PageType::Uninitialized)?;
        assert_eq!(a.pin_count(), 2);
        drop(b);
        assert_eq!(a.pin_count(), 1);
        assert!(manager.get_cached_page(XID, PageId(5)).is_none());
        Ok(())
    }

    #[test]
    fn test_downgrade_keeps_the_page_readable() -> Result<()> {
        let manager = PageArrayManager::new(
            Arc::new(RecordingLog::default()),
            Arc::new(DirtyPageTable::new()),
        );
        let page = manager.load_page(XID, PageId(0), PageType::Uninitialized)?;
        let mut guard = page.write();
        guard[0] = 9;
        let read = guard.downgrade();
        assert_eq!(read[0], 9);
        assert!(page.try_write().is_none());
        drop(read);
        assert!(page.try_write().is_some());
        Ok(())
    }
}
