//! Pinned page handles and their latch guards.
//!
//! A [`PageRef`] keeps one pin on a cached page; dropping it hands the pin
//! back to the owning buffer manager. Bytes are reached through
//! [`PageReadGuard`] and [`PageWriteGuard`], which hold the page latch for
//! as long as they live.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::storage::dirty_page_table::DirtyPageTable;
use crate::storage::page::{trailer, Page, PageId, PageType, USABLE_PAGE_SIZE};
use crate::storage::wal::LSN;

/// What a [`PageRef`] needs from the manager that handed it out.
pub(crate) trait PagePool: Send + Sync {
    /// Give back one pin on `page`.
    fn release(&self, page: &Arc<Page>);

    fn dirty_pages(&self) -> &DirtyPageTable;
}

/// A pinned, cached page. The pin is released on drop.
pub struct PageRef {
    page: Arc<Page>,
    pool: Arc<dyn PagePool>,
}

impl PageRef {
    /// Wrap a page the caller has already pinned on behalf of `pool`.
    pub(crate) fn new(page: Arc<Page>, pool: Arc<dyn PagePool>) -> Self {
        Self { page, pool }
    }

    pub fn page_id(&self) -> PageId {
        self.page.id()
    }

    pub fn pin_count(&self) -> u32 {
        self.page.pin_count()
    }

    pub fn is_dirty(&self) -> bool {
        self.page.is_dirty()
    }

    pub fn read(&self) -> PageReadGuard<'_> {
        self.page.latch().read_lock();
        PageReadGuard { page: &self.page }
    }

    pub fn write(&self) -> PageWriteGuard<'_> {
        self.page.latch().write_lock();
        PageWriteGuard {
            page: &self.page,
            dirty_pages: self.pool.dirty_pages(),
        }
    }

    pub fn try_write(&self) -> Option<PageWriteGuard<'_>> {
        self.page.latch().try_write_lock().then(|| PageWriteGuard {
            page: &self.page,
            dirty_pages: self.pool.dirty_pages(),
        })
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        self.pool.release(&self.page);
    }
}

impl fmt::Debug for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PageRef").field(&self.page).finish()
    }
}

/// Shared latch hold on a page. Derefs to the bytes in front of the trailer.
pub struct PageReadGuard<'a> {
    page: &'a Page,
}

impl PageReadGuard<'_> {
    pub fn page_id(&self) -> PageId {
        self.page.id()
    }

    pub fn lsn(&self) -> LSN {
        // SAFETY: the read latch is held.
        trailer::read_lsn(unsafe { self.page.bytes() })
    }

    pub fn page_type(&self) -> PageType {
        trailer::read_page_type(unsafe { self.page.bytes() })
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the read latch is held.
        unsafe { &self.page.bytes()[..USABLE_PAGE_SIZE] }
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.page.latch().unlock();
    }
}

/// Exclusive latch hold on a page.
pub struct PageWriteGuard<'a> {
    page: &'a Page,
    dirty_pages: &'a DirtyPageTable,
}

impl<'a> PageWriteGuard<'a> {
    pub fn page_id(&self) -> PageId {
        self.page.id()
    }

    pub fn lsn(&self) -> LSN {
        // SAFETY: the write latch is held.
        trailer::read_lsn(unsafe { self.page.bytes() })
    }

    pub fn page_type(&self) -> PageType {
        trailer::read_page_type(unsafe { self.page.bytes() })
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        trailer::write_page_type(unsafe { self.page.bytes_mut() }, page_type);
    }

    /// Record that the page now reflects the log entry at `lsn`.
    ///
    /// The stamp never moves backwards. The page becomes dirty, and enters the
    /// dirty page table with `lsn` as its recLSN if it was clean.
    pub fn stamp_lsn(&mut self, lsn: LSN) {
        // SAFETY: the write latch is held.
        let bytes = unsafe { self.page.bytes_mut() };
        if lsn > trailer::read_lsn(bytes) {
            trailer::write_lsn(bytes, lsn);
        }
        self.page.set_dirty(true);
        self.dirty_pages.set_dirty(self.page.id(), lsn);
    }

    /// Trade the exclusive hold for a shared one without unlocking in between.
    pub fn downgrade(self) -> PageReadGuard<'a> {
        self.page.latch().downgrade();
        let page = self.page;
        mem::forget(self);
        PageReadGuard { page }
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { &self.page.bytes()[..USABLE_PAGE_SIZE] }
    }
}

impl DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: the write latch is held.
        unsafe { &mut self.page.bytes_mut()[..USABLE_PAGE_SIZE] }
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.page.latch().unlock();
    }
}
