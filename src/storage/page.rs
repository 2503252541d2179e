//! In-memory page frames.
//!
//! A [`Page`] is a fixed-size buffer plus the metadata the buffer manager
//! needs: its identity, a latch, a pin count and a dirty flag. The page type
//! and LSN live in the page's own trailer bytes (see [`trailer`]) so that
//! they reach disk with the page image.

pub mod trailer;

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::concurrency::Latch;

/// Size of every page, in memory and on disk.
pub const PAGE_SIZE: usize = 8192;

/// Bytes available to page formats; the rest is the trailer.
pub const USABLE_PAGE_SIZE: usize = PAGE_SIZE - trailer::TRAILER_SIZE;

/// Stable identity of a page on the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({})", self.0)
    }
}

/// Record-format tag stored in the page trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    /// Never formatted. Freshly allocated storage reads back as this.
    Uninitialized,
    /// Slotted record page, see `operation::slotted`.
    Slotted,
    /// Bytes interpreted by the caller.
    Raw,
    /// A tag this build does not know about.
    Unknown(u32),
}

impl PageType {
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            0 => PageType::Uninitialized,
            1 => PageType::Slotted,
            2 => PageType::Raw,
            other => PageType::Unknown(other),
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            PageType::Uninitialized => 0,
            PageType::Slotted => 1,
            PageType::Raw => 2,
            PageType::Unknown(tag) => tag,
        }
    }
}

const EVICTING: u32 = 1 << 31;

/// A page frame owned by a buffer manager.
///
/// The bytes are only reachable through the latch-holding guards in
/// `storage::buffer`.
pub struct Page {
    id: PageId,
    latch: Latch,
    data: UnsafeCell<Box<[u8; PAGE_SIZE]>>,
    /// Pin count in the low bits, `EVICTING` once an evictor has claimed the frame.
    pins: AtomicU32,
    dirty: AtomicBool,
}

// SAFETY: the byte buffer is only touched while `latch` is held in the
// matching mode, which serializes writers against everyone else.
unsafe impl Sync for Page {}

impl Page {
    /// Create a zero-filled page that starts with one pin.
    pub(crate) fn new_pinned(id: PageId) -> Self {
        Self {
            id,
            latch: Latch::new(),
            data: UnsafeCell::new(Box::new([0u8; PAGE_SIZE])),
            pins: AtomicU32::new(1),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::SeqCst) & !EVICTING
    }

    pub fn is_evicting(&self) -> bool {
        self.pins.load(Ordering::SeqCst) & EVICTING != 0
    }

    /// Add a pin unless an evictor already claimed the frame.
    pub(crate) fn try_pin(&self) -> bool {
        let mut current = self.pins.load(Ordering::SeqCst);
        loop {
            if current & EVICTING != 0 {
                return false;
            }
            match self.pins.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a pin and return the remaining count.
    pub(crate) fn unpin(&self) -> u32 {
        let previous = self.pins.fetch_sub(1, Ordering::SeqCst);
        assert!(
            previous & !EVICTING > 0,
            "page {}: released more times than it was pinned",
            self.id
        );
        (previous - 1) & !EVICTING
    }

    /// Claim an unpinned frame for eviction. Later pins fail until the frame is gone.
    pub(crate) fn begin_eviction(&self) -> bool {
        self.pins
            .compare_exchange(0, EVICTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    /// # Safety
    /// The caller must hold the page latch (either mode) for the lifetime of the borrow.
    pub(crate) unsafe fn bytes(&self) -> &[u8; PAGE_SIZE] {
        &*self.data.get()
    }

    /// # Safety
    /// The caller must hold the page latch in write mode for the lifetime of the borrow.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self) -> &mut [u8; PAGE_SIZE] {
        &mut *self.data.get()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("pins", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_type_tags() {
        for ty in [PageType::Uninitialized, PageType::Slotted, PageType::Raw] {
            assert_eq!(PageType::from_tag(ty.tag()), ty);
        }
        assert_eq!(PageType::from_tag(77), PageType::Unknown(77));
    }

    #[test]
    fn test_pin_and_evict() {
        let page = Page::new_pinned(PageId(3));
        assert_eq!(page.pin_count(), 1);
        assert!(!page.begin_eviction());

        assert!(page.try_pin());
        assert_eq!(page.unpin(), 1);
        assert_eq!(page.unpin(), 0);

        assert!(page.begin_eviction());
        assert!(page.is_evicting());
        assert!(!page.try_pin());
    }

    #[test]
    #[should_panic(expected = "released more times")]
    fn test_unpin_underflow_panics() {
        let page = Page::new_pinned(PageId(0));
        page.unpin();
        page.unpin();
    }
}
