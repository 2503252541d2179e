//! Replacement policy traits.
//!
//! A policy tracks which cached pages may be evicted and in what order. Pins
//! are reference counted inside the policy: `remove` adds one, `insert` takes
//! one away, and a page is only an eviction candidate while its count is
//! zero. Buffer managers call `remove` for every pin and `insert` for every
//! unpin, so a release racing with a concurrent pin lands in the same state
//! whichever call reaches the policy first.

use std::fmt::Debug;

use crate::storage::page::PageId;

/// Single-threaded policy core.
pub trait ReplacementPolicy: Send + Debug {
    /// Mark an eviction candidate as most recently used.
    fn hit(&mut self, page: PageId);

    /// Drop one reference; the page becomes a candidate when none remain.
    fn insert(&mut self, page: PageId);

    /// Add one reference, withdrawing the page from candidacy.
    fn remove(&mut self, page: PageId);

    /// Least recently used candidate, if any.
    fn get_stale(&self) -> Option<PageId>;

    /// Take the least recently used candidate out of the policy entirely.
    /// `None` means every tracked page is pinned.
    fn get_stale_and_remove(&mut self) -> Option<PageId>;

    /// Number of eviction candidates.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The same capability set, callable from many threads at once.
pub trait SharedReplacementPolicy: Send + Sync + Debug {
    fn hit(&self, page: PageId);
    fn insert(&self, page: PageId);
    fn remove(&self, page: PageId);
    fn get_stale(&self) -> Option<PageId>;
    fn get_stale_and_remove(&self) -> Option<PageId>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
