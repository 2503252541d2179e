//! Clock-stamped LRU.
//!
//! Every candidate carries the value of a logical clock taken when it was
//! last touched; an ordered index over the stamps finds the stalest page in
//! O(log n).

use std::collections::{BTreeMap, HashMap};

use super::replacer::ReplacementPolicy;
use crate::storage::page::PageId;

#[derive(Debug, Default)]
struct LruEntry {
    pins: u32,
    /// Clock stamp while the page is a candidate.
    stamp: Option<u64>,
}

#[derive(Debug, Default)]
pub struct LruPolicy {
    clock: u64,
    entries: HashMap<PageId, LruEntry>,
    order: BTreeMap<u64, PageId>,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl ReplacementPolicy for LruPolicy {
    fn hit(&mut self, page: PageId) {
        let Some(old) = self.entries.get(&page).and_then(|entry| entry.stamp) else {
            return;
        };
        let stamp = self.tick();
        self.order.remove(&old);
        self.order.insert(stamp, page);
        if let Some(entry) = self.entries.get_mut(&page) {
            entry.stamp = Some(stamp);
        }
    }

    fn insert(&mut self, page: PageId) {
        let stamp = self.tick();
        let entry = self.entries.entry(page).or_default();
        entry.pins = entry.pins.saturating_sub(1);
        if entry.pins == 0 && entry.stamp.is_none() {
            entry.stamp = Some(stamp);
            self.order.insert(stamp, page);
        }
    }

    fn remove(&mut self, page: PageId) {
        let entry = self.entries.entry(page).or_default();
        if let Some(stamp) = entry.stamp.take() {
            self.order.remove(&stamp);
        }
        entry.pins += 1;
    }

    fn get_stale(&self) -> Option<PageId> {
        self.order.values().next().copied()
    }

    fn get_stale_and_remove(&mut self) -> Option<PageId> {
        let (_, page) = self.order.pop_first()?;
        self.entries.remove(&page);
        Some(page)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}
