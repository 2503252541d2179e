//! Dirty page table.
//!
//! Maps each page with in-memory changes that have not reached disk to the
//! LSN of the update that first dirtied it (its recLSN). The minimum recLSN
//! is the lowest LSN the log may be truncated to.
//!
//! The table is split into lock-sharded maps so concurrent `set_dirty` and
//! `set_clean` calls on different pages do not contend. Each shard caches its
//! own minimum in an atomic, so `min_rec_lsn` reads no locks. A reader may see
//! a slightly stale minimum; that only makes truncation more conservative.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::buffer::BufferManager;
use crate::storage::page::PageId;
use crate::storage::wal::LSN;

const DPT_SHARDS: usize = 16;
const NO_MIN: u64 = u64::MAX;

#[derive(Default)]
struct Shard {
    pages: HashMap<PageId, LSN>,
    /// recLSN -> number of pages in this shard with that recLSN.
    by_lsn: BTreeMap<LSN, usize>,
}

impl Shard {
    fn min(&self) -> u64 {
        self.by_lsn.keys().next().map_or(NO_MIN, |lsn| lsn.0)
    }
}

pub struct DirtyPageTable {
    shards: Vec<Mutex<Shard>>,
    shard_min: Vec<AtomicU64>,
    count: AtomicUsize,
}

impl DirtyPageTable {
    pub fn new() -> Self {
        Self {
            shards: (0..DPT_SHARDS).map(|_| Mutex::new(Shard::default())).collect(),
            shard_min: (0..DPT_SHARDS).map(|_| AtomicU64::new(NO_MIN)).collect(),
            count: AtomicUsize::new(0),
        }
    }

    fn shard_index(page: PageId) -> usize {
        (page.0 % DPT_SHARDS as u64) as usize
    }

    /// Record that `page` was dirtied by the entry at `lsn`.
    ///
    /// No-op (returns false) if the page is already dirty: its recLSN stays
    /// the first dirtying update.
    pub fn set_dirty(&self, page: PageId, lsn: LSN) -> bool {
        let index = Self::shard_index(page);
        let mut shard = self.shards[index].lock();
        if shard.pages.contains_key(&page) {
            return false;
        }
        shard.pages.insert(page, lsn);
        *shard.by_lsn.entry(lsn).or_insert(0) += 1;
        self.shard_min[index].store(shard.min(), Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Forget `page`. Only the code that durably wrote the page back calls this.
    pub fn set_clean(&self, page: PageId) -> Option<LSN> {
        let index = Self::shard_index(page);
        let mut shard = self.shards[index].lock();
        let lsn = shard.pages.remove(&page)?;
        if let Some(count) = shard.by_lsn.get_mut(&lsn) {
            *count -= 1;
            if *count == 0 {
                shard.by_lsn.remove(&lsn);
            }
        }
        self.shard_min[index].store(shard.min(), Ordering::SeqCst);
        self.count.fetch_sub(1, Ordering::SeqCst);
        Some(lsn)
    }

    pub fn is_dirty(&self, page: PageId) -> bool {
        self.shards[Self::shard_index(page)]
            .lock()
            .pages
            .contains_key(&page)
    }

    pub fn rec_lsn(&self, page: PageId) -> Option<LSN> {
        self.shards[Self::shard_index(page)]
            .lock()
            .pages
            .get(&page)
            .copied()
    }

    pub fn dirty_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Lowest recLSN over all dirty pages; `None` when nothing is dirty.
    pub fn min_rec_lsn(&self) -> Option<LSN> {
        self.shard_min
            .iter()
            .map(|min| min.load(Ordering::SeqCst))
            .min()
            .filter(|&min| min != NO_MIN)
            .map(LSN)
    }

    /// Dirty pages with ids in `[start, stop)`, in ascending order.
    pub fn dirty_pages_in(&self, start: PageId, stop: PageId) -> Vec<PageId> {
        let mut pages: Vec<PageId> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .pages
                    .keys()
                    .filter(|&&page| page >= start && page < stop)
                    .copied()
                    .collect::<Vec<_>>()
            })
            .collect();
        pages.sort();
        pages
    }

    pub fn dirty_pages(&self) -> Vec<PageId> {
        self.dirty_pages_in(PageId(0), PageId(u64::MAX))
    }

    /// Write back every dirty page.
    pub fn flush(&self, buffers: &dyn BufferManager) -> Result<()> {
        for page in self.dirty_pages() {
            buffers.write_back_page(page)?;
        }
        Ok(())
    }

    /// Write back the dirty pages in `[start, stop)`.
    pub fn flush_range(&self, buffers: &dyn BufferManager, start: PageId, stop: PageId) -> Result<()> {
        for page in self.dirty_pages_in(start, stop) {
            buffers.write_back_page(page)?;
        }
        Ok(())
    }
}

impl Default for DirtyPageTable {
    fn default() -> Self {
        Self::new()
    }
}
