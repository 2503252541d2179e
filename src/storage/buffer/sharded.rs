//! Replacement policy sharded by page id.
//!
//! Page `p` belongs to bucket `p mod N`, each bucket an independent policy
//! core behind its own mutex. Victim selection starts at a random bucket and
//! walks the others with `try_lock`, skipping contended buckets; only if that
//! finds nothing does it lock every bucket (in index order) and look again.

use parking_lot::Mutex;
use rand::Rng;

use super::replacer::{ReplacementPolicy, SharedReplacementPolicy};
use crate::storage::page::PageId;

#[derive(Debug)]
pub struct ShardedPolicy<P> {
    buckets: Vec<Mutex<P>>,
}

impl<P: ReplacementPolicy> ShardedPolicy<P> {
    pub fn new(buckets: usize, mut make: impl FnMut() -> P) -> Self {
        let buckets = buckets.max(1);
        Self {
            buckets: (0..buckets).map(|_| Mutex::new(make())).collect(),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, page: PageId) -> &Mutex<P> {
        &self.buckets[(page.0 % self.buckets.len() as u64) as usize]
    }

    fn probe<R>(&self, mut f: impl FnMut(&mut P) -> Option<R>) -> Option<R> {
        let n = self.buckets.len();
        let start = rand::thread_rng().gen_range(0..n);

        for i in 0..n {
            if let Some(mut bucket) = self.buckets[(start + i) % n].try_lock() {
                if let Some(found) = f(&mut bucket) {
                    return Some(found);
                }
            }
        }

        let mut all: Vec<_> = self.buckets.iter().map(|bucket| bucket.lock()).collect();
        all.iter_mut().find_map(|bucket| f(bucket))
    }
}

impl<P: ReplacementPolicy> SharedReplacementPolicy for ShardedPolicy<P> {
    fn hit(&self, page: PageId) {
        self.bucket(page).lock().hit(page);
    }

    fn insert(&self, page: PageId) {
        self.bucket(page).lock().insert(page);
    }

    fn remove(&self, page: PageId) {
        self.bucket(page).lock().remove(page);
    }

    fn get_stale(&self) -> Option<PageId> {
        self.probe(|bucket| bucket.get_stale())
    }

    fn get_stale_and_remove(&self) -> Option<PageId> {
        self.probe(|bucket| bucket.get_stale_and_remove())
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }
}
