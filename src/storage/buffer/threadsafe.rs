//! One mutex around a policy core.

use parking_lot::Mutex;

use super::replacer::{ReplacementPolicy, SharedReplacementPolicy};
use crate::storage::page::PageId;

#[derive(Debug)]
pub struct ThreadsafePolicy<P> {
    inner: Mutex<P>,
}

impl<P: ReplacementPolicy> ThreadsafePolicy<P> {
    pub fn new(policy: P) -> Self {
        Self {
            inner: Mutex::new(policy),
        }
    }
}

impl<P: ReplacementPolicy> SharedReplacementPolicy for ThreadsafePolicy<P> {
    fn hit(&self, page: PageId) {
        self.inner.lock().hit(page);
    }

    fn insert(&self, page: PageId) {
        self.inner.lock().insert(page);
    }

    fn remove(&self, page: PageId) {
        self.inner.lock().remove(page);
    }

    fn get_stale(&self) -> Option<PageId> {
        self.inner.lock().get_stale()
    }

    fn get_stale_and_remove(&self) -> Option<PageId> {
        self.inner.lock().get_stale_and_remove()
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
