//! Free-space bookkeeping for record allocation.
//!
//! Each transaction allocates from pages it already holds when it can, so
//! its records cluster together and concurrent transactions stay off each
//! other's pages. A page a transaction deallocated from stays reserved for
//! that transaction until it completes: undo has to be able to put the record
//! back, so nobody else may allocate into the hole.
//!
//! A page is *available* when no transaction holds it, and *owned* by `xid`
//! when `xid` is its only holder. Pages held by several transactions, or
//! alloced and dealloced by the same one, are neither until the holders
//! complete.

use std::collections::{BTreeSet, HashMap};

use log::warn;
use parking_lot::Mutex;

use crate::storage::page::PageId;
use crate::transaction::TransactionId;

#[derive(Debug, Default)]
struct Holders {
    alloced: BTreeSet<TransactionId>,
    dealloced: BTreeSet<TransactionId>,
}

impl Holders {
    fn is_empty(&self) -> bool {
        self.alloced.is_empty() && self.dealloced.is_empty()
    }

    fn owner(&self) -> Option<TransactionId> {
        let mut alloced = self.alloced.iter();
        let mut dealloced = self.dealloced.iter();
        match (alloced.next(), alloced.next(), dealloced.next(), dealloced.next()) {
            (Some(&xid), None, None, None) | (None, None, Some(&xid), None) => Some(xid),
            _ => None,
        }
    }

    fn count(&self) -> usize {
        self.alloced.union(&self.dealloced).count()
    }
}

#[derive(Debug, Default)]
struct AllocState {
    freespace: HashMap<PageId, usize>,
    holders: HashMap<PageId, Holders>,
    /// Pages with no holder, ordered for best fit.
    available: BTreeSet<(usize, PageId)>,
    /// Pages each transaction owns outright, ordered for best fit.
    owned: HashMap<TransactionId, BTreeSet<(usize, PageId)>>,
    /// Every page a transaction holds in any way.
    held_by: HashMap<TransactionId, BTreeSet<PageId>>,
}

impl AllocState {
    fn best_fit(pages: &BTreeSet<(usize, PageId)>, min_freespace: usize) -> Option<PageId> {
        pages
            .range((min_freespace, PageId(0))..)
            .next()
            .map(|&(_, page)| page)
    }

    fn detach(&mut self, page: PageId, freespace: usize) {
        self.available.remove(&(freespace, page));
        for owned in self.owned.values_mut() {
            owned.remove(&(freespace, page));
        }
    }

    /// Recompute which view `page` belongs to.
    fn refresh(&mut self, page: PageId) {
        let freespace = *self.freespace.entry(page).or_insert(0);
        self.detach(page, freespace);

        let (idle, owner) = match self.holders.get(&page) {
            None => (true, None),
            Some(holders) => (holders.is_empty(), holders.owner()),
        };
        if idle {
            self.holders.remove(&page);
            self.available.insert((freespace, page));
        } else if let Some(owner) = owner {
            self.owned.entry(owner).or_default().insert((freespace, page));
        }
    }

    fn can_alloc(&self, xid: TransactionId, page: PageId) -> bool {
        self.holders
            .get(&page)
            .map_or(true, |holders| holders.dealloced.iter().all(|&other| other == xid))
    }

    fn hold(&mut self, xid: TransactionId, page: PageId, dealloc: bool) {
        let holders = self.holders.entry(page).or_default();
        if dealloc {
            holders.dealloced.insert(xid);
        } else {
            holders.alloced.insert(xid);
        }
        self.held_by.entry(xid).or_default().insert(page);
        self.refresh(page);
    }

    fn set_freespace(&mut self, page: PageId, freespace: usize) {
        let old = self.freespace.insert(page, freespace).unwrap_or(0);
        self.detach(page, old);
        self.refresh(page);
    }
}

#[derive(Debug, Default)]
pub struct AllocationPolicy {
    state: Mutex<AllocState>,
}

impl AllocationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `page` as an allocation target. Re-registering updates its free space.
    pub fn add_page(&self, page: PageId, freespace: usize) {
        self.state.lock().set_freespace(page, freespace);
    }

    /// A page with at least `min_freespace` bytes free that `xid` may allocate
    /// from: the tightest fit among the pages it owns, else the tightest fit
    /// among available pages.
    pub fn find_page(&self, xid: TransactionId, min_freespace: usize) -> Option<PageId> {
        let state = self.state.lock();
        state
            .owned
            .get(&xid)
            .and_then(|owned| AllocState::best_fit(owned, min_freespace))
            .or_else(|| AllocState::best_fit(&state.available, min_freespace))
    }

    /// Take an allocation hold on `page` for `xid`.
    ///
    /// Refused while another transaction holds a deallocation on the page.
    pub fn lock_page(&self, xid: TransactionId, page: PageId) -> bool {
        let mut state = self.state.lock();
        if !state.can_alloc(xid, page) {
            return false;
        }
        state.hold(xid, page, false);
        true
    }

    /// Record that `xid` allocated a record on `page`.
    pub fn alloced_from_page(&self, xid: TransactionId, page: PageId) -> bool {
        let locked = self.lock_page(xid, page);
        if !locked {
            warn!(
                "{} refused allocation on {}: another transaction deallocated from it",
                xid, page
            );
        }
        locked
    }

    /// Record that `xid` freed a record on `page`; the page stays reserved until `xid` completes.
    pub fn dealloced_from_page(&self, xid: TransactionId, page: PageId) {
        self.state.lock().hold(xid, page, true);
    }

    /// Drop every hold of `xid`, whether it committed or aborted.
    pub fn transaction_completed(&self, xid: TransactionId) {
        let mut state = self.state.lock();
        state.owned.remove(&xid);
        let pages = state.held_by.remove(&xid).unwrap_or_default();
        for page in pages {
            if let Some(holders) = state.holders.get_mut(&page) {
                holders.alloced.remove(&xid);
                holders.dealloced.remove(&xid);
            }
            state.refresh(page);
        }
    }

    /// Update the free space of a page `xid` holds.
    pub fn update_freespace_locked(&self, xid: TransactionId, page: PageId, freespace: usize) {
        let mut state = self.state.lock();
        debug_assert!(
            state.held_by.get(&xid).is_some_and(|pages| pages.contains(&page)),
            "{} updated free space of {} without holding it",
            xid,
            page
        );
        state.set_freespace(page, freespace);
    }

    /// Update the free space of a page no transaction holds.
    pub fn update_freespace_unlocked(&self, page: PageId, freespace: usize) {
        let mut state = self.state.lock();
        debug_assert!(
            state.holders.get(&page).map_or(true, Holders::is_empty),
            "{} is held; use update_freespace_locked",
            page
        );
        state.set_freespace(page, freespace);
    }

    pub fn freespace(&self, page: PageId) -> Option<usize> {
        self.state.lock().freespace.get(&page).copied()
    }

    pub fn is_locked(&self, page: PageId) -> bool {
        self.lock_count(page) > 0
    }

    /// Number of transactions holding `page`.
    pub fn lock_count(&self, page: PageId) -> usize {
        self.state.lock().holders.get(&page).map_or(0, Holders::count)
    }

    pub fn can_alloc_from_page(&self, xid: TransactionId, page: PageId) -> bool {
        self.state.lock().can_alloc(xid, page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: TransactionId = TransactionId(1);
    const T2: TransactionId = TransactionId(2);

    fn policy() -> AllocationPolicy {
        let policy = AllocationPolicy::new();
        policy.add_page(PageId(1), 100);
        policy.add_page(PageId(2), 400);
        policy.add_page(PageId(3), 250);
        policy
    }

    #[test]
    fn test_best_fit_among_available() {
        let policy = policy();
        assert_eq!(policy.find_page(T1, 50), Some(PageId(1)));
        assert_eq!(policy.find_page(T1, 200), Some(PageId(3)));
        assert_eq!(policy.find_page(T1, 300), Some(PageId(2)));
        assert_eq!(policy.find_page(T1, 401), None);
    }

    #[test]
    fn test_own_pages_come_first() {
        let policy = policy();
        assert!(policy.alloced_from_page(T1, PageId(2)));
        policy.update_freespace_locked(T1, PageId(2), 380);

        // T1 keeps filling its own page even though page 1 is a tighter fit.
        assert_eq!(policy.find_page(T1, 50), Some(PageId(2)));
        // Others do not see it.
        assert_eq!(policy.find_page(T2, 300), None);
        assert_eq!(policy.find_page(T2, 50), Some(PageId(1)));
        assert!(policy.is_locked(PageId(2)));
        assert_eq!(policy.lock_count(PageId(2)), 1);
    }

    #[test]
    fn test_completion_readmits_pages() {
        let policy = policy();
        assert!(policy.lock_page(T1, PageId(2)));
        policy.update_freespace_locked(T1, PageId(2), 10);
        policy.transaction_completed(T1);

        assert!(!policy.is_locked(PageId(2)));
        assert_eq!(policy.freespace(PageId(2)), Some(10));
        assert_eq!(policy.find_page(T2, 300), None);
        assert_eq!(policy.find_page(T2, 5), Some(PageId(2)));
    }

    #[test]
    fn test_dealloc_reserves_the_page() {
        let policy = policy();
        policy.dealloced_from_page(T1, PageId(3));

        assert!(!policy.can_alloc_from_page(T2, PageId(3)));
        assert!(!policy.alloced_from_page(T2, PageId(3)));
        assert!(policy.can_alloc_from_page(T1, PageId(3)));
        assert_eq!(policy.find_page(T2, 200), Some(PageId(2)));

        policy.transaction_completed(T1);
        assert!(policy.alloced_from_page(T2, PageId(3)));
    }

    #[test]
    fn test_shared_page_is_nobodys() {
        let policy = policy();
        assert!(policy.lock_page(T1, PageId(1)));
        assert!(policy.lock_page(T2, PageId(1)));
        assert_eq!(policy.lock_count(PageId(1)), 2);
        assert_eq!(policy.find_page(T1, 50), Some(PageId(3)));

        policy.transaction_completed(T2);
        assert_eq!(policy.find_page(T1, 50), Some(PageId(1)));
        policy.transaction_completed(T1);
        assert_eq!(policy.lock_count(PageId(1)), 0);
    }

    #[test]
    fn test_freespace_updates_move_pages() {
        let policy = policy();
        policy.update_freespace_unlocked(PageId(1), 1000);
        assert_eq!(policy.find_page(T1, 500), Some(PageId(1)));
        policy.add_page(PageId(1), 0);
        assert_eq!(policy.find_page(T1, 500), None);
        assert_eq!(policy.freespace(PageId(9)), None);
    }
}
