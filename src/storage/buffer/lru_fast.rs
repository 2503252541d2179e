//! O(1) LRU over an arena-backed doubly linked list.
//!
//! List nodes live in a `Vec` and link to each other by index; a side table
//! maps page ids to their node, so pages themselves carry no list state.

use std::collections::HashMap;

use super::replacer::ReplacementPolicy;
use crate::storage::page::PageId;

#[derive(Debug)]
struct Node {
    page: PageId,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
struct Slot {
    pins: u32,
    node: Option<usize>,
}

#[derive(Debug, Default)]
pub struct LruFastPolicy {
    nodes: Vec<Node>,
    free: Vec<usize>,
    /// Least recently used end.
    head: Option<usize>,
    /// Most recently used end.
    tail: Option<usize>,
    index: HashMap<PageId, Slot>,
    len: usize,
}

impl LruFastPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new node at the MRU end.
    fn push_back(&mut self, page: PageId) -> usize {
        let node = Node {
            page,
            prev: self.tail,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.nodes[index] = node;
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.attach_back(index);
        index
    }

    fn attach_back(&mut self, index: usize) {
        self.nodes[index].prev = self.tail;
        self.nodes[index].next = None;
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    fn detach(&mut self, index: usize) {
        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[index].prev = None;
        self.nodes[index].next = None;
        self.len -= 1;
    }

    fn release(&mut self, index: usize) {
        self.detach(index);
        self.free.push(index);
    }
}

impl ReplacementPolicy for LruFastPolicy {
    fn hit(&mut self, page: PageId) {
        if let Some(index) = self.index.get(&page).and_then(|slot| slot.node) {
            self.detach(index);
            self.attach_back(index);
        }
    }

    fn insert(&mut self, page: PageId) {
        let slot = self.index.entry(page).or_default();
        slot.pins = slot.pins.saturating_sub(1);
        if slot.pins == 0 && slot.node.is_none() {
            let index = self.push_back(page);
            if let Some(slot) = self.index.get_mut(&page) {
                slot.node = Some(index);
            }
        }
    }

    fn remove(&mut self, page: PageId) {
        let slot = self.index.entry(page).or_default();
        slot.pins += 1;
        if let Some(index) = slot.node.take() {
            self.release(index);
        }
    }

    fn get_stale(&self) -> Option<PageId> {
        self.head.map(|index| self.nodes[index].page)
    }

    fn get_stale_and_remove(&mut self) -> Option<PageId> {
        let index = self.head?;
        let page = self.nodes[index].page;
        self.release(index);
        self.index.remove(&page);
        Some(page)
    }

    fn len(&self) -> usize {
        self.len
    }
}
