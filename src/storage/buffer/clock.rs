//! CLOCK (second chance) replacement.
//!
//! Tracked pages sit in a ring of frames swept by a hand. A hit sets the
//! page's reference bit; the sweep clears set bits and evicts the first
//! unpinned page whose bit is already clear. Two turns of the ring are enough
//! to find a victim if one exists.

use std::collections::HashMap;

use super::replacer::ReplacementPolicy;
use crate::storage::page::PageId;

#[derive(Debug)]
struct ClockEntry {
    pins: u32,
    referenced: bool,
    frame: usize,
}

#[derive(Debug, Default)]
pub struct ClockPolicy {
    frames: Vec<Option<PageId>>,
    free: Vec<usize>,
    hand: usize,
    entries: HashMap<PageId, ClockEntry>,
    candidates: usize,
}

impl ClockPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&mut self, page: PageId, pins: u32) {
        let frame = match self.free.pop() {
            Some(frame) => {
                self.frames[frame] = Some(page);
                frame
            }
            None => {
                self.frames.push(Some(page));
                self.frames.len() - 1
            }
        };
        self.entries.insert(
            page,
            ClockEntry {
                pins,
                referenced: false,
                frame,
            },
        );
    }

    /// Frames in sweep order, starting at the hand.
    fn sweep_order(&self) -> impl Iterator<Item = usize> + '_ {
        let len = self.frames.len();
        (0..len).map(move |offset| (self.hand + offset) % len)
    }
}

impl ReplacementPolicy for ClockPolicy {
    fn hit(&mut self, page: PageId) {
        if let Some(entry) = self.entries.get_mut(&page) {
            entry.referenced = true;
        }
    }

    fn insert(&mut self, page: PageId) {
        match self.entries.get_mut(&page) {
            Some(entry) => {
                if entry.pins > 0 {
                    entry.pins -= 1;
                    if entry.pins == 0 {
                        self.candidates += 1;
                    }
                }
            }
            None => {
                self.track(page, 0);
                self.candidates += 1;
            }
        }
    }

    fn remove(&mut self, page: PageId) {
        match self.entries.get_mut(&page) {
            Some(entry) => {
                if entry.pins == 0 {
                    self.candidates -= 1;
                }
                entry.pins += 1;
            }
            None => self.track(page, 1),
        }
    }

    fn get_stale(&self) -> Option<PageId> {
        let mut first_candidate = None;
        for frame in self.sweep_order() {
            let Some(page) = self.frames[frame] else {
                continue;
            };
            let Some(entry) = self.entries.get(&page) else {
                continue;
            };
            if entry.pins > 0 {
                continue;
            }
            if !entry.referenced {
                return Some(page);
            }
            first_candidate.get_or_insert(page);
        }
        // Every candidate is referenced: a sweep would clear them all and come
        // back to the first.
        first_candidate
    }

    fn get_stale_and_remove(&mut self) -> Option<PageId> {
        let len = self.frames.len();
        if self.candidates == 0 || len == 0 {
            return None;
        }
        for _ in 0..2 * len {
            let frame = self.hand % len;
            self.hand = (frame + 1) % len;
            let Some(page) = self.frames[frame] else {
                continue;
            };
            let Some(entry) = self.entries.get_mut(&page) else {
                continue;
            };
            if entry.pins > 0 {
                continue;
            }
            if entry.referenced {
                entry.referenced = false;
                continue;
            }
            self.entries.remove(&page);
            self.frames[frame] = None;
            self.free.push(frame);
            self.candidates -= 1;
            return Some(page);
        }
        None
    }

    fn len(&self) -> usize {
        self.candidates
    }
}
