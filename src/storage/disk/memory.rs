use std::collections::HashMap;

use parking_lot::Mutex;

use super::PageHandle;
use crate::storage::error::StorageResult;
use crate::storage::page::{PageId, PAGE_SIZE};

/// Page store kept entirely in memory.
///
/// Shared through an `Arc`, it outlives a buffer manager that was dropped
/// without flushing, which makes it a stand-in for a disk in crash tests.
#[derive(Default)]
pub struct MemoryPageHandle {
    pages: Mutex<HashMap<PageId, Box<[u8; PAGE_SIZE]>>>,
}

impl MemoryPageHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.pages.lock().contains_key(&page_id)
    }
}

impl PageHandle for MemoryPageHandle {
    fn read(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        match self.pages.lock().get(&page_id) {
            Some(page) => buf.copy_from_slice(page.as_ref()),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        self.pages.lock().insert(page_id, Box::new(*data));
        Ok(())
    }

    fn force(&self) -> StorageResult<()> {
        Ok(())
    }

    fn force_range(&self, _start: PageId, _stop: PageId) -> StorageResult<()> {
        Ok(())
    }

    fn num_pages(&self) -> StorageResult<u64> {
        Ok(self
            .pages
            .lock()
            .keys()
            .map(|id| id.0 + 1)
            .max()
            .unwrap_or(0))
    }

    fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_pages_read_zero() {
        let handle = MemoryPageHandle::new();
        let mut buf = [3u8; PAGE_SIZE];
        handle.read(PageId(5), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(handle.num_pages().unwrap(), 0);
    }

    #[test]
    fn test_write_then_read() {
        let handle = MemoryPageHandle::new();
        let mut page = [0u8; PAGE_SIZE];
        page[10] = 1;
        handle.write(PageId(4), &page).unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        handle.read(PageId(4), &mut buf).unwrap();
        assert_eq!(buf[10], 1);
        assert!(handle.contains(PageId(4)));
        assert_eq!(handle.num_pages().unwrap(), 5);
    }
}
