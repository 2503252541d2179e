//! Page handles: the only code that performs page file I/O.
//!
//! Buffer managers talk to a [`PageHandle`] and never to a file directly, so
//! the same manager runs over a real file ([`FilePageHandle`]) or over an
//! in-memory image ([`MemoryPageHandle`]).

pub mod memory;
pub mod page_handle;

pub use memory::MemoryPageHandle;
pub use page_handle::FilePageHandle;

use crate::storage::error::StorageResult;
use crate::storage::page::{PageId, PAGE_SIZE};

pub trait PageHandle: Send + Sync {
    /// Read a page image. Pages past the end of the store read back zero-filled.
    fn read(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()>;

    fn write(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()>;

    /// Make every completed write durable.
    fn force(&self) -> StorageResult<()>;

    /// Make writes to pages in `[start, stop)` durable.
    fn force_range(&self, start: PageId, stop: PageId) -> StorageResult<()>;

    /// Number of pages the store currently holds.
    fn num_pages(&self) -> StorageResult<u64>;

    fn close(&self) -> StorageResult<()>;
}
