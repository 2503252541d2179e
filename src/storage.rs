//! Storage layer: pages, the page cache, the write-ahead log.
//!
//! - **Page**: fixed-size (8KB) frame with a trailer holding its type and LSN
//! - **PageHandle**: page file I/O, on disk or in memory
//! - **BufferManager**: pins, latches and evicts cached pages
//! - **Wal**: log entries, log backends, group force
//! - **DirtyPageTable**: recLSN of every page not yet written back
//! - **AllocationPolicy**: which pages have room for new records
//!
//! Eviction ties these together: a dirty page is written back only after the
//! log is forced through its LSN.

pub mod allocation;
pub mod buffer;
pub mod dirty_page_table;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use allocation::AllocationPolicy;
pub use buffer::{BufferManager, PageReadGuard, PageRef, PageWriteGuard};
pub use dirty_page_table::DirtyPageTable;
pub use disk::{FilePageHandle, MemoryPageHandle, PageHandle};
pub use error::{StorageError, StorageResult};
pub use page::{PageId, PageType, PAGE_SIZE, USABLE_PAGE_SIZE};
pub use wal::{LogManager, LSN};
