//! Write-ahead logging.
//!
//! - **record**: LSNs and the log entry kinds
//! - **backend**: the `LogBackend` trait every log implements
//! - **file**: fsync'd, file-backed log (the durable default)
//! - **memory**: in-memory log for tests and benchmarks
//! - **group_force**: batches concurrent commit forces
//! - **manager**: prevLSN chaining, recLSN bookkeeping and force policy

pub mod backend;
pub mod file;
pub mod group_force;
pub mod manager;
pub mod memory;
pub mod record;

pub use backend::{ForceMode, LogBackend};
pub use file::FileLog;
pub use group_force::{GroupForce, GroupForceConfig};
pub use manager::{LogForce, LogIter, LogManager};
pub use memory::InMemoryLog;
pub use record::{ClrLog, LogBody, LogEntry, UpdateLog, LSN};
