//! ariesdb: a transactional page store with ARIES write-ahead logging.
//!
//! The engine is assembled in [`engine::EngineHandle`]: a write-ahead log
//! with group force, a buffer manager with pluggable replacement policies,
//! a dirty page table, a fixed-capacity transaction table, an allocation
//! policy, and redo/undo crash recovery.

pub mod concurrency;
pub mod engine;
pub mod error;
pub mod operation;
pub mod recovery;
pub mod storage;
pub mod transaction;

pub use engine::{EngineConfig, EngineHandle};
pub use error::{EngineError, Result};
