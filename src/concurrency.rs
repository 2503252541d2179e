//! Concurrency primitives shared by the storage engine.
//!
//! - **Latch**: short-duration reader/writer lock with writer preference that
//!   protects every in-memory page

pub mod latch;

pub use latch::Latch;
