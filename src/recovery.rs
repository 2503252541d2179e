//! Crash recovery and log truncation.

pub mod aries;
pub mod truncation;

pub use aries::{AriesRecovery, RecoveryStats};
pub use truncation::{TruncationConfig, TruncationWorker, Truncator};
