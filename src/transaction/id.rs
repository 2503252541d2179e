//! Transaction identifiers.

use serde::{Deserialize, Serialize};

/// A unique identifier for a transaction.
///
/// Ids are handed out by the transaction table and never reused, including
/// across restarts: recovery bumps the counter past every id found in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Id used for log entries and page loads that belong to no transaction.
    pub const NONE: TransactionId = TransactionId(0);

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Txn{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_display() {
        assert_eq!(format!("{}", TransactionId(42)), "Txn42");
        assert_eq!(TransactionId(7).value(), 7);
        assert!(TransactionId(1) > TransactionId::NONE);
    }
}
