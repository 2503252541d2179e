//! Transaction states.

/// Lifecycle of a transaction table entry.
///
/// `Active` → (`Prepared`) → `Committed` | `Aborting` → `Aborted`, after which
/// the End entry is logged and the slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    /// Prepare entry is durable; the outcome is up to the caller, even after a crash.
    Prepared,
    Committed,
    /// Undo is running.
    Aborting,
    Aborted,
}

impl TransactionState {
    /// Returns true if the transaction may still log updates.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns true once the outcome is decided.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Returns true if commit or abort may be requested.
    pub fn can_finish(&self) -> bool {
        matches!(self, Self::Active | Self::Prepared)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Prepared => write!(f, "Prepared"),
            Self::Committed => write!(f, "Committed"),
            Self::Aborting => write!(f, "Aborting"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(TransactionState::Active.is_active());
        assert!(TransactionState::Active.can_finish());
        assert!(TransactionState::Prepared.can_finish());
        assert!(!TransactionState::Prepared.is_active());
        assert!(!TransactionState::Aborting.can_finish());
        assert!(TransactionState::Committed.is_finished());
        assert!(TransactionState::Aborted.is_finished());
        assert_eq!(TransactionState::Prepared.to_string(), "Prepared");
    }
}
