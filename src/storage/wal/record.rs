//! Log entry types.
//!
//! Entries are immutable once appended and are addressed only by their LSN.
//! Every entry carries the LSN of the same transaction's previous entry,
//! which threads the per-transaction undo chain; `LSN::INVALID` ends it.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::operation::OperationId;
use crate::storage::page::PageId;
use crate::transaction::TransactionId;

/// Log Sequence Number - a unique identifier for log entries.
/// LSNs are monotonically increasing and used to order log entries.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LSN(pub u64);

impl LSN {
    /// "No LSN": the end of an undo chain, or a page that was never logged.
    pub const INVALID: LSN = LSN(0);

    /// Get the next LSN.
    pub fn next(&self) -> Self {
        LSN(self.0 + 1)
    }

    /// Check if this is the invalid LSN (0).
    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }

    pub fn is_valid(&self) -> bool {
        !self.is_invalid()
    }
}

impl fmt::Display for LSN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

/// A physical/logical update to one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLog {
    pub page: PageId,
    pub op: OperationId,
    /// Opaque argument bytes, interpreted by the operation's redo and undo.
    pub arg: Vec<u8>,
}

/// Compensation log record: the undo of an earlier update.
///
/// CLRs are redone during recovery but never undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClrLog {
    /// LSN of the update this CLR compensates.
    pub compensated: LSN,
    /// Next entry to undo for this transaction (the compensated update's prevLSN).
    pub undo_next: LSN,
    /// The compensated update. `None` for a dummy CLR, which only rewinds the chain.
    pub update: Option<UpdateLog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogBody {
    Begin,
    Commit,
    Abort,
    Prepare,
    End,
    Update(UpdateLog),
    Clr(ClrLog),
}

impl LogBody {
    pub fn name(&self) -> &'static str {
        match self {
            LogBody::Begin => "Begin",
            LogBody::Commit => "Commit",
            LogBody::Abort => "Abort",
            LogBody::Prepare => "Prepare",
            LogBody::End => "End",
            LogBody::Update(_) => "Update",
            LogBody::Clr(_) => "Clr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Assigned by the log when the entry is appended.
    pub lsn: LSN,
    /// Previous entry of the same transaction.
    pub prev_lsn: LSN,
    pub xid: TransactionId,
    pub body: LogBody,
}

impl LogEntry {
    pub fn new(xid: TransactionId, prev_lsn: LSN, body: LogBody) -> Self {
        Self {
            lsn: LSN::INVALID,
            prev_lsn,
            xid,
            body,
        }
    }

    /// The page this entry touches, if any.
    pub fn page(&self) -> Option<PageId> {
        match &self.body {
            LogBody::Update(update) => Some(update.page),
            LogBody::Clr(ClrLog {
                update: Some(update),
                ..
            }) => Some(update.page),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn encoded_len(&self) -> Result<u64, bincode::Error> {
        bincode::serialized_size(self)
    }
}
