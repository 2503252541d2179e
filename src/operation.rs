//! Logged page operations.
//!
//! An operation is a pair of functions over one page: `redo` applies the
//! change described by a log argument, `undo` reverses it. The engine never
//! interprets arguments itself; it stores them in update entries, calls
//! `redo` on the forward path and during recovery, and calls `undo` when a
//! transaction rolls back. Arguments must carry enough to do both, since undo
//! runs long after the page state that produced them is gone.

pub mod slotted;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::storage::buffer::PageWriteGuard;
use crate::storage::page::PageId;

pub type OperationId = u16;

pub trait Operation: Send + Sync {
    fn id(&self) -> OperationId;

    fn name(&self) -> &'static str;

    /// Apply the change `arg` describes.
    fn redo(&self, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()>;

    /// Reverse the change `arg` describes.
    fn undo(&self, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()>;
}

/// Address of a record on a slotted page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub page: PageId,
    pub slot: u16,
    pub size: u16,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rid({}, slot {}, {} bytes)", self.page.0, self.slot, self.size)
    }
}

#[derive(Default)]
pub struct OperationRegistry {
    operations: HashMap<OperationId, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the slotted-page operations.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for operation in slotted::operations() {
            let registered = registry.register(operation);
            debug_assert!(registered.is_ok(), "built-in operation ids collide");
        }
        registry
    }

    pub fn register(&mut self, operation: Arc<dyn Operation>) -> Result<()> {
        let id = operation.id();
        if self.operations.contains_key(&id) {
            return Err(EngineError::DuplicateOperation(id));
        }
        self.operations.insert(id, operation);
        Ok(())
    }

    pub fn get(&self, id: OperationId) -> Result<&Arc<dyn Operation>> {
        self.operations
            .get(&id)
            .ok_or(EngineError::UnknownOperation(id))
    }

    pub fn redo(&self, id: OperationId, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()> {
        self.get(id)?.redo(page, arg)
    }

    pub fn undo(&self, id: OperationId, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()> {
        self.get(id)?.undo(page, arg)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self
            .operations
            .values()
            .map(|op| (op.id(), op.name()))
            .collect();
        names.sort_unstable();
        f.debug_struct("OperationRegistry")
            .field("operations", &names)
            .finish()
    }
}
