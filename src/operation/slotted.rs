//! Slotted record pages and the operations that modify them.
//!
//! Layout of the usable bytes (everything in front of the page trailer):
//!
//! ```text
//! | slot_count: u16 | free_start: u16 | records ... -> free <- ... | slot n-1 | ... | slot 0 |
//! ```
//!
//! Record bytes grow up from the header; the slot directory grows down from
//! the end. A slot is `offset: u16, len: u16, flags: u16`. Records never
//! move and slot numbers are never reused, so undo can always put a record
//! back where it was.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Operation, OperationId, RecordId};
use crate::error::{EngineError, Result};
use crate::storage::buffer::PageWriteGuard;
use crate::storage::page::{PageType, USABLE_PAGE_SIZE};

pub const PAGE_INIT: OperationId = 1;
pub const ALLOC: OperationId = 2;
pub const SET: OperationId = 3;
pub const DEALLOC: OperationId = 4;
pub const SET_RANGE: OperationId = 5;

const SLOT_COUNT_OFFSET: usize = 0;
const FREE_START_OFFSET: usize = 2;
pub const HEADER_SIZE: usize = 4;
pub const SLOT_SIZE: usize = 6;

const SLOT_USED: u16 = 1;

/// Largest record a freshly initialized page can hold.
pub const MAX_RECORD_SIZE: usize = USABLE_PAGE_SIZE - HEADER_SIZE - SLOT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    offset: u16,
    len: u16,
    used: bool,
}

/// View over the usable bytes of a slotted page.
pub struct SlottedPage<B> {
    bytes: B,
}

impl<B: AsRef<[u8]>> SlottedPage<B> {
    pub fn new(bytes: B) -> Self {
        Self { bytes }
    }

    fn read_u16(&self, offset: usize) -> u16 {
        LittleEndian::read_u16(&self.bytes.as_ref()[offset..offset + 2])
    }

    pub fn slot_count(&self) -> u16 {
        self.read_u16(SLOT_COUNT_OFFSET)
    }

    fn free_start(&self) -> u16 {
        self.read_u16(FREE_START_OFFSET)
    }

    fn slot_offset(slot: u16) -> usize {
        USABLE_PAGE_SIZE - (slot as usize + 1) * SLOT_SIZE
    }

    fn directory_start(&self) -> usize {
        USABLE_PAGE_SIZE - self.slot_count() as usize * SLOT_SIZE
    }

    fn slot(&self, slot: u16) -> Option<Slot> {
        if slot >= self.slot_count() {
            return None;
        }
        let at = Self::slot_offset(slot);
        Some(Slot {
            offset: self.read_u16(at),
            len: self.read_u16(at + 2),
            used: self.read_u16(at + 4) & SLOT_USED != 0,
        })
    }

    /// Largest record that still fits, counting its new slot entry.
    pub fn free_space(&self) -> usize {
        self.directory_start()
            .saturating_sub(self.free_start() as usize)
            .saturating_sub(SLOT_SIZE)
    }

    pub fn is_used(&self, slot: u16) -> bool {
        self.slot(slot).is_some_and(|slot| slot.used)
    }

    pub fn record(&self, slot: u16) -> Option<&[u8]> {
        let slot = self.slot(slot).filter(|slot| slot.used)?;
        let start = slot.offset as usize;
        Some(&self.bytes.as_ref()[start..start + slot.len as usize])
    }

    /// Where a record of `size` bytes would go, if it fits.
    pub fn plan_alloc(&self, size: u16) -> Option<AllocArg> {
        (self.free_space() >= size as usize).then(|| AllocArg {
            slot: self.slot_count(),
            offset: self.free_start(),
            size,
        })
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedPage<B> {
    fn write_u16(&mut self, offset: usize, value: u16) {
        LittleEndian::write_u16(&mut self.bytes.as_mut()[offset..offset + 2], value);
    }

    /// Format an empty page.
    pub fn init(&mut self) {
        self.bytes.as_mut()[..USABLE_PAGE_SIZE].fill(0);
        self.write_u16(SLOT_COUNT_OFFSET, 0);
        self.write_u16(FREE_START_OFFSET, HEADER_SIZE as u16);
    }

    fn set_slot(&mut self, slot: u16, entry: Slot) {
        if slot >= self.slot_count() {
            self.write_u16(SLOT_COUNT_OFFSET, slot + 1);
        }
        let at = Self::slot_offset(slot);
        self.write_u16(at, entry.offset);
        self.write_u16(at + 2, entry.len);
        self.write_u16(at + 4, if entry.used { SLOT_USED } else { 0 });
    }

    fn fill(&mut self, offset: u16, data: &[u8]) {
        let start = offset as usize;
        self.bytes.as_mut()[start..start + data.len()].copy_from_slice(data);
    }

    fn zero(&mut self, offset: u16, len: u16) {
        let start = offset as usize;
        self.bytes.as_mut()[start..start + len as usize].fill(0);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocArg {
    pub slot: u16,
    pub offset: u16,
    pub size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetArg {
    pub slot: u16,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeallocArg {
    pub slot: u16,
    pub offset: u16,
    pub old: Vec<u8>,
}

/// Byte-range overwrite of any page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRangeArg {
    pub offset: u16,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

pub fn encode<T: Serialize>(arg: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(arg)?)
}

fn decode<T: DeserializeOwned>(arg: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(arg)?)
}

/// Argument for overwriting the record `rid` with `new`, read under the page latch.
pub fn set_arg(page: &[u8], rid: RecordId, new: &[u8]) -> Result<SetArg> {
    let view = SlottedPage::new(page);
    let old = view
        .record(rid.slot)
        .ok_or_else(|| invalid(rid, "no such record"))?;
    if old.len() != new.len() {
        return Err(invalid(
            rid,
            &format!("record holds {} bytes, got {}", old.len(), new.len()),
        ));
    }
    Ok(SetArg {
        slot: rid.slot,
        old: old.to_vec(),
        new: new.to_vec(),
    })
}

/// Argument for freeing the record `rid`, read under the page latch.
pub fn dealloc_arg(page: &[u8], rid: RecordId) -> Result<DeallocArg> {
    let view = SlottedPage::new(page);
    let slot = view
        .slot(rid.slot)
        .filter(|slot| slot.used)
        .ok_or_else(|| invalid(rid, "no such record"))?;
    Ok(DeallocArg {
        slot: rid.slot,
        offset: slot.offset,
        old: view.record(rid.slot).unwrap_or_default().to_vec(),
    })
}

/// Argument for overwriting `new.len()` bytes at `offset`.
pub fn set_range_arg(page: &[u8], offset: usize, new: &[u8]) -> Result<SetRangeArg> {
    let end = offset + new.len();
    if end > USABLE_PAGE_SIZE {
        return Err(EngineError::InvalidArgument(format!(
            "range {}..{} is past the usable page",
            offset, end
        )));
    }
    Ok(SetRangeArg {
        offset: offset as u16,
        old: page[offset..end].to_vec(),
        new: new.to_vec(),
    })
}

fn invalid(rid: RecordId, reason: &str) -> EngineError {
    EngineError::InvalidRecord {
        rid,
        reason: reason.to_string(),
    }
}

fn expect_slotted(page: &PageWriteGuard<'_>) -> Result<()> {
    match page.page_type() {
        PageType::Slotted => Ok(()),
        actual => Err(EngineError::PageTypeMismatch {
            page: page.page_id(),
            expected: PageType::Slotted,
            actual,
        }),
    }
}

fn rid(page: &PageWriteGuard<'_>, slot: u16, size: usize) -> RecordId {
    RecordId {
        page: page.page_id(),
        slot,
        size: size as u16,
    }
}

pub struct PageInit;

impl Operation for PageInit {
    fn id(&self) -> OperationId {
        PAGE_INIT
    }

    fn name(&self) -> &'static str {
        "page_init"
    }

    fn redo(&self, page: &mut PageWriteGuard<'_>, _arg: &[u8]) -> Result<()> {
        SlottedPage::new(&mut **page).init();
        page.set_page_type(PageType::Slotted);
        Ok(())
    }

    /// Formatting is not rolled back; an empty slotted page is harmless.
    fn undo(&self, _page: &mut PageWriteGuard<'_>, _arg: &[u8]) -> Result<()> {
        Ok(())
    }
}

pub struct Alloc;

impl Operation for Alloc {
    fn id(&self) -> OperationId {
        ALLOC
    }

    fn name(&self) -> &'static str {
        "alloc"
    }

    fn redo(&self, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()> {
        expect_slotted(page)?;
        let arg: AllocArg = decode(arg)?;
        let end = arg.offset as usize + arg.size as usize;
        let view = SlottedPage::new(&**page);
        let slots = arg.slot.max(view.slot_count()) as usize + 1;
        if arg.offset < view.free_start() || end > USABLE_PAGE_SIZE - slots * SLOT_SIZE {
            return Err(invalid(
                rid(page, arg.slot, arg.size as usize),
                "does not fit in the free region",
            ));
        }
        let mut view = SlottedPage::new(&mut **page);
        view.set_slot(
            arg.slot,
            Slot {
                offset: arg.offset,
                len: arg.size,
                used: true,
            },
        );
        view.write_u16(FREE_START_OFFSET, end as u16);
        view.zero(arg.offset, arg.size);
        Ok(())
    }

    fn undo(&self, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()> {
        expect_slotted(page)?;
        let arg: AllocArg = decode(arg)?;
        let mut view = SlottedPage::new(&mut **page);
        view.zero(arg.offset, arg.size);
        view.set_slot(
            arg.slot,
            Slot {
                offset: arg.offset,
                len: arg.size,
                used: false,
            },
        );
        // Reclaim the space and the slot when nothing was allocated after it.
        if arg.offset + arg.size == view.free_start() {
            view.write_u16(FREE_START_OFFSET, arg.offset);
        }
        if arg.slot + 1 == view.slot_count() {
            view.set_slot(arg.slot, Slot { offset: 0, len: 0, used: false });
            view.write_u16(SLOT_COUNT_OFFSET, arg.slot);
        }
        Ok(())
    }
}

pub struct Set;

impl Operation for Set {
    fn id(&self) -> OperationId {
        SET
    }

    fn name(&self) -> &'static str {
        "set"
    }

    fn redo(&self, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()> {
        let arg: SetArg = decode(arg)?;
        write_record(page, arg.slot, &arg.new)
    }

    fn undo(&self, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()> {
        let arg: SetArg = decode(arg)?;
        write_record(page, arg.slot, &arg.old)
    }
}

fn write_record(page: &mut PageWriteGuard<'_>, slot: u16, data: &[u8]) -> Result<()> {
    expect_slotted(page)?;
    let rid = rid(page, slot, data.len());
    let mut view = SlottedPage::new(&mut **page);
    match view.slot(slot) {
        Some(entry) if entry.used && entry.len as usize == data.len() => {
            view.fill(entry.offset, data);
            Ok(())
        }
        Some(entry) if entry.used => Err(invalid(rid, "size mismatch")),
        _ => Err(invalid(rid, "no such record")),
    }
}

pub struct Dealloc;

impl Operation for Dealloc {
    fn id(&self) -> OperationId {
        DEALLOC
    }

    fn name(&self) -> &'static str {
        "dealloc"
    }

    fn redo(&self, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()> {
        expect_slotted(page)?;
        let arg: DeallocArg = decode(arg)?;
        let rid = rid(page, arg.slot, arg.old.len());
        let mut view = SlottedPage::new(&mut **page);
        if !view.is_used(arg.slot) {
            return Err(invalid(rid, "no such record"));
        }
        let len = arg.old.len() as u16;
        view.zero(arg.offset, len);
        view.set_slot(
            arg.slot,
            Slot {
                offset: arg.offset,
                len,
                used: false,
            },
        );
        Ok(())
    }

    fn undo(&self, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()> {
        expect_slotted(page)?;
        let arg: DeallocArg = decode(arg)?;
        let mut view = SlottedPage::new(&mut **page);
        view.set_slot(
            arg.slot,
            Slot {
                offset: arg.offset,
                len: arg.old.len() as u16,
                used: true,
            },
        );
        view.fill(arg.offset, &arg.old);
        Ok(())
    }
}

pub struct SetRange;

impl SetRange {
    fn apply(page: &mut PageWriteGuard<'_>, offset: u16, data: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if end > USABLE_PAGE_SIZE {
            return Err(EngineError::InvalidArgument(format!(
                "range {}..{} is past the usable page",
                start, end
            )));
        }
        page[start..end].copy_from_slice(data);
        Ok(())
    }
}

impl Operation for SetRange {
    fn id(&self) -> OperationId {
        SET_RANGE
    }

    fn name(&self) -> &'static str {
        "set_range"
    }

    fn redo(&self, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()> {
        let arg: SetRangeArg = decode(arg)?;
        Self::apply(page, arg.offset, &arg.new)
    }

    fn undo(&self, page: &mut PageWriteGuard<'_>, arg: &[u8]) -> Result<()> {
        let arg: SetRangeArg = decode(arg)?;
        Self::apply(page, arg.offset, &arg.old)
    }
}

pub fn operations() -> Vec<Arc<dyn Operation>> {
    vec![
        Arc::new(PageInit),
        Arc::new(Alloc),
        Arc::new(Set),
        Arc::new(Dealloc),
        Arc::new(SetRange),
    ]
}
