//! Fixed page trailer.
//!
//! The last [`TRAILER_SIZE`] bytes of every page hold its type tag and LSN at
//! offsets that do not depend on the page format:
//!
//! ```text
//! ... usable bytes ... | type tag: u32 LE | LSN: u64 LE |
//!                      ^ TYPE_OFFSET      ^ LSN_OFFSET
//! ```

use byteorder::{ByteOrder, LittleEndian};

use super::{PageType, PAGE_SIZE};
use crate::storage::wal::LSN;

pub const TRAILER_SIZE: usize = 12;
pub const TYPE_OFFSET: usize = PAGE_SIZE - TRAILER_SIZE;
pub const LSN_OFFSET: usize = PAGE_SIZE - 8;

pub fn read_lsn(page: &[u8; PAGE_SIZE]) -> LSN {
    LSN(LittleEndian::read_u64(&page[LSN_OFFSET..]))
}

pub fn write_lsn(page: &mut [u8; PAGE_SIZE], lsn: LSN) {
    LittleEndian::write_u64(&mut page[LSN_OFFSET..], lsn.0);
}

pub fn read_page_type(page: &[u8; PAGE_SIZE]) -> PageType {
    PageType::from_tag(LittleEndian::read_u32(&page[TYPE_OFFSET..LSN_OFFSET]))
}

pub fn write_page_type(page: &mut [u8; PAGE_SIZE], page_type: PageType) {
    LittleEndian::write_u32(&mut page[TYPE_OFFSET..LSN_OFFSET], page_type.tag());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_page_trailer() {
        let page = [0u8; PAGE_SIZE];
        assert_eq!(read_lsn(&page), LSN::INVALID);
        assert_eq!(read_page_type(&page), PageType::Uninitialized);
    }

    #[test]
    fn test_trailer_does_not_touch_usable_bytes() {
        let mut page = [0xAAu8; PAGE_SIZE];
        write_lsn(&mut page, LSN(0x0102_0304_0506_0708));
        write_page_type(&mut page, PageType::Slotted);

        assert!(page[..TYPE_OFFSET].iter().all(|&b| b == 0xAA));
        assert_eq!(read_lsn(&page), LSN(0x0102_0304_0506_0708));
        assert_eq!(read_page_type(&page), PageType::Slotted);
        assert_eq!(&page[LSN_OFFSET..], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }
}
