//! Page header structure.
//!
//! The page header occupies the first bytes of every tree and overflow page.

use crate::types::{PageFlags, PageNumber, PAGE_HEADER_SIZE, PAGE_SIZE};

/// Page header structure
///
/// Layout (20 bytes, big-endian):
/// ```text
/// Offset  Size  Description
/// 0       8     Page number
/// 8       1     Page flags (leaf / branch / overflow)
/// 9       1     Reserved
/// 10      2     Number of nodes on this page
/// 12      2     Lower: end of the node offset array
/// 14      2     Upper: start of the node body area
/// 16      4     Overflow size (value length, overflow pages only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Number of the page this header belongs to
    pub page_number: PageNumber,
    /// Raw flags byte, see [`PageFlags`]
    pub flags: u8,
    /// Number of nodes on this page
    pub item_count: u16,
    /// Offset just past the node offset array
    pub lower: u16,
    /// Offset of the lowest node body
    pub upper: u16,
    /// Length of the value stored in an overflow run
    pub overflow_size: u32,
}

impl PageHeader {
    /// Header for an empty leaf or branch page
    pub fn new_tree_page(page_number: PageNumber, flags: PageFlags) -> Self {
        Self {
            page_number,
            flags: flags as u8,
            item_count: 0,
            lower: PAGE_HEADER_SIZE as u16,
            upper: PAGE_SIZE as u16,
            overflow_size: 0,
        }
    }

    /// Header for the first page of an overflow run holding `size` bytes
    pub fn new_overflow(page_number: PageNumber, size: u32) -> Self {
        Self {
            page_number,
            flags: PageFlags::Overflow as u8,
            item_count: 0,
            lower: PAGE_HEADER_SIZE as u16,
            upper: PAGE_SIZE as u16,
            overflow_size: size,
        }
    }

    /// Decoded page kind, if the flags byte is a known one
    pub fn kind(&self) -> Option<PageFlags> {
        PageFlags::from_byte(self.flags)
    }

    /// Read a page header from bytes
    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return None;
        }

        let page_number = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
        let item_count = u16::from_be_bytes([bytes[10], bytes[11]]);
        let lower = u16::from_be_bytes([bytes[12], bytes[13]]);
        let upper = u16::from_be_bytes([bytes[14], bytes[15]]);
        let overflow_size = u32::from_be_bytes(bytes[16..20].try_into().ok()?);

        Some(Self {
            page_number: PageNumber::new(page_number),
            flags: bytes[8],
            item_count,
            lower,
            upper,
            overflow_size,
        })
    }

    /// Write this header to bytes
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..8].copy_from_slice(&self.page_number.value().to_be_bytes());
        bytes[8] = self.flags;
        bytes[9] = 0;
        bytes[10..12].copy_from_slice(&self.item_count.to_be_bytes());
        bytes[12..14].copy_from_slice(&self.lower.to_be_bytes());
        bytes[14..16].copy_from_slice(&self.upper.to_be_bytes());
        bytes[16..20].copy_from_slice(&self.overflow_size.to_be_bytes());
    }

    /// Contiguous free space between the offset array and the node bodies
    pub fn free_space(&self) -> usize {
        (self.upper as usize).saturating_sub(self.lower as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PageHeader {
            page_number: PageNumber::new(77),
            flags: PageFlags::Branch as u8,
            item_count: 5,
            lower: 30,
            upper: 3500,
            overflow_size: 0,
        };

        let mut bytes = [0u8; PAGE_HEADER_SIZE];
        header.write(&mut bytes);

        let read = PageHeader::read(&bytes).unwrap();
        assert_eq!(read, header);
        assert_eq!(read.kind(), Some(PageFlags::Branch));
    }

    #[test]
    fn test_overflow_header() {
        let header = PageHeader::new_overflow(PageNumber::new(9), 8192);
        let mut bytes = [0u8; PAGE_HEADER_SIZE];
        header.write(&mut bytes);

        let read = PageHeader::read(&bytes).unwrap();
        assert_eq!(read.kind(), Some(PageFlags::Overflow));
        assert_eq!(read.overflow_size, 8192);
    }

    #[test]
    fn test_free_space() {
        let header = PageHeader::new_tree_page(PageNumber::new(2), PageFlags::Leaf);
        assert_eq!(header.free_space(), PAGE_SIZE - PAGE_HEADER_SIZE);
        assert!(PageHeader::read(&[0u8; 4]).is_none());
    }
}
