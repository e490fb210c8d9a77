//! Common types used throughout the storage engine.

mod page_number;
mod varint;

pub use page_number::PageNumber;
pub use varint::{decode_varint, put_varint, varint_size};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Size of the header at the start of every tree and overflow page
pub const PAGE_HEADER_SIZE: usize = 20;

/// Maximum key size, keeps at least two nodes in every page
pub const MAX_KEY_SIZE: usize = 512;

/// Values larger than this are moved to an overflow run
pub const MAX_INLINE_VALUE_SIZE: usize = 1024;

/// Monotonic transaction identifier. Writers take `last committed + 1`,
/// readers observe the last committed id.
pub type TransactionId = u64;

/// Kind of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionFlags {
    /// Snapshot reader; never blocks and is never blocked
    Read,
    /// The single writer
    ReadWrite,
}

/// Page kinds stored in the flags byte of the page header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFlags {
    /// Leaf page of a tree (keys + values or overflow references)
    Leaf = 0x01,
    /// Branch page of a tree (keys + child page references)
    Branch = 0x02,
    /// First page of an overflow run
    Overflow = 0x04,
}

impl PageFlags {
    /// Convert from byte value
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Leaf),
            0x02 => Some(Self::Branch),
            0x04 => Some(Self::Overflow),
            _ => None,
        }
    }
}

/// Number of pages an overflow run needs for a value of `len` bytes
pub fn overflow_pages_for(len: usize) -> u64 {
    (PAGE_HEADER_SIZE + len).div_ceil(PAGE_SIZE) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_flags_conversions() {
        assert_eq!(PageFlags::from_byte(0x01), Some(PageFlags::Leaf));
        assert_eq!(PageFlags::from_byte(0x02), Some(PageFlags::Branch));
        assert_eq!(PageFlags::from_byte(0x04), Some(PageFlags::Overflow));
        assert_eq!(PageFlags::from_byte(0xFF), None);
    }

    #[test]
    fn test_overflow_page_count() {
        assert_eq!(overflow_pages_for(1), 1);
        assert_eq!(overflow_pages_for(PAGE_SIZE - PAGE_HEADER_SIZE), 1);
        assert_eq!(overflow_pages_for(PAGE_SIZE - PAGE_HEADER_SIZE + 1), 2);
        // an 8KB value spills into a third page because of the header
        assert_eq!(overflow_pages_for(8192), 3);
    }
}
