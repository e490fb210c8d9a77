//! Per-tree summary state.

use crate::error::{Result, StorageError};
use crate::types::PageNumber;
use serde::{Deserialize, Serialize};

/// Encoded size of a [`TreeState`]
pub const TREE_STATE_SIZE: usize = 64;

/// Root pointer and counters of one tree
///
/// Layout (64 bytes, big-endian):
/// ```text
/// Offset  Size  Description
/// 0       8     Root page
/// 8       8     Page count (leaf + branch + overflow)
/// 16      8     Overflow pages
/// 24      8     Leaf pages
/// 32      8     Branch pages
/// 40      8     Entries
/// 48      4     Depth
/// 52      4     Flags (reserved, zero)
/// 56      8     Reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TreeState {
    pub root_page: PageNumber,
    pub page_count: u64,
    pub overflow_pages: u64,
    pub leaf_pages: u64,
    pub branch_pages: u64,
    pub entries: u64,
    pub depth: u32,
}

impl TreeState {
    /// State of a tree made of a single empty leaf
    pub fn with_root(root_page: PageNumber) -> Self {
        Self {
            root_page,
            page_count: 1,
            overflow_pages: 0,
            leaf_pages: 1,
            branch_pages: 0,
            entries: 0,
            depth: 1,
        }
    }

    pub fn encode(&self) -> [u8; TREE_STATE_SIZE] {
        let mut buf = [0u8; TREE_STATE_SIZE];
        buf[0..8].copy_from_slice(&self.root_page.value().to_be_bytes());
        buf[8..16].copy_from_slice(&self.page_count.to_be_bytes());
        buf[16..24].copy_from_slice(&self.overflow_pages.to_be_bytes());
        buf[24..32].copy_from_slice(&self.leaf_pages.to_be_bytes());
        buf[32..40].copy_from_slice(&self.branch_pages.to_be_bytes());
        buf[40..48].copy_from_slice(&self.entries.to_be_bytes());
        buf[48..52].copy_from_slice(&self.depth.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TREE_STATE_SIZE {
            return Err(StorageError::corruption(format!(
                "tree state needs {} bytes, got {}",
                TREE_STATE_SIZE,
                bytes.len()
            )));
        }

        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_be_bytes(raw)
        };

        Ok(Self {
            root_page: PageNumber::new(u64_at(0)),
            page_count: u64_at(8),
            overflow_pages: u64_at(16),
            leaf_pages: u64_at(24),
            branch_pages: u64_at(32),
            entries: u64_at(40),
            depth: u32::from_be_bytes([bytes[48], bytes[49], bytes[50], bytes[51]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_state_encoding() {
        let state = TreeState {
            root_page: PageNumber::new(12),
            page_count: 7,
            overflow_pages: 3,
            leaf_pages: 3,
            branch_pages: 1,
            entries: 250,
            depth: 2,
        };
        let encoded = state.encode();
        assert_eq!(TreeState::decode(&encoded).unwrap(), state);
        assert!(TreeState::decode(&encoded[..10]).is_err());
    }
}
