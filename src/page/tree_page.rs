//! Typed view over a slotted tree page.
//!
//! A tree page uses the following layout:
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                 Page Header (20 bytes)              │
//! ├────────────────────────────────────────────────────┤
//! │                 Node Offset Array                   │
//! │  [off0][off1][off2]...      →            (lower)   │
//! ├────────────────────────────────────────────────────┤
//! │                   Free Space                        │
//! ├────────────────────────────────────────────────────┤
//! │  (upper)         Node Body Area                     │
//! │      ←  [node2][node1][node0]                      │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! Offsets are sorted by key order for binary search. Removing a node only
//! drops its offset; the body becomes fragmentation that is compacted away
//! when an insert needs the room.

use crate::error::{Result, StorageError};
use crate::page::node::{self, Node, NODE_PAGE_REF_OFFSET};
use crate::page::PageHeader;
use crate::types::{PageFlags, PageNumber, PAGE_HEADER_SIZE, PAGE_SIZE};
use std::cmp::Ordering;

/// Outcome of a key search within one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    /// Leaf: first node with key >= search key (may equal the node count).
    /// Branch: the child whose range contains the search key.
    pub position: usize,
    /// Whether the node at `position` carries exactly the search key
    pub exact: bool,
}

/// A leaf or branch page, borrowed or owned
pub struct TreePage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> TreePage<B> {
    /// Wrap a page buffer, validating its header
    pub fn new(buf: B) -> Result<Self> {
        let page = Self { buf };
        let bytes = page.buf.as_ref();
        if bytes.len() != PAGE_SIZE {
            return Err(StorageError::corruption(format!(
                "tree page has {} bytes, expected {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }

        let header = page.header();
        match header.kind() {
            Some(PageFlags::Leaf) | Some(PageFlags::Branch) => {}
            _ => {
                return Err(StorageError::corruption(format!(
                    "page {} is not a tree page (flags {:#04x})",
                    header.page_number, header.flags
                )))
            }
        }

        let lower = header.lower as usize;
        let upper = header.upper as usize;
        if lower != PAGE_HEADER_SIZE + 2 * header.item_count as usize
            || lower > upper
            || upper > PAGE_SIZE
        {
            return Err(StorageError::corruption(format!(
                "page {} has an inconsistent header: count {}, lower {}, upper {}",
                header.page_number, header.item_count, lower, upper
            )));
        }

        Ok(page)
    }

    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    fn read_u16(&self, offset: usize) -> u16 {
        let bytes = self.bytes();
        u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
    }

    /// Decoded page header
    pub fn header(&self) -> PageHeader {
        let bytes = self.bytes();
        let mut page_number = [0u8; 8];
        page_number.copy_from_slice(&bytes[0..8]);
        let mut overflow_size = [0u8; 4];
        overflow_size.copy_from_slice(&bytes[16..20]);

        PageHeader {
            page_number: PageNumber::new(u64::from_be_bytes(page_number)),
            flags: bytes[8],
            item_count: self.read_u16(10),
            lower: self.read_u16(12),
            upper: self.read_u16(14),
            overflow_size: u32::from_be_bytes(overflow_size),
        }
    }

    /// Number of the page as recorded in its header
    pub fn page_number(&self) -> PageNumber {
        self.header().page_number
    }

    /// Number of nodes on this page
    pub fn count(&self) -> usize {
        self.read_u16(10) as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.bytes()[8] == PageFlags::Leaf as u8
    }

    pub fn is_branch(&self) -> bool {
        self.bytes()[8] == PageFlags::Branch as u8
    }

    fn node_offset(&self, index: usize) -> Result<usize> {
        let count = self.count();
        if index >= count {
            return Err(StorageError::invalid_operation(format!(
                "node index {} out of bounds (count: {})",
                index, count
            )));
        }

        let offset = self.read_u16(PAGE_HEADER_SIZE + index * 2) as usize;
        let header = self.header();
        if offset < header.upper as usize || offset >= PAGE_SIZE {
            return Err(StorageError::corruption(format!(
                "node {} of page {} points outside the body area ({})",
                index, header.page_number, offset
            )));
        }
        Ok(offset)
    }

    fn node_bytes(&self, index: usize) -> Result<&[u8]> {
        let offset = self.node_offset(index)?;
        Ok(&self.bytes()[offset..])
    }

    /// Borrow the key of the node at `index`
    pub fn key(&self, index: usize) -> Result<&[u8]> {
        let page_number = self.page_number();
        node::node_key(self.node_bytes(index)?).ok_or_else(|| {
            StorageError::corruption(format!(
                "failed to decode node {} of page {}",
                index, page_number
            ))
        })
    }

    /// Decode the node at `index`
    pub fn node(&self, index: usize) -> Result<Node> {
        let page_number = self.page_number();
        Node::decode(self.node_bytes(index)?)
            .map(|(node, _)| node)
            .ok_or_else(|| {
                StorageError::corruption(format!(
                    "failed to decode node {} of page {}",
                    index, page_number
                ))
            })
    }

    /// Decode every node in key order
    pub fn nodes(&self) -> Result<Vec<Node>> {
        (0..self.count()).map(|i| self.node(i)).collect()
    }

    /// Child page referenced by branch node `index`
    pub fn child(&self, index: usize) -> Result<PageNumber> {
        let page_number = self.page_number();
        self.node(index)?.child().ok_or_else(|| {
            StorageError::corruption(format!(
                "node {} of page {} is not a branch node",
                index, page_number
            ))
        })
    }

    fn encoded_len(&self, index: usize) -> Result<usize> {
        let page_number = self.page_number();
        node::encoded_len(self.node_bytes(index)?).ok_or_else(|| {
            StorageError::corruption(format!(
                "failed to decode node {} of page {}",
                index, page_number
            ))
        })
    }

    /// Locate `key` on this page
    pub fn search(&self, key: &[u8]) -> Result<SearchResult> {
        let count = self.count();

        if self.is_branch() {
            if count == 0 {
                return Err(StorageError::corruption(format!(
                    "branch page {} has no children",
                    self.page_number()
                )));
            }
            // The key of node 0 means "before all keys" and is never compared.
            let mut low = 1;
            let mut high = count;
            while low < high {
                let mid = low + (high - low) / 2;
                if self.key(mid)? <= key {
                    low = mid + 1;
                } else {
                    high = mid;
                }
            }
            let position = low - 1;
            let exact = position > 0 && self.key(position)? == key;
            return Ok(SearchResult { position, exact });
        }

        let mut low = 0;
        let mut high = count;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.key(mid)?.cmp(key) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => {
                    return Ok(SearchResult {
                        position: mid,
                        exact: true,
                    })
                }
            }
        }
        Ok(SearchResult {
            position: low,
            exact: false,
        })
    }

    /// Bytes in use: header, offset array and live node bodies
    pub fn used_space(&self) -> Result<usize> {
        let mut used = PAGE_HEADER_SIZE;
        for i in 0..self.count() {
            used += 2 + self.encoded_len(i)?;
        }
        Ok(used)
    }

    /// Bytes available once fragmentation is compacted away
    pub fn free_space(&self) -> Result<usize> {
        Ok(PAGE_SIZE - self.used_space()?)
    }

    /// Whether a node of `node_size` bytes can be added
    pub fn has_space_for(&self, node_size: usize) -> Result<bool> {
        Ok(self.free_space()? >= node_size + 2)
    }

    /// Consume the view, returning the buffer
    pub fn into_inner(self) -> B {
        self.buf
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> TreePage<B> {
    /// Write an empty page header into `buf`
    pub fn init(mut buf: B, page_number: PageNumber, flags: PageFlags) -> Self {
        let bytes = buf.as_mut();
        bytes.fill(0);
        PageHeader::new_tree_page(page_number, flags).write(bytes);
        Self { buf }
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.buf.as_mut()[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn set_counts(&mut self, count: usize, upper: usize) {
        self.write_u16(10, count as u16);
        self.write_u16(12, (PAGE_HEADER_SIZE + count * 2) as u16);
        self.write_u16(14, upper as u16);
    }

    /// Stamp a new page number into the header, used after a copy
    pub fn set_page_number(&mut self, page_number: PageNumber) {
        self.buf.as_mut()[0..8].copy_from_slice(&page_number.value().to_be_bytes());
    }

    /// Insert `node` so it becomes the node at `index`
    pub fn insert_node(&mut self, index: usize, node: &Node) -> Result<()> {
        let count = self.count();
        if index > count {
            return Err(StorageError::invalid_operation(format!(
                "insert index {} out of bounds (count: {})",
                index, count
            )));
        }

        let encoded = node.encode();
        let size = encoded.len();
        if self.header().free_space() < size + 2 {
            if !self.has_space_for(size)? {
                return Err(StorageError::invalid_operation(format!(
                    "page {} is full: node of {} bytes does not fit",
                    self.page_number(),
                    size
                )));
            }
            self.compact()?;
        }

        let upper = self.header().upper as usize - size;
        self.buf.as_mut()[upper..upper + size].copy_from_slice(&encoded);

        for i in (index..count).rev() {
            let offset = self.read_u16(PAGE_HEADER_SIZE + i * 2);
            self.write_u16(PAGE_HEADER_SIZE + (i + 1) * 2, offset);
        }
        self.write_u16(PAGE_HEADER_SIZE + index * 2, upper as u16);
        self.set_counts(count + 1, upper);

        Ok(())
    }

    /// Remove the node at `index`, leaving its body as fragmentation
    pub fn remove_node(&mut self, index: usize) -> Result<()> {
        self.node_offset(index)?;
        let count = self.count();

        for i in index..count - 1 {
            let offset = self.read_u16(PAGE_HEADER_SIZE + (i + 1) * 2);
            self.write_u16(PAGE_HEADER_SIZE + i * 2, offset);
        }
        let upper = self.header().upper as usize;
        self.set_counts(count - 1, upper);

        Ok(())
    }

    /// Replace the node at `index` with `node`
    pub fn replace_node(&mut self, index: usize, node: &Node) -> Result<()> {
        self.remove_node(index)?;
        self.insert_node(index, node)
    }

    /// Repoint branch node `index` at `child` without re-encoding it
    pub fn set_child(&mut self, index: usize, child: PageNumber) -> Result<()> {
        if !self.is_branch() {
            return Err(StorageError::invalid_operation(format!(
                "set_child on leaf page {}",
                self.page_number()
            )));
        }
        let at = self.node_offset(index)? + NODE_PAGE_REF_OFFSET;
        self.buf.as_mut()[at..at + 8].copy_from_slice(&child.value().to_be_bytes());
        Ok(())
    }

    /// Remove and return every node from `index` to the end
    pub fn drain_from(&mut self, index: usize) -> Result<Vec<Node>> {
        let moved = (index..self.count())
            .map(|i| self.node(i))
            .collect::<Result<Vec<_>>>()?;
        let upper = self.header().upper as usize;
        self.set_counts(index, upper);
        self.compact()?;
        Ok(moved)
    }

    /// Rewrite node bodies contiguously at the end of the page
    pub fn compact(&mut self) -> Result<()> {
        let bodies = (0..self.count())
            .map(|i| {
                let offset = self.node_offset(i)?;
                let len = self.encoded_len(i)?;
                Ok(self.bytes()[offset..offset + len].to_vec())
            })
            .collect::<Result<Vec<_>>>()?;

        let mut upper = PAGE_SIZE;
        for (i, body) in bodies.iter().enumerate() {
            upper -= body.len();
            self.buf.as_mut()[upper..upper + body.len()].copy_from_slice(body);
            self.write_u16(PAGE_HEADER_SIZE + i * 2, upper as u16);
        }

        let lower = PAGE_HEADER_SIZE + bodies.len() * 2;
        self.buf.as_mut()[lower..upper].fill(0);
        self.set_counts(bodies.len(), upper);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageBuf;

    fn leaf() -> TreePage<PageBuf> {
        TreePage::init(PageBuf::new(), PageNumber::new(2), PageFlags::Leaf)
    }

    fn insert_sorted(page: &mut TreePage<PageBuf>, key: &[u8], value: &[u8]) {
        let found = page.search(key).unwrap();
        page.insert_node(found.position, &Node::data(key.to_vec(), value.to_vec()))
            .unwrap();
    }

    #[test]
    fn test_new_leaf_page() {
        let page = leaf();
        assert!(page.is_leaf());
        assert!(!page.is_branch());
        assert_eq!(page.count(), 0);
        assert_eq!(page.free_space().unwrap(), PAGE_SIZE - PAGE_HEADER_SIZE);
    }

    #[test]
    fn test_insert_keeps_key_order() {
        let mut page = leaf();
        insert_sorted(&mut page, b"banana", b"yellow");
        insert_sorted(&mut page, b"apple", b"red");
        insert_sorted(&mut page, b"cherry", b"red");

        assert_eq!(page.count(), 3);
        assert_eq!(page.key(0).unwrap(), b"apple");
        assert_eq!(page.key(1).unwrap(), b"banana");
        assert_eq!(page.key(2).unwrap(), b"cherry");
    }

    #[test]
    fn test_leaf_search() {
        let mut page = leaf();
        insert_sorted(&mut page, b"a", b"1");
        insert_sorted(&mut page, b"c", b"3");

        let hit = page.search(b"c").unwrap();
        assert_eq!(hit, SearchResult { position: 1, exact: true });
        let miss = page.search(b"b").unwrap();
        assert_eq!(miss, SearchResult { position: 1, exact: false });
        let past = page.search(b"z").unwrap();
        assert_eq!(past.position, 2);
    }

    #[test]
    fn test_branch_search() {
        let mut page = TreePage::init(PageBuf::new(), PageNumber::new(5), PageFlags::Branch);
        page.insert_node(0, &Node::branch(Vec::new(), PageNumber::new(100)))
            .unwrap();
        page.insert_node(1, &Node::branch(b"m".to_vec(), PageNumber::new(10)))
            .unwrap();
        page.insert_node(2, &Node::branch(b"t".to_vec(), PageNumber::new(20)))
            .unwrap();

        let child_for = |key: &[u8]| {
            let found = page.search(key).unwrap();
            page.child(found.position).unwrap()
        };
        assert_eq!(child_for(b"a"), PageNumber::new(100));
        assert_eq!(child_for(b"m"), PageNumber::new(10));
        assert_eq!(child_for(b"n"), PageNumber::new(10));
        assert_eq!(child_for(b"t"), PageNumber::new(20));
        assert_eq!(child_for(b"z"), PageNumber::new(20));
        assert!(page.search(b"m").unwrap().exact);
    }

    #[test]
    fn test_set_child_in_place() {
        let mut page = TreePage::init(PageBuf::new(), PageNumber::new(5), PageFlags::Branch);
        page.insert_node(0, &Node::branch(Vec::new(), PageNumber::new(100)))
            .unwrap();
        page.set_child(0, PageNumber::new(300)).unwrap();
        assert_eq!(page.child(0).unwrap(), PageNumber::new(300));
        assert!(leaf().set_child(0, PageNumber::new(1)).is_err());
    }

    #[test]
    fn test_remove_then_compact_reclaims_space() {
        let mut page = leaf();
        let value = vec![7u8; 900];
        for key in [b"k1", b"k2", b"k3", b"k4"] {
            insert_sorted(&mut page, key, &value);
        }
        let before = page.free_space().unwrap();
        page.remove_node(1).unwrap();
        page.remove_node(1).unwrap();
        assert_eq!(page.count(), 2);
        assert!(page.free_space().unwrap() > before);

        // The contiguous gap alone cannot hold these, compaction must kick in.
        insert_sorted(&mut page, b"k5", &value);
        insert_sorted(&mut page, b"k6", &value);
        assert_eq!(page.key(0).unwrap(), b"k1");
        assert_eq!(page.key(3).unwrap(), b"k6");
    }

    #[test]
    fn test_full_page_rejects_insert() {
        let mut page = leaf();
        let value = vec![1u8; 1000];
        for i in 0..4u8 {
            insert_sorted(&mut page, &[i], &value);
        }
        let node = Node::data(vec![9], value);
        assert!(!page.has_space_for(node.encoded_size()).unwrap());
        assert!(page.insert_node(4, &node).is_err());
    }

    #[test]
    fn test_drain_from_moves_upper_half() {
        let mut page = leaf();
        for i in 0..10 {
            let key = format!("key{:02}", i);
            insert_sorted(&mut page, key.as_bytes(), b"v");
        }

        let moved = page.drain_from(5).unwrap();
        assert_eq!(moved.len(), 5);
        assert_eq!(moved[0].key, b"key05");
        assert_eq!(page.count(), 5);
        assert_eq!(page.key(4).unwrap(), b"key04");
    }

    #[test]
    fn test_rejects_non_tree_page() {
        let buf = PageBuf::new();
        assert!(TreePage::new(&buf).is_err());

        let page = leaf().into_inner();
        let view = TreePage::new(&page).unwrap();
        assert_eq!(view.page_number(), PageNumber::new(2));
    }
}
