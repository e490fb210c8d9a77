//! Node encoding and decoding.
//!
//! Nodes are the variable-length records stored within tree pages. A leaf
//! node holds a key and either its data inline or a reference to an overflow
//! run; a branch node holds a key and a child page number.
//!
//! Every node starts with a one byte kind tag. Page references always sit at
//! byte offset 1 so a parent can be repointed in place.

use crate::types::{decode_varint, put_varint, varint_size, PageNumber};

const KIND_DATA: u8 = 0x01;
const KIND_BRANCH: u8 = 0x02;
const KIND_OVERFLOW: u8 = 0x04;

/// Offset of the page reference in branch and overflow nodes
pub const NODE_PAGE_REF_OFFSET: usize = 1;

/// What a node points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeValue {
    /// Value bytes stored inline in the leaf
    Data(Vec<u8>),
    /// Value stored in a run of overflow pages
    Overflow { first_page: PageNumber, size: u64 },
    /// Child page of a branch node
    Child(PageNumber),
}

/// A node within a tree page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// The key bytes
    pub key: Vec<u8>,
    /// Inline data, overflow reference or child pointer
    pub value: NodeValue,
}

impl Node {
    /// Create a leaf node with inline data
    pub fn data(key: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            key,
            value: NodeValue::Data(data),
        }
    }

    /// Create a leaf node referencing an overflow run
    pub fn overflow(key: Vec<u8>, first_page: PageNumber, size: u64) -> Self {
        Self {
            key,
            value: NodeValue::Overflow { first_page, size },
        }
    }

    /// Create a branch node
    pub fn branch(key: Vec<u8>, child: PageNumber) -> Self {
        Self {
            key,
            value: NodeValue::Child(child),
        }
    }

    /// Child page of a branch node
    pub fn child(&self) -> Option<PageNumber> {
        match self.value {
            NodeValue::Child(page) => Some(page),
            _ => None,
        }
    }

    /// Calculate the encoded size of this node in bytes
    pub fn encoded_size(&self) -> usize {
        let key_len = varint_size(self.key.len() as u64) + self.key.len();
        match &self.value {
            NodeValue::Data(data) => 1 + key_len + varint_size(data.len() as u64) + data.len(),
            NodeValue::Overflow { size, .. } => 1 + 8 + key_len + varint_size(*size),
            NodeValue::Child(_) => 1 + 8 + key_len,
        }
    }

    /// Encode this node into bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());

        match &self.value {
            NodeValue::Data(data) => {
                buf.push(KIND_DATA);
                put_varint(&mut buf, self.key.len() as u64);
                put_varint(&mut buf, data.len() as u64);
                buf.extend_from_slice(&self.key);
                buf.extend_from_slice(data);
            }
            NodeValue::Overflow { first_page, size } => {
                buf.push(KIND_OVERFLOW);
                buf.extend_from_slice(&first_page.value().to_be_bytes());
                put_varint(&mut buf, self.key.len() as u64);
                put_varint(&mut buf, *size);
                buf.extend_from_slice(&self.key);
            }
            NodeValue::Child(child) => {
                buf.push(KIND_BRANCH);
                buf.extend_from_slice(&child.value().to_be_bytes());
                put_varint(&mut buf, self.key.len() as u64);
                buf.extend_from_slice(&self.key);
            }
        }

        buf
    }

    /// Decode a node from the start of `bytes`
    ///
    /// Returns the node and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        let layout = Layout::parse(bytes)?;
        let key = bytes[layout.key_start..layout.key_start + layout.key_len].to_vec();

        let value = match layout.kind {
            KIND_DATA => {
                let start = layout.key_start + layout.key_len;
                NodeValue::Data(bytes[start..start + layout.value_len as usize].to_vec())
            }
            KIND_OVERFLOW => NodeValue::Overflow {
                first_page: read_page_ref(bytes)?,
                size: layout.value_len,
            },
            _ => NodeValue::Child(read_page_ref(bytes)?),
        };

        Some((Self { key, value }, layout.total))
    }
}

/// Borrow the key of the encoded node at the start of `bytes`
pub fn node_key(bytes: &[u8]) -> Option<&[u8]> {
    let layout = Layout::parse(bytes)?;
    Some(&bytes[layout.key_start..layout.key_start + layout.key_len])
}

/// Size of the encoded node at the start of `bytes`
pub fn encoded_len(bytes: &[u8]) -> Option<usize> {
    Layout::parse(bytes).map(|layout| layout.total)
}

fn read_page_ref(bytes: &[u8]) -> Option<PageNumber> {
    let raw = bytes.get(NODE_PAGE_REF_OFFSET..NODE_PAGE_REF_OFFSET + 8)?;
    Some(PageNumber::new(u64::from_be_bytes(raw.try_into().ok()?)))
}

/// Field positions of one encoded node, bounds checked against the input
struct Layout {
    kind: u8,
    key_start: usize,
    key_len: usize,
    /// Inline data length or overflow value size; zero for branch nodes
    value_len: u64,
    total: usize,
}

impl Layout {
    fn parse(bytes: &[u8]) -> Option<Self> {
        let kind = *bytes.first()?;
        let mut offset = 1;

        let (key_len, value_len, inline) = match kind {
            KIND_DATA => {
                let (key_len, n) = decode_varint(bytes.get(offset..)?)?;
                offset += n;
                let (data_len, n) = decode_varint(bytes.get(offset..)?)?;
                offset += n;
                (key_len, data_len, data_len)
            }
            KIND_OVERFLOW => {
                offset += 8;
                let (key_len, n) = decode_varint(bytes.get(offset..)?)?;
                offset += n;
                let (size, n) = decode_varint(bytes.get(offset..)?)?;
                offset += n;
                (key_len, size, 0)
            }
            KIND_BRANCH => {
                offset += 8;
                let (key_len, n) = decode_varint(bytes.get(offset..)?)?;
                offset += n;
                (key_len, 0, 0)
            }
            _ => return None,
        };

        let key_len = usize::try_from(key_len).ok()?;
        let inline = usize::try_from(inline).ok()?;
        let total = offset.checked_add(key_len)?.checked_add(inline)?;
        if total > bytes.len() {
            return None;
        }

        Some(Self {
            kind,
            key_start: offset,
            key_len,
            value_len,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_node_roundtrip() {
        let node = Node::data(b"hello".to_vec(), b"world".to_vec());
        let encoded = node.encode();
        let (decoded, size) = Node::decode(&encoded).unwrap();

        assert_eq!(size, encoded.len());
        assert_eq!(size, node.encoded_size());
        assert_eq!(decoded, node);
        assert_eq!(node_key(&encoded), Some(&b"hello"[..]));
    }

    #[test]
    fn test_branch_node_page_ref_offset() {
        let node = Node::branch(b"separator".to_vec(), PageNumber::new(42));
        let mut encoded = node.encode();

        encoded[NODE_PAGE_REF_OFFSET..NODE_PAGE_REF_OFFSET + 8]
            .copy_from_slice(&77u64.to_be_bytes());
        let (decoded, _) = Node::decode(&encoded).unwrap();
        assert_eq!(decoded.child(), Some(PageNumber::new(77)));
        assert_eq!(decoded.key, b"separator");
    }

    #[test]
    fn test_overflow_node() {
        let node = Node::overflow(b"big".to_vec(), PageNumber::new(9), 8192);
        let encoded = node.encode();
        assert_eq!(encoded.len(), node.encoded_size());
        assert_eq!(encoded_len(&encoded), Some(encoded.len()));

        let (decoded, _) = Node::decode(&encoded).unwrap();
        assert_eq!(
            decoded.value,
            NodeValue::Overflow {
                first_page: PageNumber::new(9),
                size: 8192
            }
        );
    }

    #[test]
    fn test_empty_key_and_value() {
        let node = Node::data(Vec::new(), Vec::new());
        let encoded = node.encode();
        let (decoded, _) = Node::decode(&encoded).unwrap();
        assert!(decoded.key.is_empty());
        assert_eq!(decoded.value, NodeValue::Data(Vec::new()));
    }

    #[test]
    fn test_truncated_node_rejected() {
        let encoded = Node::data(b"key".to_vec(), b"value".to_vec()).encode();
        assert!(Node::decode(&encoded[..encoded.len() - 1]).is_none());
        assert!(Node::decode(&[0x7F]).is_none());
        assert!(node_key(&[]).is_none());
    }
}
