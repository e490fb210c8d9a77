//! Page layer: fixed-size page buffers and typed views over them.
//!
//! Every page is a [`PageBuf`] of [`PAGE_SIZE`] bytes. Tree pages are read and
//! edited through [`TreePage`], which validates every offset against the page
//! size instead of reinterpreting the bytes in place:
//! - A fixed header contains metadata
//! - Node offsets grow from the header toward the end
//! - Node bodies grow from the end toward the header
//! - Free space is in the middle

mod header;
mod node;
mod overflow;
mod tree_page;

pub use header::PageHeader;
pub use node::{Node, NodeValue};
pub use overflow::{build_overflow_run, read_overflow_run};
pub use tree_page::{SearchResult, TreePage};

use crate::types::PAGE_SIZE;

/// A raw page buffer
#[derive(Clone, PartialEq, Eq)]
pub struct PageBuf {
    data: Box<[u8; PAGE_SIZE]>,
}

impl PageBuf {
    /// Create a new zeroed page buffer
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Create a page buffer from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut page = Self::new();
        let len = bytes.len().min(PAGE_SIZE);
        page.data[..len].copy_from_slice(&bytes[..len]);
        page
    }

    /// Get a reference to the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    /// Get a mutable reference to the raw bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}

impl Default for PageBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header = PageHeader::read(self.as_bytes());
        f.debug_struct("PageBuf").field("header", &header).finish()
    }
}

impl std::ops::Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data[..]
    }
}

impl std::ops::DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data[..]
    }
}

impl AsRef<[u8]> for PageBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data[..]
    }
}

impl AsMut<[u8]> for PageBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}
