//! Overflow runs: values too large for a leaf, stored across contiguous pages.
//!
//! The first page of a run carries a page header whose `overflow_size` is the
//! value length; the value bytes start right after that header and continue
//! through the following pages without any per-page framing.

use crate::error::{Result, StorageError};
use crate::page::{PageBuf, PageHeader};
use crate::types::{overflow_pages_for, PageFlags, PageNumber, PAGE_HEADER_SIZE, PAGE_SIZE};

/// Lay `value` out over a run starting at `first`
pub fn build_overflow_run(first: PageNumber, value: &[u8]) -> Vec<PageBuf> {
    let count = overflow_pages_for(value.len()) as usize;
    let mut pages = Vec::with_capacity(count);

    let mut first_page = PageBuf::new();
    PageHeader::new_overflow(first, value.len() as u32).write(&mut first_page);
    let head = value.len().min(PAGE_SIZE - PAGE_HEADER_SIZE);
    first_page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + head].copy_from_slice(&value[..head]);
    pages.push(first_page);

    for chunk in value[head..].chunks(PAGE_SIZE) {
        pages.push(PageBuf::from_bytes(chunk));
    }

    pages
}

/// Read the value of the run starting at `first`, loading pages through `load`
pub fn read_overflow_run<P, F>(first: PageNumber, mut load: F) -> Result<Vec<u8>>
where
    P: AsRef<[u8]>,
    F: FnMut(PageNumber) -> Result<P>,
{
    let first_page = load(first)?;
    let header = PageHeader::read(first_page.as_ref())
        .filter(|h| h.kind() == Some(PageFlags::Overflow))
        .ok_or_else(|| {
            StorageError::corruption(format!("page {} is not an overflow page", first))
        })?;

    let size = header.overflow_size as usize;
    let mut value = Vec::with_capacity(size);
    let head = size.min(PAGE_SIZE - PAGE_HEADER_SIZE);
    value.extend_from_slice(&first_page.as_ref()[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + head]);

    let mut next = first.offset(1);
    while value.len() < size {
        let page = load(next)?;
        let take = (size - value.len()).min(PAGE_SIZE);
        value.extend_from_slice(&page.as_ref()[..take]);
        next = next.offset(1);
    }

    Ok(value)
}
