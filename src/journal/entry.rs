//! Journal entry encoding.
//!
//! One entry per committed write transaction:
//! ```text
//! Offset  Size  Description
//! 0       4     Magic 0x4A524E4C ("JRNL")
//! 4       8     Transaction id
//! 12      4     Page count
//! 16      8     Next page number after this transaction
//! 24      64    Root tree state
//! 88      64    Free-space tree state
//! 152     4     Payload checksum (CRC32)
//! 156     4     Header checksum (CRC32 of bytes 0..156)
//! 160     ...   Page count x (page number u64 + page bytes)
//! ```

use crate::btree::{TreeState, TREE_STATE_SIZE};
use crate::error::Result;
use crate::page::PageBuf;
use crate::types::{PageNumber, TransactionId, PAGE_SIZE};
use std::io::{self, Read, Write};
use std::sync::Arc;

const ENTRY_MAGIC: u32 = 0x4A52_4E4C;

/// Size of the fixed entry header
pub const ENTRY_HEADER_SIZE: usize = 160;

const PAGE_RECORD_SIZE: usize = 8 + PAGE_SIZE;

/// Pages written by one committed transaction
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub transaction_id: TransactionId,
    pub next_page_number: PageNumber,
    pub root: TreeState,
    pub free_space: TreeState,
    /// Sorted by page number
    pub pages: Vec<(PageNumber, Arc<PageBuf>)>,
}

/// Result of reading the next entry from a journal file
#[derive(Debug)]
pub enum ReadOutcome {
    Entry(JournalEntry),
    /// Clean end of file
    End,
    /// Partial or corrupt entry; nothing after it can be trusted
    Torn(String),
}

impl JournalEntry {
    /// Encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        ENTRY_HEADER_SIZE + self.pages.len() * PAGE_RECORD_SIZE
    }

    /// Write the entry to `out`
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut payload_crc = crc32fast::Hasher::new();
        for (number, page) in &self.pages {
            payload_crc.update(&number.value().to_be_bytes());
            payload_crc.update(page.as_bytes());
        }

        let mut header = [0u8; ENTRY_HEADER_SIZE];
        header[0..4].copy_from_slice(&ENTRY_MAGIC.to_be_bytes());
        header[4..12].copy_from_slice(&self.transaction_id.to_be_bytes());
        header[12..16].copy_from_slice(&(self.pages.len() as u32).to_be_bytes());
        header[16..24].copy_from_slice(&self.next_page_number.value().to_be_bytes());
        header[24..24 + TREE_STATE_SIZE].copy_from_slice(&self.root.encode());
        header[88..88 + TREE_STATE_SIZE].copy_from_slice(&self.free_space.encode());
        header[152..156].copy_from_slice(&payload_crc.finalize().to_be_bytes());
        let header_crc = crc32fast::hash(&header[..156]);
        header[156..160].copy_from_slice(&header_crc.to_be_bytes());

        out.write_all(&header)?;
        for (number, page) in &self.pages {
            out.write_all(&number.value().to_be_bytes())?;
            out.write_all(page.as_bytes())?;
        }
        Ok(())
    }

    /// Read the next entry from `input`
    ///
    /// I/O errors other than a short read are returned as errors; anything
    /// that looks like a torn write is reported as [`ReadOutcome::Torn`].
    pub fn read_from<R: Read>(input: &mut R) -> Result<ReadOutcome> {
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        let filled = read_fully(input, &mut header)?;
        if filled == 0 {
            return Ok(ReadOutcome::End);
        }
        if filled < ENTRY_HEADER_SIZE {
            return Ok(ReadOutcome::Torn(format!(
                "entry header truncated after {} bytes",
                filled
            )));
        }

        let u32_at = |at: usize| u32::from_be_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&header[at..at + 8]);
            u64::from_be_bytes(raw)
        };

        if u32_at(0) != ENTRY_MAGIC {
            // Preallocated or zeroed tail
            if header.iter().all(|&b| b == 0) {
                return Ok(ReadOutcome::End);
            }
            return Ok(ReadOutcome::Torn("bad entry magic".to_string()));
        }
        if u32_at(156) != crc32fast::hash(&header[..156]) {
            return Ok(ReadOutcome::Torn("entry header checksum mismatch".to_string()));
        }

        let transaction_id = u64_at(4);
        let page_count = u32_at(12) as usize;
        let root = TreeState::decode(&header[24..24 + TREE_STATE_SIZE])?;
        let free_space = TreeState::decode(&header[88..88 + TREE_STATE_SIZE])?;

        let mut payload_crc = crc32fast::Hasher::new();
        let mut pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            let mut number = [0u8; 8];
            let mut page = PageBuf::new();
            if read_fully(input, &mut number)? < 8
                || read_fully(input, page.as_bytes_mut())? < PAGE_SIZE
            {
                return Ok(ReadOutcome::Torn(format!(
                    "entry for transaction {} truncated",
                    transaction_id
                )));
            }
            payload_crc.update(&number);
            payload_crc.update(page.as_bytes());
            pages.push((PageNumber::new(u64::from_be_bytes(number)), Arc::new(page)));
        }

        if payload_crc.finalize() != u32_at(152) {
            return Ok(ReadOutcome::Torn(format!(
                "payload checksum mismatch in transaction {}",
                transaction_id
            )));
        }

        Ok(ReadOutcome::Entry(JournalEntry {
            transaction_id,
            next_page_number: PageNumber::new(u64_at(16)),
            root,
            free_space,
            pages,
        }))
    }
}

/// Fill `buf` as far as the input allows, returning the bytes read
fn read_fully<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
