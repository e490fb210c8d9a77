//! Alternating file headers.
//!
//! Pages 0 and 1 of the data file each hold a copy of the header. A commit
//! of transaction `n` writes slot `n & 1`, so the other slot always keeps the
//! previous intact state if the write is torn.

use crate::btree::{TreeState, TREE_STATE_SIZE};
use crate::error::{Result, StorageError};
use crate::page::PageBuf;
use crate::storage::Pager;
use crate::types::{PageNumber, TransactionId, PAGE_SIZE};

/// Magic bytes to identify a valid header page
pub const MAGIC: &[u8; 8] = b"PGSTORE\0";

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

const ROOT_OFFSET: usize = 32;
const FREE_SPACE_OFFSET: usize = ROOT_OFFSET + TREE_STATE_SIZE;
const SYNCED_OFFSET: usize = FREE_SPACE_OFFSET + TREE_STATE_SIZE;
const CHECKSUM_OFFSET: usize = SYNCED_OFFSET + 8;

/// Database file header
///
/// Layout:
/// ```text
/// Offset  Size  Description
/// 0       8     Magic "PGSTORE\0"
/// 8       4     Format version
/// 12      4     Page size (currently always 4096)
/// 16      8     Last committed transaction id
/// 24      8     Last page number handed out
/// 32      64    Root tree state
/// 96      64    Free-space tree state
/// 160     8     Last transaction applied to and synced in the data file
/// 168     4     Checksum of header (CRC32)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub transaction_id: TransactionId,
    pub last_page_number: PageNumber,
    pub root: TreeState,
    pub free_space: TreeState,
    /// Journal entries up to this transaction are already in the data file
    pub last_synced_transaction: TransactionId,
}

impl FileHeader {
    /// Header slot page for a transaction id
    pub fn slot_for(transaction_id: TransactionId) -> PageNumber {
        PageNumber::new(transaction_id & 1)
    }

    /// Next page number to hand out after this header's state
    pub fn next_page_number(&self) -> PageNumber {
        self.last_page_number.offset(1)
    }

    /// Read a file header from a header page
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CHECKSUM_OFFSET + 4 {
            return Err(StorageError::corruption("header too short"));
        }

        if &bytes[0..8] != MAGIC {
            return Err(StorageError::corruption("invalid header magic bytes"));
        }

        let stored = u32::from_be_bytes([
            bytes[CHECKSUM_OFFSET],
            bytes[CHECKSUM_OFFSET + 1],
            bytes[CHECKSUM_OFFSET + 2],
            bytes[CHECKSUM_OFFSET + 3],
        ]);
        if stored != crc32fast::hash(&bytes[..CHECKSUM_OFFSET]) {
            return Err(StorageError::corruption("header checksum mismatch"));
        }

        let version = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if version != FORMAT_VERSION {
            return Err(StorageError::unrecoverable(format!(
                "unsupported format version: {} (expected {})",
                version, FORMAT_VERSION
            )));
        }

        let page_size = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        if page_size != PAGE_SIZE as u32 {
            return Err(StorageError::unrecoverable(format!(
                "unsupported page size: {} (expected {})",
                page_size, PAGE_SIZE
            )));
        }

        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_be_bytes(raw)
        };

        Ok(Self {
            transaction_id: u64_at(16),
            last_page_number: PageNumber::new(u64_at(24)),
            root: TreeState::decode(&bytes[ROOT_OFFSET..FREE_SPACE_OFFSET])?,
            free_space: TreeState::decode(&bytes[FREE_SPACE_OFFSET..SYNCED_OFFSET])?,
            last_synced_transaction: u64_at(SYNCED_OFFSET),
        })
    }

    /// Write this header into a zeroed page
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[..PAGE_SIZE].fill(0);

        bytes[0..8].copy_from_slice(MAGIC);
        bytes[8..12].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        bytes[12..16].copy_from_slice(&(PAGE_SIZE as u32).to_be_bytes());
        bytes[16..24].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[24..32].copy_from_slice(&self.last_page_number.value().to_be_bytes());
        bytes[ROOT_OFFSET..FREE_SPACE_OFFSET].copy_from_slice(&self.root.encode());
        bytes[FREE_SPACE_OFFSET..SYNCED_OFFSET].copy_from_slice(&self.free_space.encode());
        bytes[SYNCED_OFFSET..CHECKSUM_OFFSET]
            .copy_from_slice(&self.last_synced_transaction.to_be_bytes());

        let checksum = crc32fast::hash(&bytes[..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Write this header into its slot
    pub fn write_to(&self, pager: &dyn Pager) -> Result<()> {
        pager.ensure_allocated(2)?;
        let mut page = PageBuf::new();
        self.write(&mut page);
        pager.write_page(Self::slot_for(self.transaction_id), &page)
    }

    /// Write this header into both slots, syncing after each
    ///
    /// Used once the journal is about to be discarded, so that neither slot
    /// can point recovery at entries that no longer exist.
    pub fn write_both_slots(&self, pager: &dyn Pager) -> Result<()> {
        pager.ensure_allocated(2)?;
        let mut page = PageBuf::new();
        self.write(&mut page);
        let own = Self::slot_for(self.transaction_id);
        pager.write_page(own, &page)?;
        pager.sync()?;
        pager.write_page(PageNumber::new(own.value() ^ 1), &page)?;
        pager.sync()
    }

    /// Load the most recent intact header from the two slots
    ///
    /// Returns `None` when neither slot has ever been written.
    pub fn read_latest(pager: &dyn Pager) -> Result<Option<Self>> {
        if pager.number_of_allocated_pages() < 2 {
            return Ok(None);
        }

        let mut latest: Option<Self> = None;
        let mut errors = Vec::new();
        for slot in 0..2 {
            let page = pager.read_page(PageNumber::new(slot))?;
            if page.iter().all(|&b| b == 0) {
                continue;
            }
            match Self::read(&page) {
                Ok(header) => {
                    if latest.map_or(true, |l| header.transaction_id > l.transaction_id) {
                        latest = Some(header);
                    }
                }
                Err(err @ StorageError::Unrecoverable(_)) => return Err(err),
                Err(err) => errors.push(err),
            }
        }

        match latest {
            Some(header) => Ok(Some(header)),
            None if errors.is_empty() => Ok(None),
            None => Err(StorageError::unrecoverable(format!(
                "no intact file header: {}",
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilePager;
    use tempfile::tempdir;

    fn header(tx: TransactionId) -> FileHeader {
        FileHeader {
            transaction_id: tx,
            last_page_number: PageNumber::new(40 + tx),
            root: TreeState::with_root(PageNumber::new(2)),
            free_space: TreeState::with_root(PageNumber::new(3)),
            last_synced_transaction: tx.saturating_sub(1),
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let mut page = PageBuf::new();
        header(7).write(&mut page);
        assert_eq!(FileHeader::read(&page).unwrap(), header(7));
    }

    #[test]
    fn test_checksum_validation() {
        let mut page = PageBuf::new();
        header(3).write(&mut page);
        page[20] ^= 0xFF;
        assert!(matches!(
            FileHeader::read(&page),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_latest_slot_wins() -> Result<()> {
        let dir = tempdir().unwrap();
        let pager = FilePager::open(&dir.path().join("data.pages"), None)?;
        assert!(FileHeader::read_latest(&pager)?.is_none());

        header(4).write_to(&pager)?;
        header(5).write_to(&pager)?;
        assert_eq!(FileHeader::read_latest(&pager)?.unwrap().transaction_id, 5);

        // Tear slot 1; slot 0 still carries transaction 4.
        let mut torn = pager.read_page(PageNumber::new(1))?;
        torn[100] ^= 0x55;
        pager.write_page(PageNumber::new(1), &torn)?;
        assert_eq!(FileHeader::read_latest(&pager)?.unwrap().transaction_id, 4);

        Ok(())
    }

    #[test]
    fn test_both_slots_torn_is_unrecoverable() -> Result<()> {
        let dir = tempdir().unwrap();
        let pager = FilePager::open(&dir.path().join("data.pages"), None)?;
        header(1).write_to(&pager)?;
        header(2).write_to(&pager)?;

        for slot in 0..2 {
            let mut torn = pager.read_page(PageNumber::new(slot))?;
            torn[30] ^= 0x01;
            pager.write_page(PageNumber::new(slot), &torn)?;
        }
        assert!(matches!(
            FileHeader::read_latest(&pager),
            Err(StorageError::Unrecoverable(_))
        ));
        Ok(())
    }
}
