//! Free-space records.
//!
//! The free-space tree maps `(freeing transaction id, chunk sequence)` to a
//! list of page numbers. Keys are big-endian so records sort by transaction.
//!
//! ```text
//! Key:   transaction id u64 BE | sequence u32 BE
//! Value: up to PAGES_PER_RECORD x page number u64 BE
//! ```

use crate::btree::{Slice, TreeIterator, TreeState};
use crate::error::{Result, StorageError};
use crate::txn::Transaction;
use crate::types::TransactionId;

/// Page numbers stored per record, keeping every value inline
pub const PAGES_PER_RECORD: usize = 100;

const KEY_SIZE: usize = 12;

/// Key of chunk `sequence` of the pages freed by `transaction_id`
pub fn record_key(transaction_id: TransactionId, sequence: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_SIZE);
    key.extend_from_slice(&transaction_id.to_be_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// Split a record key into transaction id and sequence
pub fn decode_record_key(key: &[u8]) -> Result<(TransactionId, u32)> {
    if key.len() != KEY_SIZE {
        return Err(StorageError::corruption(format!(
            "free-space key has {} bytes, expected {}",
            key.len(),
            KEY_SIZE
        )));
    }
    let mut tx = [0u8; 8];
    tx.copy_from_slice(&key[..8]);
    let mut seq = [0u8; 4];
    seq.copy_from_slice(&key[8..]);
    Ok((u64::from_be_bytes(tx), u32::from_be_bytes(seq)))
}

pub fn encode_pages(pages: &[u64]) -> Vec<u8> {
    pages.iter().flat_map(|p| p.to_be_bytes()).collect()
}

pub fn decode_pages(value: &[u8]) -> Result<Vec<u64>> {
    if value.len() % 8 != 0 {
        return Err(StorageError::corruption(format!(
            "free-space record of {} bytes is not a list of page numbers",
            value.len()
        )));
    }
    Ok(value
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            u64::from_be_bytes(raw)
        })
        .collect())
}

/// A free-space record read from the tree
#[derive(Debug, Clone)]
pub struct FreeRecord {
    pub key: Vec<u8>,
    pub pages: Vec<u64>,
}

/// Records freed by transactions strictly older than `oldest`
///
/// Scanning stops at the first record at or past `oldest`: its pages may
/// still be reachable from a live snapshot.
pub fn eligible_records(
    tx: &Transaction<'_>,
    state: &TreeState,
    oldest: TransactionId,
) -> Result<Vec<FreeRecord>> {
    let mut records = Vec::new();
    let mut iter = TreeIterator::new(tx, *state);
    if !iter.seek(Slice::BeforeAllKeys)? {
        return Ok(records);
    }
    loop {
        let key = iter.key()?;
        let (freed_by, _) = decode_record_key(&key)?;
        if freed_by >= oldest {
            break;
        }
        let pages = decode_pages(&iter.value()?)?;
        records.push(FreeRecord { key, pages });
        if !iter.move_next()? {
            break;
        }
    }
    Ok(records)
}

/// Total pages listed in the free-space tree
pub fn count_free_pages(tx: &Transaction<'_>, state: &TreeState) -> Result<u64> {
    let mut total = 0u64;
    let mut iter = TreeIterator::new(tx, *state);
    let mut valid = iter.seek(Slice::BeforeAllKeys)?;
    while valid {
        total += (iter.value()?.len() / 8) as u64;
        valid = iter.move_next()?;
    }
    Ok(total)
}

/// First run of `count` consecutive page numbers in `pool`, removed from it
pub fn take_run(pool: &mut std::collections::BTreeSet<u64>, count: u64) -> Option<u64> {
    if count == 0 {
        return None;
    }
    let mut start = None;
    let mut len = 0u64;
    let mut previous = None;
    for &page in pool.iter() {
        if previous.map_or(false, |p: u64| p + 1 == page) {
            len += 1;
        } else {
            start = Some(page);
            len = 1;
        }
        previous = Some(page);
        if len == count {
            break;
        }
    }
    if len < count {
        return None;
    }
    let first = start?;
    for page in first..first + count {
        pool.remove(&page);
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_keys_sort_by_transaction() -> Result<()> {
        let a = record_key(9, 7);
        let b = record_key(10, 0);
        assert!(a < b);
        assert_eq!(decode_record_key(&b)?, (10, 0));
        assert!(decode_record_key(&[0u8; 5]).is_err());
        Ok(())
    }

    #[test]
    fn test_page_list_encoding() -> Result<()> {
        let pages = vec![4, 17, 1 << 40];
        assert_eq!(decode_pages(&encode_pages(&pages))?, pages);
        assert!(matches!(
            decode_pages(&[1, 2, 3]),
            Err(StorageError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn test_take_run_finds_first_contiguous_run() {
        let mut pool: BTreeSet<u64> = [3, 5, 6, 9, 10, 11, 12].into_iter().collect();

        assert_eq!(take_run(&mut pool, 3), Some(9));
        assert_eq!(pool.iter().copied().collect::<Vec<_>>(), vec![3, 5, 6, 12]);

        assert_eq!(take_run(&mut pool, 3), None);
        assert_eq!(take_run(&mut pool, 2), Some(5));
        assert_eq!(take_run(&mut pool, 1), Some(3));
        assert_eq!(take_run(&mut pool, 0), None);
    }
}
