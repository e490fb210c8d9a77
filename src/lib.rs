//! # pagestore
//!
//! An embedded, transactional key/value storage engine built from copy-on-write
//! B+Trees in a single data file, with a write-ahead journal for durability.
//!
//! ## Architecture
//!
//! - **Page Layer** (`page`): Slotted tree pages and overflow runs
//! - **Storage Layer** (`storage`): Data file I/O and the alternating file header
//! - **Page Cache** (`buffer`): LRU cache of committed data file pages
//! - **B-Tree Layer** (`btree`): Tree operations and ordered iteration
//! - **Transactions** (`txn`): Snapshots, copy-on-write and page reuse
//! - **Journal** (`journal`): Commit log, applicator and startup recovery
//! - **Environment** (`env`): Admission, flushing, modes and reports
//!
//! Any number of read transactions run alongside one write transaction. Each
//! reader sees the state that was committed when it began; pages freed by a
//! writer are only reused once no open transaction can still reach them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pagestore::{Environment, EnvironmentOptions, Slice};
//!
//! # fn main() -> pagestore::Result<()> {
//! let env = Environment::open(EnvironmentOptions::new("/tmp/my-env"))?;
//!
//! let mut tx = env.write_transaction()?;
//! tx.create_tree("users")?;
//! tx.add("users", b"alice", b"admin")?;
//! tx.commit()?;
//!
//! let tx = env.read_transaction()?;
//! assert_eq!(tx.read("users", b"alice")?, Some(b"admin".to_vec()));
//!
//! let mut it = tx.iterate("users")?;
//! it.seek(Slice::BeforeAllKeys)?;
//! for entry in it.entries() {
//!     let (key, value) = entry?;
//!     println!("{:?} -> {:?}", key, value);
//! }
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod buffer;
pub mod env;
pub mod error;
pub mod journal;
pub mod page;
pub mod storage;
pub mod txn;
pub mod types;

pub use btree::{Entries, Slice, TreeIterator, TreeState};
pub use env::{
    Environment, EnvironmentOptions, EnvironmentStats, StorageReport, TransactionsMode,
    TransactionsModeResult, METADATA_TREE,
};
pub use error::{Result, StorageError};
pub use journal::RecoveryReport;
pub use txn::Transaction;
pub use types::{PageNumber, TransactionFlags, TransactionId, PAGE_SIZE};

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Result<Environment> {
        Environment::open(EnvironmentOptions::new(dir).manual_flushing(true))
    }

    #[test]
    fn test_basic_operations() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open(dir.path())?;

        let mut tx = env.write_transaction()?;
        tx.create_tree("t")?;

        // Test add and read
        tx.add("t", b"key1", b"value1")?;
        assert_eq!(tx.read("t", b"key1")?, Some(b"value1".to_vec()));

        // Test update
        tx.add("t", b"key1", b"value2")?;
        assert_eq!(tx.read("t", b"key1")?, Some(b"value2".to_vec()));

        // Test delete
        assert!(tx.delete("t", b"key1")?);
        assert_eq!(tx.read("t", b"key1")?, None);

        // Test non-existent key
        assert_eq!(tx.read("t", b"nonexistent")?, None);
        assert!(!tx.delete("t", b"nonexistent")?);
        tx.commit()?;

        Ok(())
    }

    #[test]
    fn test_range_scan() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open(dir.path())?;

        let mut tx = env.write_transaction()?;
        tx.create_tree("fruit")?;
        tx.add("fruit", b"apple", b"1")?;
        tx.add("fruit", b"banana", b"2")?;
        tx.add("fruit", b"cherry", b"3")?;
        tx.add("fruit", b"date", b"4")?;
        tx.commit()?;

        let tx = env.read_transaction()?;

        // Full scan
        let mut it = tx.iterate("fruit")?;
        it.seek(Slice::BeforeAllKeys)?;
        assert_eq!(it.entries().count(), 4);

        // Seek lands on the first key at or after the target
        let mut it = tx.iterate("fruit")?;
        assert!(it.seek(Slice::Key(b"bb"))?);
        let keys: Vec<Vec<u8>> = it
            .entries()
            .map(|e| e.map(|(k, _)| k))
            .collect::<Result<_>>()?;
        assert_eq!(keys, vec![b"cherry".to_vec(), b"date".to_vec()]);

        // Backwards from the end
        let mut it = tx.iterate("fruit")?;
        assert!(it.seek(Slice::AfterAllKeys)?);
        assert_eq!(it.key()?, b"date".to_vec());
        assert!(it.move_prev()?);
        assert_eq!(it.key()?, b"cherry".to_vec());

        Ok(())
    }
}
