//! Environment statistics and storage reports.

use crate::btree::TreeState;
use crate::env::EnvInner;
use crate::error::Result;
use crate::journal::{JournalFileInfo, RecoveryReport};
use crate::txn::{free_space, Transaction};
use crate::types::{TransactionId, PAGE_SIZE};
use serde::Serialize;
use std::sync::atomic::Ordering;

/// Name under which the tree directory shows up in reports
pub const ROOT_TREE_NAME: &str = "$root";

/// Name under which the free-space tree shows up in reports
pub const FREE_SPACE_TREE_NAME: &str = "$free-space";

/// Point-in-time sizes and transaction bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentStats {
    pub allocated_data_file_bytes: u64,
    pub used_data_file_bytes: u64,
    pub allocated_pages: u64,
    /// Pages below the next page number, header slots included
    pub used_pages: u64,
    /// Allocated pages past the next page number
    pub unallocated_pages_at_end: u64,
    /// Pages waiting in the free-space tree
    pub free_pages: u64,
    pub free_pages_overhead_bytes: u64,
    pub root_pages: u64,
    pub free_space_tree_pages: u64,
    pub last_committed_transaction: TransactionId,
    pub next_write_transaction: TransactionId,
    pub active_transactions: Vec<TransactionId>,
    pub journal_files: usize,
    pub unflushed_pages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataFileReport {
    pub allocated_pages: u64,
    pub used_pages: u64,
    pub free_pages: u64,
    pub allocated_bytes: u64,
    pub used_bytes: u64,
}

/// One tree in a [`StorageReport`]
#[derive(Debug, Clone, Serialize)]
pub struct TreeReport {
    pub name: String,
    #[serde(flatten)]
    pub state: TreeState,
}

/// Per-tree breakdown as seen by one transaction
#[derive(Debug, Clone, Serialize)]
pub struct StorageReport {
    pub transaction_id: TransactionId,
    pub data_file: DataFileReport,
    pub journal: Vec<JournalFileInfo>,
    pub trees: Vec<TreeReport>,
    pub recovery: RecoveryReport,
}

pub(crate) fn build_stats(env: &EnvInner, tx: &Transaction<'_>) -> Result<EnvironmentStats> {
    let allocated_pages = env.pager.number_of_allocated_pages();
    let used_pages = tx.next_page_number().value();
    let free_pages = free_space::count_free_pages(tx, &tx.free_space_state())?;
    let journal_files = env.journal.lock().files().len();

    Ok(EnvironmentStats {
        allocated_data_file_bytes: allocated_pages * PAGE_SIZE as u64,
        used_data_file_bytes: used_pages * PAGE_SIZE as u64,
        allocated_pages,
        used_pages,
        unallocated_pages_at_end: allocated_pages.saturating_sub(used_pages),
        free_pages,
        free_pages_overhead_bytes: free_pages * PAGE_SIZE as u64,
        root_pages: tx.root_state().page_count,
        free_space_tree_pages: tx.free_space_state().page_count,
        last_committed_transaction: tx.id(),
        next_write_transaction: tx.id() + 1,
        active_transactions: env.active.ids(),
        journal_files,
        unflushed_pages: env.unflushed_pages.load(Ordering::Acquire),
    })
}

pub(crate) fn build_report(env: &EnvInner, tx: &Transaction<'_>) -> Result<StorageReport> {
    let allocated_pages = env.pager.number_of_allocated_pages();
    let used_pages = tx.next_page_number().value();
    let free_pages = free_space::count_free_pages(tx, &tx.free_space_state())?;

    let mut trees = vec![
        TreeReport {
            name: ROOT_TREE_NAME.to_string(),
            state: tx.root_state(),
        },
        TreeReport {
            name: FREE_SPACE_TREE_NAME.to_string(),
            state: tx.free_space_state(),
        },
    ];
    for name in tx.tree_names()? {
        let state = tx.tree_state(&name)?;
        trees.push(TreeReport { name, state });
    }

    Ok(StorageReport {
        transaction_id: tx.id(),
        data_file: DataFileReport {
            allocated_pages,
            used_pages,
            free_pages,
            allocated_bytes: allocated_pages * PAGE_SIZE as u64,
            used_bytes: used_pages * PAGE_SIZE as u64,
        },
        journal: env.journal.lock().files().to_vec(),
        trees,
        recovery: env.recovery.clone(),
    })
}
