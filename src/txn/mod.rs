//! Transactions: snapshots, copy-on-write pages and free-page reuse.

mod active;
pub(crate) mod free_space;
mod transaction;

pub use active::ActiveTransactions;
pub use transaction::{PageRef, Transaction};
