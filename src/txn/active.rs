//! Registry of open transactions.
//!
//! Several readers can share one snapshot id, so ids are reference counted.
//! The smallest registered id is the boundary for page reuse.

use crate::types::TransactionId;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Reference counts of open transactions keyed by id
#[derive(Default)]
pub struct ActiveTransactions {
    live: Mutex<BTreeMap<TransactionId, usize>>,
}

impl ActiveTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: TransactionId) {
        *self.live.lock().entry(id).or_insert(0) += 1;
    }

    pub fn unregister(&self, id: TransactionId) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                live.remove(&id);
            }
        }
    }

    /// Smallest open transaction id
    pub fn oldest(&self) -> Option<TransactionId> {
        self.live.lock().keys().next().copied()
    }

    /// Distinct open transaction ids, ascending
    pub fn ids(&self) -> Vec<TransactionId> {
        self.live.lock().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}
