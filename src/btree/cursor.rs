//! Root-to-leaf path used by mutations.
//!
//! The cursor remembers, for every level, the page visited and the node
//! index taken within it. Mutations first make the whole path writable so
//! splits and merges can edit parents in place.

use crate::btree::TreeState;
use crate::error::{Result, StorageError};
use crate::page::{SearchResult, TreePage};
use crate::txn::Transaction;
use crate::types::PageNumber;

/// Deepest tree accepted before the structure is considered corrupt
const MAX_DEPTH: usize = 64;

/// Path from the root to a leaf position
pub struct Cursor {
    /// (page, node index) per level, root first
    pub path: Vec<(PageNumber, usize)>,
}

impl Cursor {
    /// Descend to the leaf that holds or would hold `key`
    pub fn seek(tx: &Transaction<'_>, state: &TreeState, key: &[u8]) -> Result<(Self, SearchResult)> {
        let mut path = Vec::with_capacity(state.depth as usize);
        let mut page_number = state.root_page;
        loop {
            let page = tx.get_page(page_number)?;
            let view = TreePage::new(page.as_bytes())?;
            let found = view.search(key)?;
            path.push((page_number, found.position));

            if view.is_leaf() {
                return Ok((Self { path }, found));
            }
            if path.len() >= MAX_DEPTH {
                return Err(StorageError::corruption(format!(
                    "tree rooted at {} is deeper than {} levels",
                    state.root_page, MAX_DEPTH
                )));
            }
            page_number = view.child(found.position)?;
        }
    }

    /// Leaf page and position within it
    pub fn leaf(&self) -> (PageNumber, usize) {
        self.path[self.path.len() - 1]
    }

    /// Copy every page on the path into the transaction, root first
    pub fn make_writable(&mut self, tx: &mut Transaction<'_>, state: &mut TreeState) -> Result<()> {
        for level in 0..self.path.len() {
            let parent = if level == 0 {
                None
            } else {
                Some(self.path[level - 1])
            };
            let page = tx.modify_page(parent, self.path[level].0)?;
            self.path[level].0 = page;
            if level == 0 {
                state.root_page = page;
            }
        }
        Ok(())
    }
}
