//! B+Tree over copy-on-write pages.
//!
//! This module provides the tree operations every tree in the environment is
//! built from, the root directory and the free-space tree included:
//! - Point lookups (get)
//! - Insertions and replacements (insert)
//! - Deletions with page merging (delete)
//! - Ordered iteration in both directions (TreeIterator)

mod cursor;
mod iterator;
mod state;
mod tree;

pub use iterator::{Entries, Slice, TreeIterator};
pub use state::{TreeState, TREE_STATE_SIZE};
pub(crate) use tree::{delete, free_all, get, insert};
