//! Ordered iteration over a tree snapshot.
//!
//! The iterator keeps the root-to-leaf path of its position, so stepping to
//! the neighbouring leaf only walks up to the first ancestor that has a
//! sibling on that side.

use crate::btree::tree::node_value;
use crate::btree::TreeState;
use crate::error::{Result, StorageError};
use crate::page::TreePage;
use crate::txn::Transaction;
use crate::types::PageNumber;

/// Seek target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slice<'a> {
    /// The first entry
    BeforeAllKeys,
    /// The last entry
    AfterAllKeys,
    /// The first entry whose key is greater than or equal to this one
    Key(&'a [u8]),
}

#[derive(Clone, Copy)]
enum Edge {
    First,
    Last,
}

/// Cursor over the entries of one tree
pub struct TreeIterator<'t, 'env> {
    tx: &'t Transaction<'env>,
    state: TreeState,
    path: Vec<(PageNumber, usize)>,
    valid: bool,
}

impl<'t, 'env> TreeIterator<'t, 'env> {
    pub(crate) fn new(tx: &'t Transaction<'env>, state: TreeState) -> Self {
        Self {
            tx,
            state,
            path: Vec::new(),
            valid: false,
        }
    }

    /// Whether the iterator sits on an entry
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Position the iterator; returns whether an entry was found
    pub fn seek(&mut self, target: Slice<'_>) -> Result<bool> {
        self.path.clear();
        self.valid = false;

        let mut page_number = self.state.root_page;
        loop {
            let (index, count, child) = {
                let page = self.tx.get_page(page_number)?;
                let view = TreePage::new(page.as_bytes())?;
                let count = view.count();
                let index = match target {
                    Slice::BeforeAllKeys => 0,
                    Slice::AfterAllKeys => count.saturating_sub(1),
                    Slice::Key(key) => view.search(key)?.position,
                };
                let child = if view.is_branch() {
                    Some(view.child(index)?)
                } else {
                    None
                };
                (index, count, child)
            };
            self.path.push((page_number, index));

            match child {
                Some(child) => page_number = child,
                None => {
                    if index < count {
                        self.valid = true;
                        return Ok(true);
                    }
                    // Every key on this leaf is smaller than the target.
                    return match target {
                        Slice::Key(_) if count > 0 => self.step_leaf(true),
                        _ => Ok(false),
                    };
                }
            }
        }
    }

    /// Advance to the next entry
    pub fn move_next(&mut self) -> Result<bool> {
        if !self.valid {
            return Ok(false);
        }
        let last = self.path.len() - 1;
        let (page_number, index) = self.path[last];
        if index + 1 < self.count(page_number)? {
            self.path[last].1 += 1;
            return Ok(true);
        }
        self.step_leaf(true)
    }

    /// Step back to the previous entry
    pub fn move_prev(&mut self) -> Result<bool> {
        if !self.valid {
            return Ok(false);
        }
        let last = self.path.len() - 1;
        if self.path[last].1 > 0 {
            self.path[last].1 -= 1;
            return Ok(true);
        }
        self.step_leaf(false)
    }

    fn count(&self, page_number: PageNumber) -> Result<usize> {
        Ok(TreePage::new(self.tx.get_page(page_number)?.as_bytes())?.count())
    }

    /// Move to the first entry of the next leaf, or the last of the previous
    fn step_leaf(&mut self, forward: bool) -> Result<bool> {
        self.path.pop();
        while let Some((page_number, index)) = self.path.pop() {
            let count = self.count(page_number)?;
            if forward && index + 1 < count {
                self.path.push((page_number, index + 1));
                return self.descend(Edge::First);
            }
            if !forward && index > 0 {
                self.path.push((page_number, index - 1));
                return self.descend(Edge::Last);
            }
        }
        self.valid = false;
        Ok(false)
    }

    /// Follow the child at the end of the path down to a leaf edge
    fn descend(&mut self, edge: Edge) -> Result<bool> {
        loop {
            let last = self.path.len() - 1;
            let (branch, index) = self.path[last];
            let child = TreePage::new(self.tx.get_page(branch)?.as_bytes())?.child(index)?;

            let (is_leaf, count) = {
                let page = self.tx.get_page(child)?;
                let view = TreePage::new(page.as_bytes())?;
                (view.is_leaf(), view.count())
            };
            let index = match edge {
                Edge::First => 0,
                Edge::Last => count.saturating_sub(1),
            };
            self.path.push((child, index));

            if is_leaf {
                self.valid = count > 0;
                return Ok(self.valid);
            }
        }
    }

    fn position(&self) -> Result<(PageNumber, usize)> {
        match self.path.last() {
            Some(&position) if self.valid => Ok(position),
            _ => Err(StorageError::invalid_operation(
                "iterator is not positioned on an entry",
            )),
        }
    }

    /// Key of the current entry
    pub fn key(&self) -> Result<Vec<u8>> {
        let (leaf, index) = self.position()?;
        Ok(TreePage::new(self.tx.get_page(leaf)?.as_bytes())?
            .key(index)?
            .to_vec())
    }

    /// Value of the current entry, read from overflow pages when needed
    pub fn value(&self) -> Result<Vec<u8>> {
        let (leaf, index) = self.position()?;
        let node = TreePage::new(self.tx.get_page(leaf)?.as_bytes())?.node(index)?;
        node_value(self.tx, node)
    }

    /// Key and value of the current entry
    pub fn current(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.valid {
            return Ok(None);
        }
        Ok(Some((self.key()?, self.value()?)))
    }

    /// Entries from the current position onward
    pub fn entries(self) -> Entries<'t, 'env> {
        Entries {
            started: false,
            done: !self.valid,
            inner: self,
        }
    }
}

/// [`Iterator`] over `(key, value)` pairs, see [`TreeIterator::entries`]
pub struct Entries<'t, 'env> {
    inner: TreeIterator<'t, 'env>,
    started: bool,
    done: bool,
}

impl Iterator for Entries<'_, '_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.started {
            match self.inner.move_next() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        self.started = true;

        match self.inner.current() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
