//! Copy-on-write transactions.
//!
//! A transaction starts from a snapshot of the root and free-space tree
//! states. Reads go to the transaction's own dirty pages first, then to page
//! versions still held by the journal, then to the data file. A write
//! transaction never edits a committed page: it copies it to a page it
//! allocated and repoints the parent, so every other snapshot keeps reading
//! the untouched original.

use crate::btree::{self, Slice, TreeIterator, TreeState, TREE_STATE_SIZE};
use crate::env::{CommittedState, EnvInner};
use crate::error::{Result, StorageError};
use crate::journal::JournalEntry;
use crate::page::{PageBuf, TreePage};
use crate::txn::free_space::{self, PAGES_PER_RECORD};
use crate::types::{PageFlags, PageNumber, TransactionFlags, TransactionId, MAX_KEY_SIZE};
use parking_lot::{MutexGuard, RwLockReadGuard};
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// A page as seen by a transaction
pub enum PageRef<'a> {
    /// Private copy owned by this write transaction
    Dirty(&'a PageBuf),
    /// Shared committed version
    Committed(Arc<PageBuf>),
}

impl Deref for PageRef<'_> {
    type Target = PageBuf;

    fn deref(&self) -> &PageBuf {
        match self {
            PageRef::Dirty(page) => page,
            PageRef::Committed(page) => page,
        }
    }
}

impl AsRef<[u8]> for PageRef<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Pages this transaction may reuse
enum FreePool {
    /// Free-space tree not consulted yet
    Unloaded,
    /// Eligible records are being read; allocation grows the file meanwhile
    Loading,
    Loaded(BTreeSet<u64>),
    /// Leftovers were handed back to the free-space tree during commit
    Closed,
}

/// Locks held by a write transaction for its whole lifetime
pub(crate) type WriteGuards<'env> = (RwLockReadGuard<'env, ()>, MutexGuard<'env, ()>);

/// A read or write transaction
pub struct Transaction<'env> {
    env: &'env EnvInner,
    id: TransactionId,
    flags: TransactionFlags,
    root: TreeState,
    free_space: TreeState,
    /// Named tree states read or changed by this transaction
    trees: HashMap<String, TreeState>,
    touched: BTreeSet<String>,
    next_page_number: PageNumber,
    /// Every page allocated by this transaction, by page number
    dirty: HashMap<u64, PageBuf>,
    /// Committed pages this transaction stopped referencing
    freed: BTreeSet<u64>,
    free_pool: FreePool,
    pool_oldest: TransactionId,
    free_chunk_seq: u32,
    flush_guard: Option<RwLockReadGuard<'env, ()>>,
    write_guard: Option<MutexGuard<'env, ()>>,
}

impl<'env> Transaction<'env> {
    /// Start a transaction on `snapshot`; the caller has registered `id`
    pub(crate) fn new(
        env: &'env EnvInner,
        id: TransactionId,
        flags: TransactionFlags,
        snapshot: CommittedState,
        guards: Option<WriteGuards<'env>>,
    ) -> Self {
        let (flush_guard, write_guard) = match guards {
            Some((flush, write)) => (Some(flush), Some(write)),
            None => (None, None),
        };
        Self {
            env,
            id,
            flags,
            root: snapshot.root,
            free_space: snapshot.free_space,
            trees: HashMap::new(),
            touched: BTreeSet::new(),
            next_page_number: snapshot.next_page_number,
            dirty: HashMap::new(),
            freed: BTreeSet::new(),
            free_pool: FreePool::Unloaded,
            pool_oldest: id,
            free_chunk_seq: 0,
            flush_guard,
            write_guard,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn flags(&self) -> TransactionFlags {
        self.flags
    }

    pub fn is_write(&self) -> bool {
        self.flags == TransactionFlags::ReadWrite
    }

    /// State of the tree directory
    pub fn root_state(&self) -> TreeState {
        self.root
    }

    pub fn free_space_state(&self) -> TreeState {
        self.free_space
    }

    /// Next page number this transaction would grow the file to
    pub fn next_page_number(&self) -> PageNumber {
        self.next_page_number
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_write() {
            Ok(())
        } else {
            Err(StorageError::ReadOnlyTransaction)
        }
    }

    // ---- pages ----

    /// Page `page` as this transaction sees it
    pub fn get_page(&self, page: PageNumber) -> Result<PageRef<'_>> {
        if let Some(buf) = self.dirty.get(&page.value()) {
            return Ok(PageRef::Dirty(buf));
        }
        if let Some((_, buf)) = self.env.journal_pages.read().get(&page.value()) {
            return Ok(PageRef::Committed(Arc::clone(buf)));
        }
        Ok(PageRef::Committed(self.env.cache.get(page)?))
    }

    /// Mutable access to a page this transaction allocated
    pub(crate) fn page_mut(&mut self, page: PageNumber) -> Result<&mut PageBuf> {
        let id = self.id;
        self.dirty.get_mut(&page.value()).ok_or_else(|| {
            StorageError::invalid_operation(format!(
                "page {} is not writable in transaction {}",
                page, id
            ))
        })
    }

    /// Make `page` writable, returning the page number to edit
    ///
    /// A committed page is copied to a newly allocated page and freed. When
    /// `parent` is given, its branch node at that index is repointed at the
    /// copy; the parent must already be writable.
    pub(crate) fn modify_page(
        &mut self,
        parent: Option<(PageNumber, usize)>,
        page: PageNumber,
    ) -> Result<PageNumber> {
        self.ensure_writable()?;
        if self.dirty.contains_key(&page.value()) {
            return Ok(page);
        }

        let mut copy = PageBuf::from_bytes(self.get_page(page)?.as_bytes());
        let new_page = self.allocate_pages(1)?;
        TreePage::new(&mut copy)?.set_page_number(new_page);
        self.dirty.insert(new_page.value(), copy);
        self.free_page(page);

        if let Some((parent, index)) = parent {
            let id = self.id;
            let buf = self.dirty.get_mut(&parent.value()).ok_or_else(|| {
                StorageError::invalid_operation(format!(
                    "parent page {} of page {} is not writable in transaction {}",
                    parent, page, id
                ))
            })?;
            TreePage::new(buf)?.set_child(index, new_page)?;
        }
        Ok(new_page)
    }

    /// Allocate `count` consecutive zeroed pages
    ///
    /// Reusable pages are tried first; otherwise the file grows.
    pub(crate) fn allocate_pages(&mut self, count: u64) -> Result<PageNumber> {
        self.ensure_writable()?;
        if matches!(self.free_pool, FreePool::Unloaded) {
            self.load_free_pool()?;
        }

        let reused = match &mut self.free_pool {
            FreePool::Loaded(pool) => free_space::take_run(pool, count),
            _ => None,
        };
        let first = match reused {
            Some(first) => PageNumber::new(first),
            None => {
                let first = self.next_page_number;
                self.next_page_number = first.offset(count);
                first
            }
        };

        for page in first.value()..first.value() + count {
            self.dirty.insert(page, PageBuf::new());
        }
        Ok(first)
    }

    /// Release `page`
    ///
    /// A page allocated by this transaction was never visible to anyone else
    /// and goes straight back to the pool. A committed page is recorded under
    /// this transaction's id at commit.
    pub(crate) fn free_page(&mut self, page: PageNumber) {
        if self.dirty.remove(&page.value()).is_some() {
            if let FreePool::Loaded(pool) = &mut self.free_pool {
                pool.insert(page.value());
                return;
            }
        }
        self.freed.insert(page.value());
    }

    /// Pull every record older than the oldest active transaction into the
    /// private pool, then drop those records from the free-space tree
    fn load_free_pool(&mut self) -> Result<()> {
        self.free_pool = FreePool::Loading;

        let oldest = self
            .env
            .active
            .oldest()
            .map_or(self.id, |oldest| oldest.min(self.id));
        let records = free_space::eligible_records(self, &self.free_space, oldest)?;
        let pool: BTreeSet<u64> = records
            .iter()
            .flat_map(|record| record.pages.iter().copied())
            .collect();
        let pages = pool.len();

        self.pool_oldest = oldest;
        self.free_pool = FreePool::Loaded(pool);

        let mut state = self.free_space;
        for record in &records {
            btree::delete(self, &mut state, &record.key)?;
        }
        self.free_space = state;

        debug!(
            tx_id = self.id,
            oldest,
            records = records.len(),
            pages,
            "txn.free_pool.loaded"
        );
        Ok(())
    }

    /// Write `pages` into the free-space tree under `freed_by`
    fn write_free_records(&mut self, freed_by: TransactionId, pages: &[u64]) -> Result<()> {
        let mut state = self.free_space;
        for chunk in pages.chunks(PAGES_PER_RECORD) {
            let key = free_space::record_key(freed_by, self.free_chunk_seq);
            self.free_chunk_seq += 1;
            if btree::get(self, &state, &key)?.is_some() {
                return Err(StorageError::corruption(format!(
                    "free-space record {}/{} already exists",
                    freed_by,
                    self.free_chunk_seq - 1
                )));
            }
            btree::insert(self, &mut state, &key, &free_space::encode_pages(chunk))?;
        }
        self.free_space = state;
        Ok(())
    }

    /// Record freed pages until recording them frees nothing new
    fn drain_freed(&mut self) -> Result<()> {
        while !self.freed.is_empty() {
            let pages: Vec<u64> = std::mem::take(&mut self.freed).into_iter().collect();
            self.write_free_records(self.id, &pages)?;
        }
        Ok(())
    }

    // ---- named trees ----

    fn check_tree_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(StorageError::invalid_operation("tree name must not be empty"));
        }
        if name.len() > MAX_KEY_SIZE {
            return Err(StorageError::KeyTooLarge {
                size: name.len(),
                max: MAX_KEY_SIZE,
            });
        }
        Ok(())
    }

    fn lookup_tree(&self, name: &str) -> Result<Option<TreeState>> {
        if let Some(state) = self.trees.get(name) {
            return Ok(Some(*state));
        }
        match btree::get(self, &self.root, name.as_bytes())? {
            Some(raw) if raw.len() == TREE_STATE_SIZE => Ok(Some(TreeState::decode(&raw)?)),
            Some(raw) => Err(StorageError::unrecoverable(format!(
                "tree state of '{}' has {} bytes, expected {}",
                name,
                raw.len(),
                TREE_STATE_SIZE
            ))),
            None => Ok(None),
        }
    }

    /// Current state of the named tree
    pub fn tree_state(&self, name: &str) -> Result<TreeState> {
        self.lookup_tree(name)?
            .ok_or_else(|| StorageError::TreeNotFound(name.to_string()))
    }

    pub fn contains_tree(&self, name: &str) -> Result<bool> {
        Ok(self.lookup_tree(name)?.is_some())
    }

    /// Create an empty tree
    pub fn create_tree(&mut self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        Self::check_tree_name(name)?;
        if self.lookup_tree(name)?.is_some() {
            return Err(StorageError::TreeAlreadyExists(name.to_string()));
        }

        let page = self.allocate_pages(1)?;
        TreePage::init(self.page_mut(page)?, page, PageFlags::Leaf);
        self.trees.insert(name.to_string(), TreeState::with_root(page));
        self.touched.insert(name.to_string());
        debug!(tx_id = self.id, tree = name, root = page.value(), "txn.tree.create");
        Ok(())
    }

    /// Delete a tree and free all of its pages
    pub fn delete_tree(&mut self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let state = self.tree_state(name)?;
        btree::free_all(self, &state)?;

        let mut root = self.root;
        btree::delete(self, &mut root, name.as_bytes())?;
        self.root = root;
        self.trees.remove(name);
        self.touched.remove(name);
        debug!(tx_id = self.id, tree = name, pages = state.page_count, "txn.tree.delete");
        Ok(())
    }

    /// Names of all trees, sorted
    pub fn tree_names(&self) -> Result<Vec<String>> {
        let mut names: BTreeSet<String> = BTreeSet::new();
        let mut iter = TreeIterator::new(self, self.root);
        let mut valid = iter.seek(Slice::BeforeAllKeys)?;
        while valid {
            names.insert(String::from_utf8_lossy(&iter.key()?).into_owned());
            valid = iter.move_next()?;
        }
        for name in self.touched.iter() {
            names.insert(name.clone());
        }
        Ok(names.into_iter().collect())
    }

    fn with_tree<T>(
        &mut self,
        name: &str,
        op: impl FnOnce(&mut Self, &mut TreeState) -> Result<T>,
    ) -> Result<T> {
        self.ensure_writable()?;
        let mut state = self.tree_state(name)?;
        let result = op(self, &mut state);
        self.trees.insert(name.to_string(), state);
        self.touched.insert(name.to_string());
        result
    }

    // ---- keyed operations ----

    /// Insert or replace `key` in `tree`
    pub fn add(&mut self, tree: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_tree(tree, |tx, state| btree::insert(tx, state, key, value))
    }

    /// Insert or replace `key` with everything `reader` yields
    pub fn add_reader<R: Read>(&mut self, tree: &str, key: &[u8], mut reader: R) -> Result<()> {
        let mut value = Vec::new();
        reader.read_to_end(&mut value)?;
        self.add(tree, key, &value)
    }

    pub fn read(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.tree_state(tree)?;
        btree::get(self, &state, key)
    }

    /// Remove `key`, returning whether it existed
    pub fn delete(&mut self, tree: &str, key: &[u8]) -> Result<bool> {
        self.with_tree(tree, |tx, state| btree::delete(tx, state, key))
    }

    /// Ordered iterator over `tree`, unpositioned until seeked
    pub fn iterate(&self, tree: &str) -> Result<TreeIterator<'_, 'env>> {
        let state = self.tree_state(tree)?;
        Ok(TreeIterator::new(self, state))
    }

    // ---- commit ----

    fn has_changes(&self) -> bool {
        !self.dirty.is_empty() || !self.freed.is_empty() || !self.touched.is_empty()
    }

    fn persist_tree_states(&mut self) -> Result<()> {
        let touched: Vec<String> = self.touched.iter().cloned().collect();
        let mut root = self.root;
        for name in touched {
            if let Some(state) = self.trees.get(&name).copied() {
                btree::insert(self, &mut root, name.as_bytes(), &state.encode())?;
            }
        }
        self.root = root;
        Ok(())
    }

    /// Make this transaction's changes durable and visible
    ///
    /// Read transactions and write transactions without changes just end.
    pub fn commit(mut self) -> Result<()> {
        if !self.is_write() || !self.has_changes() {
            return Ok(());
        }

        self.persist_tree_states()?;

        if !self.freed.is_empty() && matches!(self.free_pool, FreePool::Unloaded) {
            self.load_free_pool()?;
        }
        self.drain_freed()?;

        let leftovers = match std::mem::replace(&mut self.free_pool, FreePool::Closed) {
            FreePool::Loaded(pool) => pool.into_iter().collect::<Vec<_>>(),
            _ => Vec::new(),
        };
        if !leftovers.is_empty() {
            // Already proven unreachable, so file them under a key every
            // later transaction treats as eligible.
            self.write_free_records(self.pool_oldest.saturating_sub(1), &leftovers)?;
        }
        self.drain_freed()?;

        let mut pages: Vec<(PageNumber, Arc<PageBuf>)> = self
            .dirty
            .drain()
            .map(|(number, page)| (PageNumber::new(number), Arc::new(page)))
            .collect();
        pages.sort_by_key(|(number, _)| *number);

        let entry = Arc::new(JournalEntry {
            transaction_id: self.id,
            next_page_number: self.next_page_number,
            root: self.root,
            free_space: self.free_space,
            pages,
        });
        debug!(
            tx_id = self.id,
            pages = entry.pages.len(),
            returned = leftovers.len(),
            "txn.commit"
        );
        self.env.publish_commit(entry)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.env.active.unregister(self.id);
        drop(self.flush_guard.take());
        drop(self.write_guard.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Environment, EnvironmentOptions};
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Result<Environment> {
        Environment::open(EnvironmentOptions::new(dir).manual_flushing(true))
    }

    #[test]
    fn test_modify_page_copies_once() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open(dir.path())?;
        let mut tx = env.write_transaction()?;

        let original = tx.root_state().root_page;
        let copy = tx.modify_page(None, original)?;
        assert_ne!(copy, original);
        assert!(tx.freed.contains(&original.value()));
        assert_eq!(tx.modify_page(None, copy)?, copy);

        let page = tx.get_page(copy)?;
        assert_eq!(TreePage::new(page.as_bytes())?.page_number(), copy);
        Ok(())
    }

    #[test]
    fn test_freed_dirty_page_is_reused_in_the_same_transaction() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open(dir.path())?;
        let mut tx = env.write_transaction()?;

        let page = tx.allocate_pages(1)?;
        assert!(matches!(tx.free_pool, FreePool::Loaded(_)));
        tx.free_page(page);
        assert!(!tx.freed.contains(&page.value()));
        assert_eq!(tx.allocate_pages(1)?, page);
        Ok(())
    }

    #[test]
    fn test_commit_records_freed_pages_under_its_id() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open(dir.path())?;

        let mut tx = env.write_transaction()?;
        tx.create_tree("t")?;
        let id = tx.id();
        tx.commit()?;

        let reader = env.read_transaction()?;
        let records = free_space::eligible_records(
            &reader,
            &reader.free_space_state(),
            TransactionId::MAX,
        )?;
        let freed_by: Vec<TransactionId> = records
            .iter()
            .map(|r| free_space::decode_record_key(&r.key).map(|(tx, _)| tx))
            .collect::<Result<_>>()?;
        assert!(freed_by.contains(&id));

        // The reader pins its snapshot, so nothing it can reach is eligible.
        let pinned = free_space::eligible_records(&reader, &reader.free_space_state(), id)?;
        assert!(pinned
            .iter()
            .all(|r| free_space::decode_record_key(&r.key).map_or(false, |(tx, _)| tx < id)));
        Ok(())
    }

    #[test]
    fn test_write_methods_need_a_write_transaction() -> Result<()> {
        let dir = tempdir().unwrap();
        let env = open(dir.path())?;
        let mut tx = env.read_transaction()?;
        assert!(matches!(
            tx.allocate_pages(1),
            Err(StorageError::ReadOnlyTransaction)
        ));
        assert!(tx.commit().is_ok());
        Ok(())
    }
}
