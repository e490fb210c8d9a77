//! The storage environment.
//!
//! An environment owns the data file, the journal and the flusher thread. It
//! admits any number of readers and one writer at a time, publishes commits
//! and recovers the newest intact state on open.

use crate::btree::TreeState;
use crate::buffer::PageCache;
use crate::env::flusher::{spawn_flusher, FairnessHint, FlushSignal};
use crate::env::options::{EnvironmentOptions, TransactionsMode, TransactionsModeResult};
use crate::env::report::{build_report, build_stats, EnvironmentStats, StorageReport};
use crate::error::{Result, StorageError};
use crate::journal::{
    apply_logs_to_data_file, recover, ApplyOutcome, JournalEntry, JournalWriter, RecoveryReport,
    JOURNAL_DIR_NAME,
};
use crate::page::{PageBuf, TreePage};
use crate::storage::{FileHeader, FilePager, Pager, DATA_FILE_NAME};
use crate::txn::{ActiveTransactions, Transaction};
use crate::types::{PageFlags, PageNumber, TransactionFlags, TransactionId, PAGE_SIZE};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Tree holding the database id and schema version
pub const METADATA_TREE: &str = "$metadata";

const DB_ID_KEY: &[u8] = b"db-id";
const SCHEMA_VERSION_KEY: &[u8] = b"schema-version";

const ROOT_TREE_PAGE: PageNumber = PageNumber::FIRST_DATA;
const FREE_SPACE_TREE_PAGE: PageNumber = PageNumber(3);

/// The last published commit; snapshots are copies of it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommittedState {
    pub(crate) transaction_id: TransactionId,
    pub(crate) next_page_number: PageNumber,
    pub(crate) root: TreeState,
    pub(crate) free_space: TreeState,
}

impl CommittedState {
    fn from_header(header: &FileHeader) -> Self {
        Self {
            transaction_id: header.transaction_id,
            next_page_number: header.next_page_number(),
            root: header.root,
            free_space: header.free_space,
        }
    }

    fn header(&self, last_synced_transaction: TransactionId) -> FileHeader {
        FileHeader {
            transaction_id: self.transaction_id,
            last_page_number: PageNumber::new(self.next_page_number.value().saturating_sub(1)),
            root: self.root,
            free_space: self.free_space,
            last_synced_transaction,
        }
    }
}

struct ModeState {
    mode: TransactionsMode,
    expires: Option<Instant>,
}

/// Recorded when the data file could not grow
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndOfDiskSpace {
    pub(crate) required: u64,
}

/// State shared by the environment handle, its transactions and the flusher
pub(crate) struct EnvInner {
    pub(crate) options: EnvironmentOptions,
    pub(crate) pager: Arc<dyn Pager>,
    pub(crate) cache: PageCache,
    pub(crate) journal: Mutex<JournalWriter>,
    pub(crate) state: RwLock<CommittedState>,
    /// Committed page versions not yet applied to the data file
    pub(crate) journal_pages: RwLock<HashMap<u64, (TransactionId, Arc<PageBuf>)>>,
    /// Committed entries not yet applied, in commit order
    pub(crate) pending: Mutex<VecDeque<Arc<JournalEntry>>>,
    pub(crate) active: ActiveTransactions,
    pub(crate) write_lock: Mutex<()>,
    /// Held shared by write transactions, exclusively by the applicator
    pub(crate) flush_in_progress: RwLock<()>,
    /// Serializes applicator passes
    pub(crate) flushing: Mutex<()>,
    pub(crate) last_synced: AtomicU64,
    pub(crate) unflushed_pages: AtomicU64,
    mode: Mutex<ModeState>,
    pub(crate) flushing_error: Mutex<Option<StorageError>>,
    end_of_disk_space: Mutex<Option<EndOfDiskSpace>>,
    pub(crate) fairness: FairnessHint,
    poisoned: Mutex<Option<String>>,
    pub(crate) signal: FlushSignal,
    pub(crate) recovery: RecoveryReport,
    db_id: RwLock<Uuid>,
}

impl EnvInner {
    fn check_usable(&self) -> Result<()> {
        if let Some(reason) = self.poisoned.lock().as_ref() {
            return Err(StorageError::unrecoverable(reason.clone()));
        }
        if let Some(err) = self.flushing_error.lock().take() {
            return Err(StorageError::unrecoverable(format!(
                "background flush failed: {}",
                err
            )));
        }
        Ok(())
    }

    fn write_lock_timeout(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or_else(|| self.options.effective_write_lock_timeout())
    }

    /// Open a transaction on the latest committed state
    pub(crate) fn begin(
        &self,
        flags: TransactionFlags,
        timeout: Option<Duration>,
    ) -> Result<Transaction<'_>> {
        self.check_usable()?;

        if flags == TransactionFlags::Read {
            // Registering under the state lock keeps a commit from
            // publishing between reading the id and registering it.
            let state = self.state.read();
            let snapshot = *state;
            self.active.register(snapshot.transaction_id);
            drop(state);
            return Ok(Transaction::new(
                self,
                snapshot.transaction_id,
                flags,
                snapshot,
                None,
            ));
        }

        self.expire_mode()?;
        self.fairness.yield_if_not_preferred();
        self.try_resume_after_disk_full();

        let timeout = self.write_lock_timeout(timeout);
        let write = match self.write_lock.try_lock_for(timeout) {
            Some(guard) => guard,
            None => {
                // Contention is often an overdue flush holding things up.
                self.signal.request();
                return Err(StorageError::Timeout {
                    what: "the write transaction lock",
                    waited: timeout,
                });
            }
        };
        let flush = match self.flush_in_progress.try_read_for(timeout) {
            Some(guard) => guard,
            None => {
                self.signal.request();
                return Err(StorageError::Timeout {
                    what: "the flush lock",
                    waited: timeout,
                });
            }
        };

        let state = self.state.read();
        let snapshot = *state;
        let id = snapshot.transaction_id + 1;
        self.active.register(id);
        drop(state);

        debug!(tx_id = id, "txn.begin");
        Ok(Transaction::new(
            self,
            id,
            flags,
            snapshot,
            Some((flush, write)),
        ))
    }

    fn current_mode(&self) -> TransactionsMode {
        self.mode.lock().mode
    }

    /// Revert an expired transactions mode to Safe
    fn expire_mode(&self) -> Result<()> {
        let expired = {
            let mut mode = self.mode.lock();
            match mode.expires {
                Some(at) if Instant::now() >= at => {
                    let previous = mode.mode;
                    mode.mode = TransactionsMode::Safe;
                    mode.expires = None;
                    Some(previous)
                }
                _ => None,
            }
        };
        if let Some(previous) = expired {
            info!(from = ?previous, to = ?TransactionsMode::Safe, "env.transactions_mode.expired");
            match previous {
                TransactionsMode::Danger => self.truncate_journal()?,
                TransactionsMode::Lazy => self.sync_lazy_commits()?,
                TransactionsMode::Safe => {}
            }
        }
        Ok(())
    }

    /// Fsync the journal and move the header to the latest commit
    ///
    /// Lazy commits reach the journal without an fsync and leave the header
    /// behind; after this they survive a crash like Safe ones.
    fn sync_lazy_commits(&self) -> Result<()> {
        let timeout = self.options.effective_write_lock_timeout();
        let _write = self
            .write_lock
            .try_lock_for(timeout)
            .ok_or(StorageError::Timeout {
                what: "the write transaction lock",
                waited: timeout,
            })?;
        let _flush = self
            .flush_in_progress
            .try_read_for(timeout)
            .ok_or(StorageError::Timeout {
                what: "the flush lock",
                waited: timeout,
            })?;

        self.journal.lock().sync()?;
        let header = self
            .state
            .read()
            .header(self.last_synced.load(Ordering::Acquire));
        header.write_to(&*self.pager)?;
        self.pager.sync()?;
        info!(tx_id = header.transaction_id, "env.lazy_commits.synced");
        Ok(())
    }

    /// Write a committed transaction to the journal and make it visible
    ///
    /// Any failure here leaves the environment unusable until reopened.
    pub(crate) fn publish_commit(&self, entry: Arc<JournalEntry>) -> Result<()> {
        let mode = self.current_mode();
        let tx_id = entry.transaction_id;

        if let Err(err) = self.write_commit(&entry, mode) {
            let reason = format!(
                "commit of transaction {} failed after journal writing started: {}",
                tx_id, err
            );
            error!(tx_id, error = %err, "txn.commit.failed");
            *self.poisoned.lock() = Some(reason.clone());
            return Err(StorageError::Unrecoverable(reason));
        }

        *self.state.write() = CommittedState {
            transaction_id: tx_id,
            next_page_number: entry.next_page_number,
            root: entry.root,
            free_space: entry.free_space,
        };

        let pages = entry.pages.len() as u64;
        let unflushed = self.unflushed_pages.fetch_add(pages, Ordering::AcqRel) + pages;
        if mode != TransactionsMode::Lazy
            && !self.options.manual_flushing
            && unflushed >= self.options.max_unflushed_pages_before_flush
        {
            self.signal.request();
        }
        Ok(())
    }

    fn write_commit(&self, entry: &Arc<JournalEntry>, mode: TransactionsMode) -> Result<()> {
        let safe = mode == TransactionsMode::Safe;
        self.journal.lock().append(entry, safe)?;

        {
            let mut table = self.journal_pages.write();
            for (number, page) in &entry.pages {
                table.insert(number.value(), (entry.transaction_id, Arc::clone(page)));
            }
        }
        self.pending.lock().push_back(Arc::clone(entry));

        if safe {
            // The journal is synced, so the header may now point past the
            // data file contents.
            let header = CommittedState {
                transaction_id: entry.transaction_id,
                next_page_number: entry.next_page_number,
                root: entry.root,
                free_space: entry.free_space,
            }
            .header(self.last_synced.load(Ordering::Acquire));
            header.write_to(&*self.pager)?;
            self.pager.sync()?;
        }
        Ok(())
    }

    pub(crate) fn record_end_of_disk_space(&self, required: u64) {
        *self.end_of_disk_space.lock() = Some(EndOfDiskSpace { required });
    }

    pub(crate) fn is_out_of_disk_space(&self) -> bool {
        self.end_of_disk_space.lock().is_some()
    }

    /// Clear a recorded disk-full condition once the space exists again
    fn try_resume_after_disk_full(&self) {
        let required = match *self.end_of_disk_space.lock() {
            Some(event) => event.required,
            None => return,
        };

        let available = fs2::available_space(&self.options.path).unwrap_or(0);
        let within_cap = match self.pager.max_storage_size() {
            Some(max) => {
                self.pager.number_of_allocated_pages() * PAGE_SIZE as u64 + required <= max
            }
            None => true,
        };
        if available >= required && within_cap {
            *self.end_of_disk_space.lock() = None;
            info!(required, available, "env.disk_space.resumed");
            self.signal.request();
        }
    }

    fn disk_full_error(&self) -> Option<StorageError> {
        let required = self.end_of_disk_space.lock().map(|event| event.required)?;
        Some(StorageError::DiskFull {
            required,
            available: fs2::available_space(&self.options.path).unwrap_or(0),
        })
    }

    /// Apply all pending entries now, failing instead of waiting forever
    fn flush_now(&self) -> Result<ApplyOutcome> {
        self.try_resume_after_disk_full();
        if let Some(err) = self.disk_full_error() {
            return Err(err);
        }
        let timeout = self.options.effective_write_lock_timeout();
        match apply_logs_to_data_file(self, timeout)? {
            ApplyOutcome::LockTimeout => Err(StorageError::Timeout {
                what: "the flush lock",
                waited: timeout,
            }),
            outcome => Ok(outcome),
        }
    }

    /// Apply everything and delete all journal files
    fn truncate_journal(&self) -> Result<()> {
        let timeout = self.options.effective_write_lock_timeout();
        let _write = self
            .write_lock
            .try_lock_for(timeout)
            .ok_or(StorageError::Timeout {
                what: "the write transaction lock",
                waited: timeout,
            })?;

        self.flush_now()?;
        let removed = {
            let _flushing = self.flushing.lock();
            self.journal
                .lock()
                .recycle(self.last_synced.load(Ordering::Acquire))?
        };
        info!(removed, "env.journal.truncated");
        Ok(())
    }

    fn set_transaction_mode(
        &self,
        mode: TransactionsMode,
        duration: Option<Duration>,
    ) -> Result<TransactionsModeResult> {
        let previous = self.current_mode();
        if previous == mode {
            return Ok(TransactionsModeResult::ModeAlreadySet);
        }
        if previous == TransactionsMode::Danger || mode == TransactionsMode::Danger {
            self.truncate_journal()?;
        }

        {
            let mut state = self.mode.lock();
            state.mode = mode;
            state.expires = duration
                .filter(|d| !d.is_zero())
                .map(|d| Instant::now() + d);
        }
        info!(from = ?previous, to = ?mode, "env.transactions_mode");

        // Truncating for Danger already applied and synced everything.
        if previous == TransactionsMode::Lazy && mode != TransactionsMode::Danger {
            self.sync_lazy_commits()?;
        }
        Ok(TransactionsModeResult::SetModeSuccessfully)
    }
}

/// Handle to an open environment
///
/// Dropping the handle performs the same shutdown as [`Environment::close`],
/// logging instead of returning errors.
pub struct Environment {
    inner: Arc<EnvInner>,
    flusher: Option<JoinHandle<()>>,
    closed: bool,
}

impl Environment {
    /// Open or create the environment at `options.path`
    pub fn open(options: EnvironmentOptions) -> Result<Self> {
        fs::create_dir_all(&options.path)?;
        let pager: Arc<dyn Pager> = Arc::new(FilePager::open(
            &options.path.join(DATA_FILE_NAME),
            options.max_storage_size,
        )?);
        let journal_dir = options.path.join(JOURNAL_DIR_NAME);

        let recovered = recover(&*pager, &journal_dir)?;
        let fresh = recovered.is_none();
        let (state, last_synced, report, next_journal_number) = match recovered {
            Some(recovered) => (
                CommittedState::from_header(&recovered.header),
                recovered.header.last_synced_transaction,
                recovered.report,
                recovered.next_journal_number,
            ),
            None => (init_data_file(&*pager)?, 0, RecoveryReport::default(), 1),
        };

        let journal = JournalWriter::create(
            &journal_dir,
            options.max_journal_file_size,
            next_journal_number,
        )?;
        let cache = PageCache::new(Arc::clone(&pager), options.page_cache_capacity);
        let mode = ModeState {
            mode: options.transactions_mode,
            expires: None,
        };

        let inner = Arc::new(EnvInner {
            options,
            pager,
            cache,
            journal: Mutex::new(journal),
            state: RwLock::new(state),
            journal_pages: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            active: ActiveTransactions::new(),
            write_lock: Mutex::new(()),
            flush_in_progress: RwLock::new(()),
            flushing: Mutex::new(()),
            last_synced: AtomicU64::new(last_synced),
            unflushed_pages: AtomicU64::new(0),
            mode: Mutex::new(mode),
            flushing_error: Mutex::new(None),
            end_of_disk_space: Mutex::new(None),
            fairness: FairnessHint::new(),
            poisoned: Mutex::new(None),
            signal: FlushSignal::new(),
            recovery: report,
            db_id: RwLock::new(Uuid::nil()),
        });

        let mut env = Self {
            inner: Arc::clone(&inner),
            flusher: None,
            closed: false,
        };
        if fresh {
            env.create_metadata()?;
        } else {
            env.validate_metadata()?;
        }
        env.flusher = Some(spawn_flusher(inner)?);

        info!(
            path = %env.inner.options.path.display(),
            fresh,
            db_id = %env.db_id(),
            last_transaction = env.inner.state.read().transaction_id,
            "env.open"
        );
        Ok(env)
    }

    fn create_metadata(&self) -> Result<()> {
        let db_id = Uuid::new_v4();
        let mut tx = self.write_transaction()?;
        tx.create_tree(METADATA_TREE)?;
        tx.add(METADATA_TREE, DB_ID_KEY, db_id.as_bytes())?;
        tx.add(
            METADATA_TREE,
            SCHEMA_VERSION_KEY,
            &self.inner.options.schema_version.to_le_bytes(),
        )?;
        tx.commit()?;

        // Both header slots must exist before the first open counts as done.
        self.inner.flush_now()?;
        *self.inner.db_id.write() = db_id;
        Ok(())
    }

    fn validate_metadata(&self) -> Result<()> {
        let tx = self.read_transaction()?;
        if !tx.contains_tree(METADATA_TREE)? {
            return Err(StorageError::unrecoverable(format!(
                "the '{}' tree is missing",
                METADATA_TREE
            )));
        }

        let raw_id = tx
            .read(METADATA_TREE, DB_ID_KEY)?
            .ok_or_else(|| StorageError::unrecoverable("the database id is missing"))?;
        let db_id = Uuid::from_slice(&raw_id).map_err(|_| {
            StorageError::unrecoverable(format!(
                "the database id has {} bytes, expected 16",
                raw_id.len()
            ))
        })?;

        let raw_version = tx
            .read(METADATA_TREE, SCHEMA_VERSION_KEY)?
            .ok_or_else(|| StorageError::unrecoverable("the schema version is missing"))?;
        let version: [u8; 4] = raw_version.as_slice().try_into().map_err(|_| {
            StorageError::unrecoverable(format!(
                "the schema version has {} bytes, expected 4",
                raw_version.len()
            ))
        })?;
        let version = u32::from_le_bytes(version);
        let expected = self.inner.options.schema_version;
        if expected != 0 && version != expected {
            return Err(StorageError::unrecoverable(format!(
                "schema version is {}, expected {}",
                version, expected
            )));
        }

        drop(tx);
        *self.inner.db_id.write() = db_id;
        Ok(())
    }

    /// Start a transaction; `timeout` bounds the wait for the write lock
    pub fn begin_transaction(
        &self,
        flags: TransactionFlags,
        timeout: Option<Duration>,
    ) -> Result<Transaction<'_>> {
        self.inner.begin(flags, timeout)
    }

    pub fn read_transaction(&self) -> Result<Transaction<'_>> {
        self.begin_transaction(TransactionFlags::Read, None)
    }

    pub fn write_transaction(&self) -> Result<Transaction<'_>> {
        self.begin_transaction(TransactionFlags::ReadWrite, None)
    }

    pub fn options(&self) -> &EnvironmentOptions {
        &self.inner.options
    }

    pub fn path(&self) -> &Path {
        &self.inner.options.path
    }

    /// Id generated when the environment was created
    pub fn db_id(&self) -> Uuid {
        *self.inner.db_id.read()
    }

    /// What recovery did when this environment was opened
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.inner.recovery
    }

    pub fn transactions_mode(&self) -> TransactionsMode {
        self.inner.current_mode()
    }

    /// Switch durability mode, optionally reverting to Safe after `duration`
    ///
    /// Entering or leaving Danger applies and truncates the journal first.
    /// Leaving Lazy makes every earlier Lazy commit durable before returning.
    pub fn set_transaction_mode(
        &self,
        mode: TransactionsMode,
        duration: Option<Duration>,
    ) -> Result<TransactionsModeResult> {
        self.inner.set_transaction_mode(mode, duration)
    }

    /// Apply the journal to the data file; only with manual flushing
    pub fn flush_log_to_data_file(&self) -> Result<()> {
        if !self.inner.options.manual_flushing {
            return Err(StorageError::invalid_operation(
                "explicit flushes require manual flushing to be enabled",
            ));
        }
        self.force_log_flush_to_data_file()
    }

    /// Apply the journal to the data file now, whatever the flushing mode
    pub fn force_log_flush_to_data_file(&self) -> Result<()> {
        self.inner.flush_now().map(|_| ())
    }

    /// Fsync the data file
    pub fn sync_data_file(&self) -> Result<()> {
        let _flushing = self.inner.flushing.lock();
        self.inner.pager.sync()
    }

    /// Ask the flusher to fsync the data file without waiting for it
    ///
    /// A failed sync is reported by the next `begin_transaction`.
    pub fn queue_sync_data_file(&self) {
        self.inner.signal.request_sync();
    }

    /// Apply every pending entry and delete all journal files
    pub fn truncate_journal(&self) -> Result<()> {
        self.inner.truncate_journal()
    }

    /// Change the cap on the data file size; `None` removes it
    pub fn set_max_storage_size(&self, max: Option<u64>) {
        self.inner.pager.set_max_storage_size(max);
        info!(max = ?max, "env.max_storage_size");
        self.inner.try_resume_after_disk_full();
    }

    /// Whether flushing is paused for lack of space
    pub fn is_out_of_disk_space(&self) -> bool {
        self.inner.is_out_of_disk_space()
    }

    pub fn stats(&self) -> Result<EnvironmentStats> {
        let tx = self.read_transaction()?;
        build_stats(&self.inner, &tx)
    }

    /// Per-tree page and entry breakdown as seen by `tx`
    pub fn generate_report(&self, tx: &Transaction<'_>) -> Result<StorageReport> {
        build_report(&self.inner, tx)
    }

    /// Stop the flusher, finish pending work and release the files
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut errors = Vec::new();
        self.inner.signal.shutdown();
        if let Some(handle) = self.flusher.take() {
            if handle.join().is_err() {
                errors.push(StorageError::unrecoverable("the flusher thread panicked"));
            }
        }

        let usable = self.inner.poisoned.lock().is_none() && !self.inner.is_out_of_disk_space();
        if usable {
            if let Err(err) = apply_logs_to_data_file(&self.inner, Duration::from_secs(5)) {
                errors.push(err);
            }
        }

        {
            // An applicator pass that is still running finishes first.
            let _flushing = self.inner.flushing.lock();
            if let Err(err) = self.inner.journal.lock().sync() {
                errors.push(err);
            }
            if let Err(err) = self.inner.pager.sync() {
                errors.push(err);
            }
        }
        if let Some(err) = self.inner.flushing_error.lock().take() {
            errors.push(err);
        }

        info!(
            path = %self.inner.options.path.display(),
            errors = errors.len(),
            "env.close"
        );
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(StorageError::Aggregate(errors)),
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(error = %err, "env.close.failed");
        }
    }
}

/// Lay out an empty data file: header slots plus empty root and free-space
/// trees
fn init_data_file(pager: &dyn Pager) -> Result<CommittedState> {
    pager.ensure_allocated(FREE_SPACE_TREE_PAGE.value() + 1)?;
    for page in [ROOT_TREE_PAGE, FREE_SPACE_TREE_PAGE] {
        let leaf = TreePage::init(PageBuf::new(), page, PageFlags::Leaf);
        pager.write_page(page, &leaf.into_inner())?;
    }
    pager.sync()?;

    Ok(CommittedState {
        transaction_id: 0,
        next_page_number: FREE_SPACE_TREE_PAGE.offset(1),
        root: TreeState::with_root(ROOT_TREE_PAGE),
        free_space: TreeState::with_root(FREE_SPACE_TREE_PAGE),
    })
}
