//! Copies journaled pages into the data file.
//!
//! Page writes and the data file sync happen without blocking writers. Only
//! the final step, which drops the in-memory page versions, moves the file
//! header forward and recycles journal files, runs under the exclusive flush
//! lock that write transactions hold shared.

use crate::env::EnvInner;
use crate::error::Result;
use crate::page::PageBuf;
use crate::storage::FileHeader;
use crate::types::{PageNumber, TransactionId};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What one applicator pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyOutcome {
    NothingToApply,
    Applied {
        up_to: TransactionId,
        pages: usize,
    },
    /// A write transaction kept the flush lock for the whole budget
    LockTimeout,
}

/// Apply every pending journal entry to the data file
pub(crate) fn apply_logs_to_data_file(env: &EnvInner, lock_timeout: Duration) -> Result<ApplyOutcome> {
    let _flushing = env.flushing.lock();

    let entries: Vec<_> = env.pending.lock().iter().cloned().collect();
    let up_to = match entries.last() {
        Some(entry) => entry.transaction_id,
        None => return Ok(ApplyOutcome::NothingToApply),
    };

    let mut latest: BTreeMap<u64, Arc<PageBuf>> = BTreeMap::new();
    let mut journaled_pages = 0u64;
    for entry in &entries {
        journaled_pages += entry.pages.len() as u64;
        for (number, page) in &entry.pages {
            latest.insert(number.value(), Arc::clone(page));
        }
    }

    if let Some((&max_page, _)) = latest.iter().next_back() {
        if let Err(err) = env.pager.ensure_allocated(max_page + 1) {
            if err.is_disk_full() {
                let required = (max_page + 1).saturating_sub(env.pager.number_of_allocated_pages())
                    * crate::types::PAGE_SIZE as u64;
                env.record_end_of_disk_space(required);
                warn!(up_to, required, error = %err, "applicator.disk_full");
            }
            return Err(err);
        }
    }
    for (number, page) in &latest {
        env.pager.write_page(PageNumber::new(*number), page)?;
    }
    env.pager.sync()?;

    env.fairness.prefer_current_thread();
    let exclusive = env.flush_in_progress.try_write_for(lock_timeout);
    let _exclusive = match exclusive {
        Some(guard) => guard,
        None => {
            env.fairness.clear();
            debug!(up_to, waited_ms = lock_timeout.as_millis() as u64, "applicator.lock_timeout");
            return Ok(ApplyOutcome::LockTimeout);
        }
    };
    env.fairness.clear();

    for number in latest.keys() {
        env.cache.invalidate(PageNumber::new(*number));
    }
    env.journal_pages
        .write()
        .retain(|_, (transaction_id, _)| *transaction_id > up_to);
    {
        let mut pending = env.pending.lock();
        let applied = entries.len().min(pending.len());
        pending.drain(..applied);
    }
    env.last_synced.store(up_to, Ordering::Release);

    // Entries past `up_to` are described by the header below, so they must
    // be durable before it is.
    let mut journal = env.journal.lock();
    journal.sync()?;

    let state = *env.state.read();
    let header = FileHeader {
        transaction_id: state.transaction_id,
        last_page_number: PageNumber::new(state.next_page_number.value().saturating_sub(1)),
        root: state.root,
        free_space: state.free_space,
        last_synced_transaction: up_to,
    };
    header.write_both_slots(&*env.pager)?;
    let recycled = journal.recycle(up_to)?;
    drop(journal);

    let _ = env
        .unflushed_pages
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
            Some(pending.saturating_sub(journaled_pages))
        });

    debug!(
        up_to,
        entries = entries.len(),
        pages = latest.len(),
        recycled,
        "applicator.apply"
    );
    Ok(ApplyOutcome::Applied {
        up_to,
        pages: latest.len(),
    })
}
