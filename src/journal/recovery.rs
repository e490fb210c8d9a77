//! Startup recovery: replay journal entries the data file has not seen yet.

use crate::error::Result;
use crate::journal::entry::{JournalEntry, ReadOutcome};
use crate::journal::writer::{journal_file_path, list_journal_files};
use crate::page::PageBuf;
use crate::storage::{FileHeader, Pager};
use crate::types::{PageNumber, TransactionId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// What recovery found and did on open
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Journal files found on open
    pub journal_files: usize,
    /// Transactions replayed into the data file, in order
    pub replayed_transactions: Vec<TransactionId>,
    /// Last committed transaction after recovery
    pub last_transaction: TransactionId,
    /// A torn or corrupt entry was found; later transactions are lost
    pub data_lost: bool,
    pub torn_reason: Option<String>,
}

/// Header of the recovered state plus the report
pub struct Recovered {
    pub header: FileHeader,
    pub report: RecoveryReport,
    /// Number to use for the first journal file from now on
    pub next_journal_number: u64,
}

struct JournalScan {
    entries: Vec<JournalEntry>,
    torn: Option<String>,
}

fn scan_journal(dir: &Path, numbers: &[u64]) -> Result<JournalScan> {
    let mut entries = Vec::new();
    for &number in numbers {
        let mut input = BufReader::new(File::open(journal_file_path(dir, number))?);
        loop {
            match JournalEntry::read_from(&mut input)? {
                ReadOutcome::Entry(entry) => entries.push(entry),
                ReadOutcome::End => break,
                ReadOutcome::Torn(reason) => {
                    return Ok(JournalScan {
                        entries,
                        torn: Some(format!("journal file {}: {}", number, reason)),
                    })
                }
            }
        }
    }
    Ok(JournalScan {
        entries,
        torn: None,
    })
}

/// Bring the data file up to date with the journal and discard the journal
///
/// Returns `None` for an environment that never completed its first commit.
pub fn recover(pager: &dyn Pager, journal_dir: &Path) -> Result<Option<Recovered>> {
    let numbers = list_journal_files(journal_dir)?;
    let next_journal_number = numbers.last().map_or(1, |n| n + 1);

    let header = match FileHeader::read_latest(pager)? {
        Some(header) => header,
        None => {
            for &number in &numbers {
                fs::remove_file(journal_file_path(journal_dir, number))?;
            }
            return Ok(None);
        }
    };

    let scan = scan_journal(journal_dir, &numbers)?;
    let mut report = RecoveryReport {
        journal_files: numbers.len(),
        data_lost: scan.torn.is_some(),
        torn_reason: scan.torn,
        ..RecoveryReport::default()
    };

    let mut state = header;
    let mut latest: BTreeMap<u64, Arc<PageBuf>> = BTreeMap::new();
    let mut previous: Option<TransactionId> = None;
    for entry in scan.entries {
        if entry.transaction_id <= header.last_synced_transaction {
            continue;
        }
        let expected_max = previous.map_or(header.transaction_id + 1, |p| p + 1);
        if entry.transaction_id > expected_max
            || previous.map_or(false, |p| entry.transaction_id <= p)
        {
            report.data_lost = true;
            report.torn_reason = Some(format!(
                "journal jumps to transaction {} after {}",
                entry.transaction_id,
                previous.unwrap_or(header.last_synced_transaction)
            ));
            break;
        }

        for (number, page) in entry.pages {
            latest.insert(number.value(), page);
        }
        if entry.transaction_id >= state.transaction_id {
            state.transaction_id = entry.transaction_id;
            state.last_page_number = PageNumber::new(entry.next_page_number.value().saturating_sub(1));
            state.root = entry.root;
            state.free_space = entry.free_space;
        }
        report.replayed_transactions.push(entry.transaction_id);
        previous = Some(entry.transaction_id);
    }

    if let Some((&max_page, _)) = latest.iter().next_back() {
        pager.ensure_allocated(max_page + 1)?;
    }
    for (number, page) in &latest {
        pager.write_page(PageNumber::new(*number), page)?;
    }
    pager.sync()?;

    state.last_synced_transaction = state.transaction_id;
    state.write_both_slots(pager)?;

    for &number in &numbers {
        fs::remove_file(journal_file_path(journal_dir, number))?;
    }

    report.last_transaction = state.transaction_id;
    if report.data_lost {
        warn!(
            last_transaction = state.transaction_id,
            reason = report.torn_reason.as_deref().unwrap_or(""),
            "env.recovery.data_lost"
        );
    }
    info!(
        replayed = report.replayed_transactions.len(),
        last_transaction = state.transaction_id,
        journal_files = numbers.len(),
        "env.recovery.replayed"
    );

    Ok(Some(Recovered {
        header: state,
        report,
        next_journal_number,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::TreeState;
    use crate::journal::writer::JournalWriter;
    use crate::storage::FilePager;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn base_header() -> FileHeader {
        FileHeader {
            transaction_id: 1,
            last_page_number: PageNumber::new(3),
            root: TreeState::with_root(PageNumber::new(2)),
            free_space: TreeState::with_root(PageNumber::new(3)),
            last_synced_transaction: 1,
        }
    }

    fn entry(tx: TransactionId, page: u64, byte: u8) -> JournalEntry {
        let mut buf = PageBuf::new();
        buf[0] = byte;
        JournalEntry {
            transaction_id: tx,
            next_page_number: PageNumber::new(page + 1),
            root: TreeState::with_root(PageNumber::new(page)),
            free_space: TreeState::with_root(PageNumber::new(3)),
            pages: vec![(PageNumber::new(page), Arc::new(buf))],
        }
    }

    #[test]
    fn test_replays_entries_missing_from_header() -> Result<()> {
        let dir = tempdir().unwrap();
        let pager = FilePager::open(&dir.path().join("data.pages"), None)?;
        base_header().write_to(&pager)?;

        let journal_dir = dir.path().join("journal");
        let mut writer = JournalWriter::create(&journal_dir, 1 << 20, 1)?;
        writer.append(&entry(2, 4, 0xAA), true)?;
        writer.append(&entry(3, 5, 0xBB), true)?;
        drop(writer);

        let recovered = recover(&pager, &journal_dir)?.unwrap();
        assert_eq!(recovered.header.transaction_id, 3);
        assert_eq!(recovered.header.root.root_page, PageNumber::new(5));
        assert_eq!(recovered.report.replayed_transactions, vec![2, 3]);
        assert!(!recovered.report.data_lost);
        assert_eq!(pager.read_page(PageNumber::new(4))?[0], 0xAA);
        assert!(list_journal_files(&journal_dir)?.is_empty());
        assert_eq!(recovered.next_journal_number, 2);
        Ok(())
    }

    #[test]
    fn test_stops_at_torn_entry() -> Result<()> {
        let dir = tempdir().unwrap();
        let pager = FilePager::open(&dir.path().join("data.pages"), None)?;
        base_header().write_to(&pager)?;

        let journal_dir = dir.path().join("journal");
        let mut writer = JournalWriter::create(&journal_dir, 1 << 20, 1)?;
        writer.append(&entry(2, 4, 0xAA), true)?;
        writer.append(&entry(3, 5, 0xBB), true)?;
        drop(writer);

        let path = journal_file_path(&journal_dir, 1);
        let len = fs::metadata(&path)?.len();
        OpenOptions::new().write(true).open(&path)?.set_len(len - 10)?;

        let recovered = recover(&pager, &journal_dir)?.unwrap();
        assert_eq!(recovered.header.transaction_id, 2);
        assert!(recovered.report.data_lost);
        assert_eq!(recovered.report.replayed_transactions, vec![2]);
        Ok(())
    }

    #[test]
    fn test_no_header_means_fresh_environment() -> Result<()> {
        let dir = tempdir().unwrap();
        let pager = FilePager::open(&dir.path().join("data.pages"), None)?;
        let journal_dir = dir.path().join("journal");
        let mut writer = JournalWriter::create(&journal_dir, 1 << 20, 1)?;
        writer.append(&entry(1, 4, 0xAA), true)?;
        drop(writer);

        assert!(recover(&pager, &journal_dir)?.is_none());
        assert!(list_journal_files(&journal_dir)?.is_empty());
        Ok(())
    }
}
