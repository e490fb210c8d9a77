//! Append-only journal files.
//!
//! Journal files live in `<env>/journal/` and are named after a
//! monotonically increasing 19-digit number. Entries are appended to the
//! newest file; once it grows past the configured size a new file starts.

use crate::error::Result;
use crate::journal::entry::JournalEntry;
use crate::types::TransactionId;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the journal directory inside the environment directory
pub const JOURNAL_DIR_NAME: &str = "journal";

const JOURNAL_EXTENSION: &str = "journal";

/// Path of journal file `number`
pub fn journal_file_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:019}.{}", number, JOURNAL_EXTENSION))
}

/// Journal file numbers present in `dir`, ascending
pub fn list_journal_files(dir: &Path) -> Result<Vec<u64>> {
    let mut numbers = Vec::new();
    if !dir.exists() {
        return Ok(numbers);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXTENSION) {
            continue;
        }
        if let Some(number) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// Summary of one journal file
#[derive(Debug, Clone, Serialize)]
pub struct JournalFileInfo {
    pub number: u64,
    pub size: u64,
    /// Transactions stored in this file, `None` while it is empty
    pub first_transaction: Option<TransactionId>,
    pub last_transaction: Option<TransactionId>,
}

/// Writer over the set of live journal files
pub struct JournalWriter {
    dir: PathBuf,
    max_file_size: u64,
    current: BufWriter<File>,
    /// Live files, oldest first; the last one is being appended to
    files: Vec<JournalFileInfo>,
}

impl JournalWriter {
    /// Start a fresh journal file numbered `first_number`
    pub fn create(dir: &Path, max_file_size: u64, first_number: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let current = Self::open_file(dir, first_number)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_file_size,
            current,
            files: vec![JournalFileInfo {
                number: first_number,
                size: 0,
                first_transaction: None,
                last_transaction: None,
            }],
        })
    }

    fn open_file(dir: &Path, number: u64) -> Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(journal_file_path(dir, number))?;
        Ok(BufWriter::new(file))
    }

    fn current_info(&mut self) -> &mut JournalFileInfo {
        let last = self.files.len() - 1;
        &mut self.files[last]
    }

    /// Append an entry, syncing it to disk when `sync` is set
    pub fn append(&mut self, entry: &JournalEntry, sync: bool) -> Result<()> {
        let size = self.current_info().size;
        if size > 0 && size + entry.encoded_size() as u64 > self.max_file_size {
            self.rotate()?;
        }

        entry.write_to(&mut self.current)?;
        self.current.flush()?;
        if sync {
            self.current.get_ref().sync_data()?;
        }

        let tx = entry.transaction_id;
        let info = self.current_info();
        info.size += entry.encoded_size() as u64;
        info.first_transaction.get_or_insert(tx);
        info.last_transaction = Some(tx);
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.current.flush()?;
        self.current.get_ref().sync_data()?;

        let number = self.current_info().number + 1;
        self.current = Self::open_file(&self.dir, number)?;
        self.files.push(JournalFileInfo {
            number,
            size: 0,
            first_transaction: None,
            last_transaction: None,
        });
        info!(number, "journal.rotate");
        Ok(())
    }

    /// Flush buffered bytes and fsync the current file
    pub fn sync(&mut self) -> Result<()> {
        self.current.flush()?;
        self.current.get_ref().sync_data()?;
        Ok(())
    }

    /// Delete files whose entries are all at or below `up_to`
    ///
    /// The file being appended to is only replaced when it is non-empty and
    /// fully covered.
    pub fn recycle(&mut self, up_to: TransactionId) -> Result<usize> {
        let current_covered = self
            .files
            .last()
            .and_then(|f| f.last_transaction)
            .map_or(false, |last| last <= up_to);
        if current_covered {
            self.rotate()?;
        }

        let mut removed = 0;
        while self.files.len() > 1 {
            let covered = match self.files[0].last_transaction {
                Some(last) => last <= up_to,
                None => true,
            };
            if !covered {
                break;
            }
            let info = self.files.remove(0);
            fs::remove_file(journal_file_path(&self.dir, info.number))?;
            removed += 1;
        }

        if removed > 0 {
            debug!(up_to, removed, "journal.recycle");
        }
        Ok(removed)
    }

    /// Live journal files, oldest first
    pub fn files(&self) -> &[JournalFileInfo] {
        &self.files
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
