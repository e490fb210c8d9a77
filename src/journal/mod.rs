//! Write-ahead journal.
//!
//! Every committed write transaction appends one entry holding the pages it
//! dirtied. The applicator later copies those pages into the data file and
//! recycles journal files that are no longer needed; recovery replays what
//! the data file has not seen yet.

mod applicator;
mod entry;
mod recovery;
mod writer;

pub(crate) use applicator::{apply_logs_to_data_file, ApplyOutcome};
pub use entry::{JournalEntry, ReadOutcome, ENTRY_HEADER_SIZE};
pub use recovery::{recover, Recovered, RecoveryReport};
pub use writer::{journal_file_path, list_journal_files, JournalFileInfo, JournalWriter, JOURNAL_DIR_NAME};
