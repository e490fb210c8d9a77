//! Environment configuration.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durability level of write transaction commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionsMode {
    /// Journal and header are synced on every commit
    #[default]
    Safe,
    /// Nothing is synced on commit and commits do not nudge the flusher
    Lazy,
    /// The journal is never synced
    Danger,
}

/// Outcome of [`crate::Environment::set_transaction_mode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionsModeResult {
    ModeAlreadySet,
    SetModeSuccessfully,
}

/// Options for opening an environment
///
/// Built with chained setters, or loaded from JSON where missing fields take
/// their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentOptions {
    /// Environment directory, holding the data file and the journal
    pub path: PathBuf,
    pub transactions_mode: TransactionsMode,
    /// Only flush the journal on explicit request
    pub manual_flushing: bool,
    /// How long the flusher waits for work before flushing on its own
    pub idle_flush_timeout_ms: u64,
    /// Write lock wait budget; `None` picks a default based on whether a
    /// debugger is attached
    pub write_lock_timeout_ms: Option<u64>,
    pub max_journal_file_size: u64,
    /// Commits nudge the flusher once this many pages are waiting
    pub max_unflushed_pages_before_flush: u64,
    /// Pages kept in the data file page cache
    pub page_cache_capacity: usize,
    /// Expected schema version; zero accepts whatever the file carries
    pub schema_version: u32,
    /// Cap on the data file size in bytes
    pub max_storage_size: Option<u64>,
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            transactions_mode: TransactionsMode::Safe,
            manual_flushing: false,
            idle_flush_timeout_ms: 5_000,
            write_lock_timeout_ms: None,
            max_journal_file_size: 64 * 1024 * 1024,
            max_unflushed_pages_before_flush: 1024,
            page_cache_capacity: 1024,
            schema_version: 0,
            max_storage_size: None,
        }
    }
}

impl EnvironmentOptions {
    /// Create options with default settings for `path`
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Load options from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StorageError::InvalidConfig(e.to_string()))
    }

    pub fn transactions_mode(mut self, mode: TransactionsMode) -> Self {
        self.transactions_mode = mode;
        self
    }

    pub fn manual_flushing(mut self, enabled: bool) -> Self {
        self.manual_flushing = enabled;
        self
    }

    pub fn idle_flush_timeout(mut self, timeout: Duration) -> Self {
        self.idle_flush_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn write_lock_timeout(mut self, timeout: Duration) -> Self {
        self.write_lock_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn max_journal_file_size(mut self, bytes: u64) -> Self {
        self.max_journal_file_size = bytes;
        self
    }

    pub fn max_unflushed_pages_before_flush(mut self, pages: u64) -> Self {
        self.max_unflushed_pages_before_flush = pages;
        self
    }

    pub fn page_cache_capacity(mut self, pages: usize) -> Self {
        self.page_cache_capacity = pages;
        self
    }

    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn max_storage_size(mut self, bytes: Option<u64>) -> Self {
        self.max_storage_size = bytes;
        self
    }

    /// Effective write lock timeout
    pub fn effective_write_lock_timeout(&self) -> Duration {
        match self.write_lock_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None if debugger_attached() => Duration::from_secs(30 * 60),
            None => Duration::from_secs(30),
        }
    }

    pub fn idle_flush_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.idle_flush_timeout_ms.max(1))
    }
}

/// Whether a tracer (debugger) is attached to this process
fn debugger_attached() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("TracerPid:"))
                .map(|pid| pid.trim() != "0")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_defaults() {
        let options = EnvironmentOptions::new("/tmp/env")
            .manual_flushing(true)
            .write_lock_timeout(Duration::from_millis(250))
            .transactions_mode(TransactionsMode::Lazy);

        assert_eq!(options.path, PathBuf::from("/tmp/env"));
        assert!(options.manual_flushing);
        assert_eq!(options.transactions_mode, TransactionsMode::Lazy);
        assert_eq!(
            options.effective_write_lock_timeout(),
            Duration::from_millis(250)
        );
        assert_eq!(options.page_cache_capacity, 1024);
    }

    #[test]
    fn test_json_fills_missing_fields() -> Result<()> {
        let options = EnvironmentOptions::from_json(
            r#"{ "path": "/data/env", "transactions_mode": "danger", "schema_version": 3 }"#,
        )?;
        assert_eq!(options.path, PathBuf::from("/data/env"));
        assert_eq!(options.transactions_mode, TransactionsMode::Danger);
        assert_eq!(options.schema_version, 3);
        assert_eq!(options.idle_flush_timeout_ms, 5_000);
        Ok(())
    }

    #[test]
    fn test_bad_json_is_a_config_error() {
        let err = EnvironmentOptions::from_json("{ not json").unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig(_)));
    }
}
