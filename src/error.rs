//! Error types for the storage engine.

use crate::types::PageNumber;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lock was not acquired within its budget; the caller may retry
    #[error("Waited {waited:?} for {what}, but could not get it")]
    Timeout { what: &'static str, waited: Duration },

    /// The environment cannot continue and must be recovered on the next open
    #[error("Unrecoverable storage error: {0}")]
    Unrecoverable(String),

    /// The data file could not grow
    #[error("Disk full: need {required} bytes but only {available} available")]
    DiskFull { required: u64, available: u64 },

    /// Several owned resources failed to release
    #[error("{} errors while disposing the environment: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<StorageError>),

    /// Requested page is outside the allocated range
    #[error("Page {0} not found")]
    PageNotFound(PageNumber),

    /// Data corruption detected (e.g., checksum mismatch)
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Invalid operation for the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A mutation was attempted through a read transaction
    #[error("Cannot modify data in a read transaction")]
    ReadOnlyTransaction,

    /// Key exceeds maximum allowed size
    #[error("Key too large: {size} bytes (max: {max})")]
    KeyTooLarge { size: usize, max: usize },

    /// No tree with this name exists
    #[error("Tree '{0}' does not exist")]
    TreeNotFound(String),

    /// A tree with this name already exists
    #[error("Tree '{0}' already exists")]
    TreeAlreadyExists(String),

    /// Options could not be parsed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

fn join_errors(errors: &[StorageError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl StorageError {
    /// Create a corruption error with a message
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create an unrecoverable error
    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        Self::Unrecoverable(msg.into())
    }

    /// Whether this error means the device (or the configured cap) ran out of space
    pub fn is_disk_full(&self) -> bool {
        match self {
            Self::DiskFull { .. } => true,
            Self::Io(e) => is_out_of_space(e),
            _ => false,
        }
    }
}

/// ENOSPC on unix, ERROR_DISK_FULL / ERROR_HANDLE_DISK_FULL on windows
fn is_out_of_space(e: &std::io::Error) -> bool {
    match e.raw_os_error() {
        #[cfg(unix)]
        Some(28) => true,
        #[cfg(windows)]
        Some(39) | Some(112) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_full_classification() {
        let err = StorageError::DiskFull {
            required: 10,
            available: 1,
        };
        assert!(err.is_disk_full());
        assert!(!StorageError::corruption("x").is_disk_full());

        #[cfg(unix)]
        assert!(StorageError::Io(std::io::Error::from_raw_os_error(28)).is_disk_full());
    }

    #[test]
    fn test_aggregate_message_lists_all() {
        let err = StorageError::Aggregate(vec![
            StorageError::corruption("first"),
            StorageError::invalid_operation("second"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 errors"));
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
    }
}
