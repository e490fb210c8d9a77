//! Storage layer: data file I/O and the alternating file header.
//!
//! This module provides the abstraction for reading and writing pages of the
//! data file and for locating the last committed state on open.

mod file_header;
mod pager;

pub use file_header::FileHeader;
pub use pager::{FilePager, Pager};

/// Name of the data file inside the environment directory
pub const DATA_FILE_NAME: &str = "data.pages";
