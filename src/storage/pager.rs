//! Pager implementation.
//!
//! The pager maps page numbers to fixed-size blocks of the data file. It
//! abstracts the file I/O operations behind a trait so that the rest of the
//! system can be tested with other backends.

use crate::error::{Result, StorageError};
use crate::page::PageBuf;
use crate::types::{PageNumber, PAGE_SIZE};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Largest single growth step, in pages (64MB)
const MAX_GROWTH_PAGES: u64 = 16 * 1024;

/// Trait for data file I/O
pub trait Pager: Send + Sync {
    /// Read a page from the data file
    fn read_page(&self, page: PageNumber) -> Result<PageBuf>;

    /// Write a page to the data file
    fn write_page(&self, page: PageNumber, data: &[u8]) -> Result<()>;

    /// Grow the file so that it holds at least `page_count` pages
    fn ensure_allocated(&self, page_count: u64) -> Result<()>;

    /// Number of pages the file currently holds
    fn number_of_allocated_pages(&self) -> u64;

    /// Flush written pages to stable storage
    fn sync(&self) -> Result<()>;

    /// Bumped every time the file grows
    fn generation(&self) -> u64;

    /// Cap on the data file size in bytes, if any
    fn max_storage_size(&self) -> Option<u64>;

    /// Change the cap on the data file size
    fn set_max_storage_size(&self, max: Option<u64>);
}

/// Data file backed pager
pub struct FilePager {
    path: PathBuf,
    file: RwLock<File>,
    allocated_pages: AtomicU64,
    generation: AtomicU64,
    max_storage_size: RwLock<Option<u64>>,
}

impl FilePager {
    /// Open or create the data file
    pub fn open(path: &Path, max_storage_size: Option<u64>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let allocated_pages = len / PAGE_SIZE as u64;
        debug!(
            path = %path.display(),
            allocated_pages,
            "pager.open"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            allocated_pages: AtomicU64::new(allocated_pages),
            generation: AtomicU64::new(0),
            max_storage_size: RwLock::new(max_storage_size),
        })
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn target_size(&self, required_pages: u64) -> Result<u64> {
        let current = self.allocated_pages.load(Ordering::Acquire);
        let step = current.clamp(1, MAX_GROWTH_PAGES);
        let mut target = required_pages.max(current + step);

        if let Some(max) = *self.max_storage_size.read() {
            let max_pages = max / PAGE_SIZE as u64;
            if required_pages > max_pages {
                return Err(StorageError::DiskFull {
                    required: required_pages * PAGE_SIZE as u64,
                    available: max.saturating_sub(current * PAGE_SIZE as u64),
                });
            }
            target = target.min(max_pages);
        }

        Ok(target)
    }
}

impl Pager for FilePager {
    fn read_page(&self, page: PageNumber) -> Result<PageBuf> {
        if page.value() >= self.allocated_pages.load(Ordering::Acquire) {
            return Err(StorageError::PageNotFound(page));
        }

        let mut buf = PageBuf::new();
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(page.file_offset(PAGE_SIZE)))?;
        file.read_exact(buf.as_bytes_mut())?;

        Ok(buf)
    }

    fn write_page(&self, page: PageNumber, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(StorageError::invalid_operation(format!(
                "page data must be {} bytes, got {}",
                PAGE_SIZE,
                data.len()
            )));
        }
        if page.value() >= self.allocated_pages.load(Ordering::Acquire) {
            return Err(StorageError::PageNotFound(page));
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(page.file_offset(PAGE_SIZE)))?;
        file.write_all(data)?;

        Ok(())
    }

    fn ensure_allocated(&self, page_count: u64) -> Result<()> {
        if page_count <= self.allocated_pages.load(Ordering::Acquire) {
            return Ok(());
        }

        let file = self.file.write();
        let current = self.allocated_pages.load(Ordering::Acquire);
        if page_count <= current {
            return Ok(());
        }

        let target = self.target_size(page_count)?;
        file.set_len(target * PAGE_SIZE as u64)?;
        self.allocated_pages.store(target, Ordering::Release);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        debug!(from = current, to = target, generation, "pager.grow");
        Ok(())
    }

    fn number_of_allocated_pages(&self) -> u64 {
        self.allocated_pages.load(Ordering::Acquire)
    }

    fn sync(&self) -> Result<()> {
        let file = self.file.write();
        file.sync_all()?;
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn max_storage_size(&self) -> Option<u64> {
        *self.max_storage_size.read()
    }

    fn set_max_storage_size(&self, max: Option<u64>) {
        *self.max_storage_size.write() = max;
    }
}
