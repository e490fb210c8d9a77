//! Page cache over the data file.
//!
//! Committed pages are immutable, so cached frames are shared as
//! `Arc<PageBuf>` and never written back. The applicator invalidates a frame
//! after it overwrites that page in the data file.

use crate::buffer::lru::LruList;
use crate::error::Result;
use crate::page::PageBuf;
use crate::storage::Pager;
use crate::types::PageNumber;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// LRU cache of data file pages
pub struct PageCache {
    pager: Arc<dyn Pager>,
    frames: RwLock<HashMap<u64, Arc<PageBuf>>>,
    lru: Mutex<LruList>,
    capacity: usize,
}

impl PageCache {
    pub fn new(pager: Arc<dyn Pager>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pager,
            frames: RwLock::new(HashMap::with_capacity(capacity)),
            lru: Mutex::new(LruList::with_capacity(capacity)),
            capacity,
        }
    }

    /// Fetch a page, reading it from the data file on a miss
    pub fn get(&self, page: PageNumber) -> Result<Arc<PageBuf>> {
        if let Some(frame) = self.frames.read().get(&page.value()) {
            self.lru.lock().touch(page.value());
            return Ok(Arc::clone(frame));
        }

        let frame = Arc::new(self.pager.read_page(page)?);

        let mut frames = self.frames.write();
        let mut lru = self.lru.lock();
        while frames.len() >= self.capacity {
            match lru.pop_least_recent() {
                Some(victim) => {
                    frames.remove(&victim);
                }
                None => break,
            }
        }
        frames.insert(page.value(), Arc::clone(&frame));
        lru.touch(page.value());

        Ok(frame)
    }

    /// Drop a page whose on-disk content changed
    pub fn invalidate(&self, page: PageNumber) {
        let mut frames = self.frames.write();
        frames.remove(&page.value());
        self.lru.lock().remove(page.value());
    }

    pub fn clear(&self) {
        let mut frames = self.frames.write();
        frames.clear();
        self.lru.lock().clear();
    }

    /// Number of cached pages
    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilePager;
    use tempfile::tempdir;

    fn setup(capacity: usize) -> Result<(PageCache, Arc<dyn Pager>, tempfile::TempDir)> {
        let dir = tempdir().unwrap();
        let pager: Arc<dyn Pager> = Arc::new(FilePager::open(&dir.path().join("data.pages"), None)?);
        pager.ensure_allocated(8)?;
        for n in 0..8u8 {
            let mut page = PageBuf::new();
            page[0] = n;
            pager.write_page(PageNumber::new(n as u64), &page)?;
        }
        Ok((PageCache::new(Arc::clone(&pager), capacity), pager, dir))
    }

    #[test]
    fn test_cache_hits_and_eviction() -> Result<()> {
        let (cache, _pager, _dir) = setup(2)?;

        assert_eq!(cache.get(PageNumber::new(3))?[0], 3);
        assert_eq!(cache.get(PageNumber::new(4))?[0], 4);
        cache.get(PageNumber::new(3))?;
        assert_eq!(cache.get(PageNumber::new(5))?[0], 5);

        assert_eq!(cache.len(), 2);
        Ok(())
    }

    #[test]
    fn test_invalidate_rereads_disk() -> Result<()> {
        let (cache, pager, _dir) = setup(4)?;
        assert_eq!(cache.get(PageNumber::new(2))?[0], 2);

        let mut page = PageBuf::new();
        page[0] = 99;
        pager.write_page(PageNumber::new(2), &page)?;
        assert_eq!(cache.get(PageNumber::new(2))?[0], 2);

        cache.invalidate(PageNumber::new(2));
        assert_eq!(cache.get(PageNumber::new(2))?[0], 99);
        Ok(())
    }
}
