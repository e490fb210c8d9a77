//! Recency list used to pick eviction victims in the page cache.

use std::collections::HashMap;

/// Intrusive doubly-linked list over a slab, keyed by page number
pub struct LruList {
    slots: HashMap<u64, usize>,
    entries: Vec<Entry>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
    vacant: Vec<usize>,
}

#[derive(Clone, Copy)]
struct Entry {
    page: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

impl LruList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: HashMap::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
            head: None,
            tail: None,
            vacant: Vec::new(),
        }
    }

    /// Mark `page` as just used, inserting it if absent
    pub fn touch(&mut self, page: u64) {
        match self.slots.get(&page) {
            Some(&slot) => {
                if self.head != Some(slot) {
                    self.unlink(slot);
                    self.push_front(slot);
                }
            }
            None => {
                let entry = Entry {
                    page,
                    prev: None,
                    next: None,
                };
                let slot = match self.vacant.pop() {
                    Some(slot) => {
                        self.entries[slot] = entry;
                        slot
                    }
                    None => {
                        self.entries.push(entry);
                        self.entries.len() - 1
                    }
                };
                self.push_front(slot);
                self.slots.insert(page, slot);
            }
        }
    }

    pub fn remove(&mut self, page: u64) {
        if let Some(slot) = self.slots.remove(&page) {
            self.unlink(slot);
            self.vacant.push(slot);
        }
    }

    /// Remove and return the least recently used page
    pub fn pop_least_recent(&mut self) -> Option<u64> {
        let page = self.entries[self.tail?].page;
        self.remove(page);
        Some(page)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.entries.clear();
        self.vacant.clear();
        self.head = None;
        self.tail = None;
    }

    fn push_front(&mut self, slot: usize) {
        self.entries[slot].prev = None;
        self.entries[slot].next = self.head;
        if let Some(old) = self.head {
            self.entries[old].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let entry = self.entries[slot];
        match entry.prev {
            Some(prev) => self.entries[prev].next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => self.entries[next].prev = entry.prev,
            None => self.tail = entry.prev,
        }
    }
}
