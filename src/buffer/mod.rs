//! Page cache: in-memory copies of data file pages with LRU eviction.
//!
//! The cache keeps recently read pages in memory to reduce disk I/O.

mod lru;
mod page_cache;

pub use page_cache::PageCache;
