//! Page number type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical number of a page in the data file.
///
/// Pages 0 and 1 hold the alternating file headers; tree pages start at
/// [`PageNumber::FIRST_DATA`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PageNumber(pub u64);

impl PageNumber {
    /// Sentinel used for "no page"
    pub const INVALID: PageNumber = PageNumber(u64::MAX);

    /// First page that may hold tree data
    pub const FIRST_DATA: PageNumber = PageNumber(2);

    /// Create a new page number
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Get the raw value
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Check if this is a valid page number
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }

    /// Byte offset of this page in the data file
    pub const fn file_offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }

    /// The page `n` positions after this one
    pub const fn offset(self, n: u64) -> Self {
        Self(self.0 + n)
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "INVALID")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u64> for PageNumber {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

impl From<PageNumber> for u64 {
    fn from(n: PageNumber) -> Self {
        n.0
    }
}
