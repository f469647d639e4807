use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Half-open numeric key range `[from, to)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    from: i64,
    to: i64,
}

impl KeyRange {
    /// Build a range; `from` must be strictly less than `to`.
    pub fn new(from: i64, to: i64) -> Result<Self, TypeError> {
        if from < to {
            Ok(Self { from, to })
        } else {
            Err(TypeError::InvalidRange { from, to })
        }
    }

    /// Inclusive lower bound.
    pub fn from(&self) -> i64 {
        self.from
    }

    /// Exclusive upper bound.
    pub fn to(&self) -> i64 {
        self.to
    }

    pub fn contains(&self, key: i64) -> bool {
        self.from <= key && key < self.to
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyRange{self}")
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}
