//! Revision numbers and their normalization.
//!
//! A concrete revision is an integer `>= 1`; revision 1 is the initial empty
//! commit of every repository. Negative values are relative to the head:
//! `-1` is the head itself, `-2` the commit before it, and so on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};

/// An immutable, totally-ordered point in a repository's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(i32);

impl Revision {
    /// the latest revision of a repository
    pub const HEAD: Revision = Revision(-1);

    /// the initial empty commit of every repository
    pub const INIT: Revision = Revision(1);

    pub const fn new(major: i32) -> Self {
        Self(major)
    }

    pub const fn major(self) -> i32 {
        self.0
    }

    /// check whether this revision is relative to the head
    pub const fn is_relative(self) -> bool {
        self.0 < 0
    }

    /// the revision `n` commits after this one
    ///
    /// Relative revisions move towards the head.
    pub fn forward(self, n: i32) -> Self {
        Self(self.0.saturating_add(n))
    }

    /// the revision `n` commits before this one
    pub fn backward(self, n: i32) -> Self {
        Self(self.0.saturating_sub(n))
    }

    /// Convert this revision into a concrete one against the given head.
    ///
    /// Fails with `RevisionNotFound` when the result is below 1 or above `head`.
    pub fn normalize(self, head: Revision) -> StorageResult<Revision> {
        self.normalize_within(Revision::INIT, head)
    }

    /// Like [`normalize`](Self::normalize), for a history whose oldest
    /// retained revision is `first`.
    pub fn normalize_within(self, first: Revision, head: Revision) -> StorageResult<Revision> {
        let major = if self.0 < 0 {
            head.0 as i64 + self.0 as i64 + 1
        } else {
            self.0 as i64
        };

        if major < first.0 as i64 || major > head.0 as i64 {
            return Err(StorageError::RevisionNotFound(self));
        }
        Ok(Revision(major as i32))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Revision {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("head") {
            return Ok(Revision::HEAD);
        }
        s.parse::<i32>().map(Revision)
    }
}

impl From<i32> for Revision {
    fn from(major: i32) -> Self {
        Revision(major)
    }
}

/// A pair of revisions; `from` may be newer than `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RevisionRange {
    pub from: Revision,
    pub to: Revision,
}

impl RevisionRange {
    pub fn new(from: Revision, to: Revision) -> Self {
        Self { from, to }
    }

    /// Normalize both ends independently against the head.
    pub fn normalize(self, head: Revision) -> StorageResult<RevisionRange> {
        self.normalize_within(Revision::INIT, head)
    }

    pub fn normalize_within(self, first: Revision, head: Revision) -> StorageResult<RevisionRange> {
        Ok(RevisionRange {
            from: self.from.normalize_within(first, head)?,
            to: self.to.normalize_within(first, head)?,
        })
    }

    /// check whether `from <= to`; only meaningful for concrete ranges
    pub fn is_ascending(&self) -> bool {
        self.from <= self.to
    }

    pub fn to_ascending(self) -> Self {
        if self.is_ascending() {
            self
        } else {
            Self::new(self.to, self.from)
        }
    }

    pub fn to_descending(self) -> Self {
        if self.is_ascending() {
            Self::new(self.to, self.from)
        } else {
            self
        }
    }
}

impl fmt::Display for RevisionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}
