//! In-process POSIX advisory locks.
//!
//! Both lower backends keep advisory locks in process memory: locks are
//! advisory, carry no integrity weight, and the overlay is the only
//! party talking to its lower filesystem. Read locks share, write
//! locks exclude, and unlocking splits partially covered ranges.

use std::io;
use std::sync::{Mutex, PoisonError};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// A byte range, end exclusive. `u64::MAX` as end means to EOF and
/// beyond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRange {
    pub start: u64,
    pub end: u64,
}

impl LockRange {
    pub fn new(start: u64, end: u64) -> Self {
        LockRange { start, end }
    }

    fn overlaps(&self, other: &LockRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy)]
struct Lock {
    owner: u64,
    kind: LockKind,
    range: LockRange,
}

/// Advisory lock state for one file.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<Vec<Lock>>,
}

impl LockTable {
    pub fn new() -> Self {
        LockTable::default()
    }

    /// Acquires a lock for `owner` over `range`. Non-blocking: a
    /// conflict with another owner fails with `WouldBlock`.
    pub fn lock(&self, owner: u64, kind: LockKind, range: LockRange) -> Result<()> {
        if range.start >= range.end {
            return Err(Error::InvalidArgument("empty lock range".to_owned()));
        }
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let conflict = locks.iter().any(|l| {
            l.owner != owner
                && l.range.overlaps(&range)
                && (l.kind == LockKind::Write || kind == LockKind::Write)
        });
        if conflict {
            return Err(Error::Io(io::Error::from(io::ErrorKind::WouldBlock)));
        }
        locks.push(Lock { owner, kind, range });
        Ok(())
    }

    /// Drops `owner`'s locks over `range`, splitting locks that are
    /// only partially covered.
    pub fn unlock(&self, owner: u64, range: LockRange) -> Result<()> {
        if range.start >= range.end {
            return Err(Error::InvalidArgument("empty lock range".to_owned()));
        }
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut kept = Vec::with_capacity(locks.len());
        for l in locks.drain(..) {
            if l.owner != owner || !l.range.overlaps(&range) {
                kept.push(l);
                continue;
            }
            if l.range.start < range.start {
                kept.push(Lock {
                    range: LockRange::new(l.range.start, range.start),
                    ..l
                });
            }
            if l.range.end > range.end {
                kept.push(Lock {
                    range: LockRange::new(range.end, l.range.end),
                    ..l
                });
            }
        }
        *locks = kept;
        Ok(())
    }
}
