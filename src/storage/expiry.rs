//! Expiration Index
//!
//! A binary min-heap of `(key, expires_at)` pairs, earliest deadline at the
//! root. The reaper pops due entries from the root; `EXPIRE` inserts or
//! re-prioritises entries according to an [`ExpirePolicy`].
//!
//! The heap holds at most one entry per key. Every path that adds a deadline
//! goes through [`ExpirationIndex::insert`] or [`ExpirationIndex::apply`],
//! and both update an existing entry in place instead of pushing a second one.
//!
//! Lookup by key is a linear scan over the backing vector. Heap positions
//! move on every mutation, so a position is only valid until the next one.

use bytes::Bytes;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest TTL accepted by `EXPIRE` (100 years). Larger values are clamped.
pub const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// How `EXPIRE` treats an existing deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirePolicy {
    /// Set only when the key has no deadline.
    Nx,
    /// Set only when the key already has a deadline.
    Xx,
    /// Set only when the new deadline is later than the current one.
    Gt,
    /// Set only when the new deadline is earlier than the current one.
    Lt,
}

/// The policy argument was not one of `nx`, `xx`, `gt`, `lt`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown option '{0}'")]
pub struct UnknownPolicy(pub String);

impl FromStr for ExpirePolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nx" => Ok(ExpirePolicy::Nx),
            "xx" => Ok(ExpirePolicy::Xx),
            "gt" => Ok(ExpirePolicy::Gt),
            "lt" => Ok(ExpirePolicy::Lt),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

/// A GT or LT precondition failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExpireError {
    #[error("key has no expiration")]
    NoExpiration,

    #[error("new expiry is not greater than the current one")]
    NotGreater,

    #[error("new expiry is not less than the current one")]
    NotLesser,
}

/// What a successful [`ExpirationIndex::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    Inserted,
    Updated,
    /// NX on a key with a deadline, or XX on a key without one.
    Unchanged,
}

/// A key and the instant it expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationEntry {
    pub key: Bytes,
    pub expires_at: Instant,
}

impl ExpirationEntry {
    pub fn new(key: Bytes, expires_at: Instant) -> Self {
        Self { key, expires_at }
    }
}

/// Computes `now + seconds`. Negative values give an instant in the past.
pub fn deadline_after(now: Instant, seconds: i64) -> Instant {
    let secs = seconds.clamp(-MAX_TTL_SECS, MAX_TTL_SECS);
    let offset = Duration::from_secs(secs.unsigned_abs());
    if secs >= 0 {
        now.checked_add(offset).unwrap_or(now)
    } else {
        now.checked_sub(offset).unwrap_or(now)
    }
}

/// Min-heap of expiration entries ordered by `expires_at`.
#[derive(Debug, Default)]
pub struct ExpirationIndex {
    heap: Vec<ExpirationEntry>,
}

impl ExpirationIndex {
    pub fn new() -> Self {
        Self { heap: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Returns the current position and entry for `key`.
    pub fn find(&self, key: &[u8]) -> Option<(usize, &ExpirationEntry)> {
        self.heap
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.key.as_ref() == key)
    }

    /// Returns the deadline recorded for `key`.
    pub fn expires_at(&self, key: &[u8]) -> Option<Instant> {
        self.find(key).map(|(_, entry)| entry.expires_at)
    }

    /// The entry with the earliest deadline.
    pub fn peek_min(&self) -> Option<&ExpirationEntry> {
        self.heap.first()
    }

    /// Adds a deadline, replacing the existing one for the same key.
    pub fn insert(&mut self, entry: ExpirationEntry) {
        match self.find(&entry.key).map(|(pos, _)| pos) {
            Some(pos) => self.update_priority(pos, entry.expires_at),
            None => self.push(entry),
        }
    }

    /// Changes the deadline at `pos` and restores heap order from there.
    pub fn update_priority(&mut self, pos: usize, expires_at: Instant) {
        let previous = std::mem::replace(&mut self.heap[pos].expires_at, expires_at);
        if expires_at < previous {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
    }

    /// Removes and returns the entry with the earliest deadline.
    pub fn pop_min(&mut self) -> Option<ExpirationEntry> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let min = self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        min
    }

    /// Drops the deadline for `key`, if it has one.
    pub fn remove(&mut self, key: &[u8]) -> Option<ExpirationEntry> {
        let pos = self.find(key)?.0;
        let removed = self.heap.swap_remove(pos);
        if pos < self.heap.len() {
            let settled = self.sift_up(pos);
            if settled == pos {
                self.sift_down(pos);
            }
        }
        Some(removed)
    }

    /// Applies `EXPIRE key <deadline> <policy>`.
    pub fn apply(
        &mut self,
        key: Bytes,
        expires_at: Instant,
        policy: ExpirePolicy,
    ) -> Result<ExpireOutcome, ExpireError> {
        let current = self.find(&key).map(|(pos, entry)| (pos, entry.expires_at));

        match (policy, current) {
            (ExpirePolicy::Nx, None) => {
                self.push(ExpirationEntry::new(key, expires_at));
                Ok(ExpireOutcome::Inserted)
            }
            (ExpirePolicy::Nx, Some(_)) | (ExpirePolicy::Xx, None) => Ok(ExpireOutcome::Unchanged),
            (ExpirePolicy::Xx, Some((pos, _))) => {
                self.update_priority(pos, expires_at);
                Ok(ExpireOutcome::Updated)
            }
            (ExpirePolicy::Gt, Some((pos, current))) => {
                if expires_at <= current {
                    return Err(ExpireError::NotGreater);
                }
                self.update_priority(pos, expires_at);
                Ok(ExpireOutcome::Updated)
            }
            (ExpirePolicy::Lt, Some((pos, current))) => {
                if expires_at >= current {
                    return Err(ExpireError::NotLesser);
                }
                self.update_priority(pos, expires_at);
                Ok(ExpireOutcome::Updated)
            }
            (ExpirePolicy::Gt | ExpirePolicy::Lt, None) => Err(ExpireError::NoExpiration),
        }
    }

    fn push(&mut self, entry: ExpirationEntry) {
        self.heap.push(entry);
        self.sift_up(self.heap.len() - 1);
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[pos].expires_at >= self.heap[parent].expires_at {
                break;
            }
            self.heap.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;

            if left < len && self.heap[left].expires_at < self.heap[smallest].expires_at {
                smallest = left;
            }
            if right < len && self.heap[right].expires_at < self.heap[smallest].expires_at {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.heap.swap(pos, smallest);
            pos = smallest;
        }
    }
}
