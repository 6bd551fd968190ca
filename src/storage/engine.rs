//! Thread-Safe Storage Engine with Expiry Support
//!
//! `StorageEngine` is the storage context shared by every connection and the
//! reaper. It owns the scalar map, the hash map and the expiration index,
//! each behind its own read/write lock.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌──────────────┐ ┌──────────────────┐ ┌─────────────────┐  │
//! │  │   strings    │ │      hashes      │ │   expirations   │  │
//! │  │   RwLock     │ │      RwLock      │ │     RwLock      │  │
//! │  │ key -> value │ │ key -> {f -> v}  │ │  min-heap by    │  │
//! │  │              │ │                  │ │  expires_at     │  │
//! │  └──────────────┘ └──────────────────┘ └─────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The hash lock covers the whole nested structure, so HSETs on different
//! outer keys serialize and HGETALL always iterates a consistent snapshot.
//!
//! Lock order is `expirations -> strings -> hashes`. The reaper and the
//! deadline cleanup after DEL/HDEL hold several at once; other command paths
//! take one, release it, then take the next.

use crate::storage::expiry::{ExpirationIndex, ExpireError, ExpireOutcome, ExpirePolicy};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Notify;

/// Field -> value map stored under a hash key.
pub type Hash = HashMap<Bytes, Bytes>;

/// Snapshot of storage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    /// Keys in the scalar store
    pub strings: usize,
    /// Keys in the hash store
    pub hashes: usize,
    /// Entries in the expiration index
    pub pending_expirations: usize,
    /// Keys removed by the reaper since start
    pub expired: u64,
}

/// Result of one reaper pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapResult {
    /// Keys removed during this pass
    pub reaped: usize,
    /// Deadline at the root of the index after the pass
    pub next_deadline: Option<Instant>,
}

/// The storage context for TideKV.
///
/// # Example
///
/// ```
/// use tidekv::storage::StorageEngine;
/// use bytes::Bytes;
///
/// let engine = StorageEngine::new();
///
/// engine.set(Bytes::from("name"), Bytes::from("Ariz"));
/// assert_eq!(engine.get(b"name"), Some(Bytes::from("Ariz")));
///
/// engine.hset(Bytes::from("users"), Bytes::from("u1"), Bytes::from("colby"));
/// assert_eq!(engine.hget(b"users", b"u1"), Some(Bytes::from("colby")));
/// ```
pub struct StorageEngine {
    strings: RwLock<HashMap<Bytes, Bytes>>,
    hashes: RwLock<HashMap<Bytes, Hash>>,
    expirations: RwLock<ExpirationIndex>,

    /// Signalled when a deadline is inserted or moved, so the reaper can
    /// re-check the root before its sleep runs out.
    expiry_changed: Notify,

    /// Statistics: number of keys removed by the reaper
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("StorageEngine")
            .field("strings", &stats.strings)
            .field("hashes", &stats.hashes)
            .field("pending_expirations", &stats.pending_expirations)
            .field("expired", &stats.expired)
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates an empty storage engine.
    pub fn new() -> Self {
        Self {
            strings: RwLock::new(HashMap::new()),
            hashes: RwLock::new(HashMap::new()),
            expirations: RwLock::new(ExpirationIndex::new()),
            expiry_changed: Notify::new(),
            expired_count: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Scalar store
    // ========================================================================

    /// Sets a key to a value, overwriting any previous value.
    ///
    /// Returns `true` if a new key was created.
    pub fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.strings.write().insert(key, value).is_none()
    }

    /// Gets the value for a key.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.strings.read().get(key).cloned()
    }

    /// Removes a key from the scalar store.
    ///
    /// Returns `true` if the key existed. Once the key is gone from both
    /// stores its deadline is dropped as well.
    pub fn delete(&self, key: &[u8]) -> bool {
        let removed = self.strings.write().remove(key).is_some();
        self.forget_deadline_if_gone(key);
        removed
    }

    /// Removes several keys. Returns how many existed.
    pub fn delete_many(&self, keys: &[Bytes]) -> u64 {
        keys.iter().filter(|key| self.delete(key)).count() as u64
    }

    // ========================================================================
    // Hash store
    // ========================================================================

    /// Sets `field` in the hash at `key`, creating the hash if needed.
    ///
    /// Returns `true` if the field is new.
    pub fn hset(&self, key: Bytes, field: Bytes, value: Bytes) -> bool {
        self.hashes
            .write()
            .entry(key)
            .or_default()
            .insert(field, value)
            .is_none()
    }

    /// Gets a field from the hash at `key`.
    pub fn hget(&self, key: &[u8], field: &[u8]) -> Option<Bytes> {
        self.hashes.read().get(key)?.get(field).cloned()
    }

    /// Removes fields from the hash at `key`. Returns how many existed.
    ///
    /// A hash left without fields is removed, and with it the key's
    /// deadline unless the key also holds a scalar value.
    pub fn hdel(&self, key: &[u8], fields: &[Bytes]) -> u64 {
        let (removed, emptied) = {
            let mut hashes = self.hashes.write();
            let Some(hash) = hashes.get_mut(key) else {
                return 0;
            };
            let removed = fields
                .iter()
                .filter(|field| hash.remove(*field).is_some())
                .count() as u64;
            let emptied = hash.is_empty();
            if emptied {
                hashes.remove(key);
            }
            (removed, emptied)
        };

        if emptied {
            self.forget_deadline_if_gone(key);
        }

        removed
    }

    /// Drops the deadline of `key` if it is in neither store.
    ///
    /// The index lock is held across the check, so an EXPIRE that lands
    /// after a concurrent re-create is never undone.
    fn forget_deadline_if_gone(&self, key: &[u8]) {
        let mut index = self.expirations.write();
        let present = self.strings.read().contains_key(key) || self.hashes.read().contains_key(key);
        if !present {
            index.remove(key);
        }
    }

    /// Returns every field/value pair of the hash at `key`.
    ///
    /// The pairs are copied out under one read lock, so no field is added or
    /// removed while the snapshot is taken.
    pub fn hgetall(&self, key: &[u8]) -> Option<Vec<(Bytes, Bytes)>> {
        let hashes = self.hashes.read();
        let hash = hashes.get(key)?;
        Some(
            hash.iter()
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect(),
        )
    }

    // ========================================================================
    // Expiration
    // ========================================================================

    /// Records a deadline for `key` according to `policy`.
    ///
    /// The key does not have to exist in either store.
    pub fn expire(
        &self,
        key: Bytes,
        expires_at: Instant,
        policy: ExpirePolicy,
    ) -> Result<ExpireOutcome, ExpireError> {
        let outcome = self.expirations.write().apply(key, expires_at, policy)?;
        if outcome != ExpireOutcome::Unchanged {
            self.expiry_changed.notify_one();
        }
        Ok(outcome)
    }

    /// Returns the deadline recorded for `key`.
    pub fn expires_at(&self, key: &[u8]) -> Option<Instant> {
        self.expirations.read().expires_at(key)
    }

    /// Removes up to `limit` keys whose deadline is at or before `now`.
    ///
    /// The root is checked under the read lock first. A due root is then
    /// re-checked under the write lock, since a GT or XX update may have
    /// pushed it back in between, and the key is deleted from both stores
    /// before the index lock is released.
    pub fn reap_expired(&self, now: Instant, limit: usize) -> ReapResult {
        let mut reaped = 0;

        while reaped < limit {
            let root = self.expirations.read().peek_min().map(|e| e.expires_at);
            match root {
                None => {
                    return ReapResult {
                        reaped,
                        next_deadline: None,
                    }
                }
                Some(deadline) if deadline > now => {
                    return ReapResult {
                        reaped,
                        next_deadline: Some(deadline),
                    }
                }
                Some(_) => {}
            }

            let mut index = self.expirations.write();
            if !index.peek_min().is_some_and(|e| e.expires_at <= now) {
                continue;
            }
            let Some(entry) = index.pop_min() else {
                continue;
            };

            self.strings.write().remove(&entry.key);
            self.hashes.write().remove(&entry.key);
            drop(index);

            reaped += 1;
            self.expired_count.fetch_add(1, Ordering::Relaxed);
        }

        ReapResult {
            reaped,
            next_deadline: self.expirations.read().peek_min().map(|e| e.expires_at),
        }
    }

    /// Notified whenever a deadline is inserted or changed.
    pub fn expiry_changed(&self) -> &Notify {
        &self.expiry_changed
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Number of keys across both stores.
    pub fn len(&self) -> usize {
        self.strings.read().len() + self.hashes.read().len()
    }

    /// Returns true if both stores are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of storage statistics.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            strings: self.strings.read().len(),
            hashes: self.hashes.read().len(),
            pending_expirations: self.expirations.read().len(),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::expiry::deadline_after;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn b(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_set_and_get() {
        let engine = StorageEngine::new();
        assert!(engine.set(b("key"), b("value")));
        assert!(!engine.set(b("key"), b("other")));
        assert_eq!(engine.get(b"key"), Some(b("other")));
    }

    #[test]
    fn test_get_nonexistent() {
        let engine = StorageEngine::new();
        assert_eq!(engine.get(b"nope"), None);
    }

    #[test]
    fn test_delete() {
        let engine = StorageEngine::new();
        engine.set(b("key"), b("value"));

        assert!(engine.delete(b"key"));
        assert_eq!(engine.get(b"key"), None);
        // idempotent
        assert!(!engine.delete(b"key"));
    }

    #[test]
    fn test_delete_many() {
        let engine = StorageEngine::new();
        engine.set(b("a"), b("1"));
        engine.set(b("b"), b("2"));
        assert_eq!(engine.delete_many(&[b("a"), b("b"), b("c")]), 2);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_binary_keys_and_values() {
        let engine = StorageEngine::new();
        let key = Bytes::from_static(b"k\x00\xff");
        let value = Bytes::from_static(b"\r\n\x00");
        engine.set(key.clone(), value.clone());
        assert_eq!(engine.get(&key), Some(value));
    }

    #[test]
    fn test_hset_hget() {
        let engine = StorageEngine::new();
        assert!(engine.hset(b("users"), b("u1"), b("colby")));
        assert!(!engine.hset(b("users"), b("u1"), b("ariz")));
        assert!(engine.hset(b("users"), b("u2"), b("colby")));

        assert_eq!(engine.hget(b"users", b"u1"), Some(b("ariz")));
        assert_eq!(engine.hget(b"users", b"u3"), None);
        assert_eq!(engine.hget(b"posts", b"u1"), None);
    }

    #[test]
    fn test_hdel() {
        let engine = StorageEngine::new();
        engine.hset(b("h"), b("a"), b("x"));
        engine.hset(b("h"), b("b"), b("y"));

        assert_eq!(engine.hdel(b"h", &[b("a"), b("missing")]), 1);
        assert_eq!(engine.hget(b"h", b"a"), None);
        assert_eq!(engine.hget(b"h", b"b"), Some(b("y")));

        assert_eq!(engine.hdel(b"nohash", &[b("a")]), 0);

        assert_eq!(engine.hdel(b"h", &[b("b")]), 1);
        assert_eq!(engine.hgetall(b"h"), None);
    }

    #[test]
    fn test_hgetall() {
        let engine = StorageEngine::new();
        assert_eq!(engine.hgetall(b"h"), None);

        engine.hset(b("h"), b("a"), b("x"));
        engine.hset(b("h"), b("b"), b("y"));

        let mut pairs = engine.hgetall(b"h").unwrap();
        pairs.sort();
        assert_eq!(pairs, vec![(b("a"), b("x")), (b("b"), b("y"))]);
    }

    #[test]
    fn test_expire_and_reap() {
        let engine = StorageEngine::new();
        let now = Instant::now();

        engine.set(b("gone"), b("v"));
        engine.hset(b("gone-hash"), b("f"), b("v"));
        engine.set(b("kept"), b("v"));

        engine
            .expire(b("gone"), deadline_after(now, -1), ExpirePolicy::Nx)
            .unwrap();
        engine
            .expire(b("gone-hash"), now, ExpirePolicy::Nx)
            .unwrap();
        engine
            .expire(b("kept"), deadline_after(now, 60), ExpirePolicy::Nx)
            .unwrap();

        let result = engine.reap_expired(now, 100);
        assert_eq!(result.reaped, 2);
        assert_eq!(result.next_deadline, Some(deadline_after(now, 60)));

        assert_eq!(engine.get(b"gone"), None);
        assert_eq!(engine.hgetall(b"gone-hash"), None);
        assert_eq!(engine.get(b"kept"), Some(b("v")));
        assert_eq!(engine.expires_at(b"gone"), None);

        let stats = engine.stats();
        assert_eq!(stats.expired, 2);
        assert_eq!(stats.pending_expirations, 1);
    }

    #[test]
    fn test_reap_respects_limit() {
        let engine = StorageEngine::new();
        let now = Instant::now();
        for i in 0..10 {
            let key = b(&format!("k{}", i));
            engine.set(key.clone(), b("v"));
            engine.expire(key, now, ExpirePolicy::Nx).unwrap();
        }

        let first = engine.reap_expired(now, 4);
        assert_eq!(first.reaped, 4);
        assert_eq!(first.next_deadline, Some(now));

        let second = engine.reap_expired(now, 100);
        assert_eq!(second.reaped, 6);
        assert_eq!(second.next_deadline, None);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_delete_drops_deadline() {
        let engine = StorageEngine::new();
        let later = deadline_after(Instant::now(), 60);

        engine.set(b("k"), b("v"));
        engine.expire(b("k"), later, ExpirePolicy::Nx).unwrap();
        engine.delete(b"k");
        assert_eq!(engine.expires_at(b"k"), None);

        // a hash under the same name keeps the deadline alive
        engine.set(b("both"), b("v"));
        engine.hset(b("both"), b("f"), b("v"));
        engine.expire(b("both"), later, ExpirePolicy::Nx).unwrap();
        engine.delete(b"both");
        assert_eq!(engine.expires_at(b"both"), Some(later));

        engine.hdel(b"both", &[b("f")]);
        assert_eq!(engine.expires_at(b"both"), None);
    }

    #[test]
    fn test_delete_keeps_deadline_of_recreated_hash() {
        let engine = Arc::new(StorageEngine::new());
        let later = deadline_after(Instant::now(), 3600);
        let keys: Vec<Bytes> = (0..500).map(|i| b(&format!("k{}", i))).collect();

        let deleter = {
            let engine = Arc::clone(&engine);
            let keys = keys.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    for key in &keys {
                        engine.delete(key);
                    }
                }
            })
        };

        for key in &keys {
            engine.hset(key.clone(), b("f"), b("v"));
            engine.expire(key.clone(), later, ExpirePolicy::Nx).unwrap();
        }
        deleter.join().unwrap();

        // DEL never removes a hash, so every deadline must survive
        for key in &keys {
            assert_eq!(engine.expires_at(key), Some(later), "{:?}", key);
        }
    }

    #[test]
    fn test_expire_notifies_reaper() {
        let engine = StorageEngine::new();
        let later = deadline_after(Instant::now(), 60);

        engine.expire(b("k"), later, ExpirePolicy::Nx).unwrap();

        // notify_one stores a permit when nobody is waiting yet
        let notified = engine.expiry_changed().notified();
        tokio_test::block_on(async {
            tokio::time::timeout(Duration::from_millis(100), notified)
                .await
                .expect("expire should signal the reaper");
        });
    }

    #[test]
    fn test_concurrent_access() {
        let engine = Arc::new(StorageEngine::new());
        let mut handles = vec![];

        for i in 0..10 {
            let engine = Arc::clone(&engine);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    let key = Bytes::from(format!("key-{}-{}", i, j));
                    engine.set(key.clone(), Bytes::from(format!("value-{}-{}", i, j)));
                    engine.hset(Bytes::from(format!("hash-{}", i)), key, Bytes::from("v"));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.stats().strings, 1000);
        assert_eq!(engine.stats().hashes, 10);
        for i in 0..10 {
            for j in 0..100 {
                let key = format!("key-{}-{}", i, j);
                assert_eq!(
                    engine.get(key.as_bytes()),
                    Some(Bytes::from(format!("value-{}-{}", i, j)))
                );
            }
        }
    }

    #[test]
    fn test_no_torn_reads() {
        let engine = Arc::new(StorageEngine::new());
        let a = Bytes::from(vec![b'a'; 4096]);
        let z = Bytes::from(vec![b'z'; 4096]);
        engine.set(b("shared"), a.clone());

        let writer = {
            let engine = Arc::clone(&engine);
            let (a, z) = (a.clone(), z.clone());
            thread::spawn(move || {
                for i in 0..2_000 {
                    let value = if i % 2 == 0 { z.clone() } else { a.clone() };
                    engine.set(Bytes::from("shared"), value);
                }
            })
        };

        for _ in 0..2_000 {
            let value = engine.get(b"shared").unwrap();
            assert!(value == a || value == z);
        }

        writer.join().unwrap();
    }
}
