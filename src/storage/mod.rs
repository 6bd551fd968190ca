//! Storage Engine Module
//!
//! This module provides the storage context for TideKV: the scalar store,
//! the hash store, the expiration index and the background reaper that
//! enforces deadlines.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │   strings: RwLock   hashes: RwLock   expirations: RwLock    │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │ reap_expired()
//!              ┌─────────────┴─────────────┐
//!              │          Reaper           │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use tidekv::storage::{ExpirePolicy, StorageEngine};
//! use bytes::Bytes;
//! use std::time::{Duration, Instant};
//!
//! let engine = StorageEngine::new();
//! engine.set(Bytes::from("session"), Bytes::from("token123"));
//!
//! let deadline = Instant::now() + Duration::from_secs(3600);
//! engine.expire(Bytes::from("session"), deadline, ExpirePolicy::Nx).unwrap();
//! assert_eq!(engine.expires_at(b"session"), Some(deadline));
//! ```

pub mod engine;
pub mod expiry;
pub mod reaper;

pub use engine::{Hash, ReapResult, StorageEngine, StorageStats};
pub use expiry::{
    deadline_after, ExpirationEntry, ExpirationIndex, ExpireError, ExpireOutcome, ExpirePolicy,
    UnknownPolicy,
};
pub use reaper::{start_reaper, Reaper, ReaperConfig};
