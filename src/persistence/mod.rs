//! Durability
//!
//! The append-only file records every successful write and is replayed at
//! startup to rebuild the stores. Deadlines set by `EXPIRE` are not logged,
//! so keys come back without a TTL after a restart.

pub mod aof;

pub use aof::{start_fsync_task, AofError, AofWriter, AppendOnlyFile, FsyncPolicy, ReplayStats};
