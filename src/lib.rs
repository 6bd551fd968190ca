//! # TideKV - An In-Memory Key-Value Server with Expiring Keys
//!
//! TideKV speaks a subset of the Redis serialization protocol (RESP) over
//! TCP. It keeps two keyspaces in memory, scalar strings and hashes, and
//! removes keys from both once a deadline set with `EXPIRE` has passed.
//! Successful writes can be logged to an append-only file and replayed at
//! startup.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              TideKV                                     │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌──────────┐  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │───>│   AOF    │  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │    │          │  │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘    └──────────┘  │
//! │                            │                  │                         │
//! │                     ┌──────┴──────┐           ▼                         │
//! │                     │ RESP Parser │  ┌──────────────────────────────┐   │
//! │                     └─────────────┘  │        StorageEngine         │   │
//! │                                      │  strings │ hashes │ expiry   │   │
//! │                                      └──────────────────────────────┘   │
//! │                                                    ▲                    │
//! │                                      ┌─────────────┴──────────────┐     │
//! │                                      │  Reaper (Tokio task)       │     │
//! │                                      └────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use tidekv::storage::{start_reaper, StorageEngine};
//! use tidekv::commands::CommandHandler;
//! use tidekv::connection::{handle_connection, ConnectionStats};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Arc::new(StorageEngine::new());
//!     let _reaper = start_reaper(Arc::clone(&storage));
//!     let stats = Arc::new(ConnectionStats::new());
//!     let handler = CommandHandler::new(Arc::clone(&storage));
//!
//!     let listener = TcpListener::bind("127.0.0.1:6379").await?;
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         tokio::spawn(handle_connection(stream, addr, handler.clone(), Arc::clone(&stats)));
//!     }
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `PING [message]`
//! - `SET key value`, `GET key`, `DEL key [key ...]`
//! - `HSET key field value`, `HGET key field`, `HDEL key field [field ...]`
//! - `HGETALL key`
//! - `EXPIRE key seconds nx|xx|gt|lt`
//!
//! ## Expiry
//!
//! A key's deadline lives in a min-heap ordered by deadline, with at most one
//! entry per key. Reads never look at deadlines; keys disappear only when the
//! reaper pops them, so a past-due key stays readable until the next pass.
//! The reaper sleeps until the earliest deadline and is woken early whenever
//! `EXPIRE` changes the index.

pub mod commands;
pub mod config;
pub mod connection;
pub mod persistence;
pub mod protocol;
pub mod storage;

pub use commands::CommandHandler;
pub use config::Config;
pub use connection::{handle_connection, ConnectionStats};
pub use persistence::{AppendOnlyFile, FsyncPolicy};
pub use protocol::{ParseError, RespParser, RespValue};
pub use storage::{start_reaper, Reaper, ReaperConfig, StorageEngine};

/// The default port TideKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host TideKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
