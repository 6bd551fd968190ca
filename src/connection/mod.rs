//! Client Sessions
//!
//! `main.rs` accepts TCP clients and spawns [`handle_connection`] for each.
//! A session owns its read buffer and parser; the [`CommandHandler`] it
//! executes against is a cheap clone sharing one storage engine and one AOF.
//!
//! ```text
//!   accept() ──spawn──> ConnectionHandler
//!                         read ─> parse ─> execute ─> queue reply
//!                          ▲                              │
//!                          └────────── flush ─────────────┘
//! ```
//!
//! [`CommandHandler`]: crate::commands::CommandHandler

pub mod handler;

pub use handler::{
    handle_connection, ConnectionError, ConnectionHandler, ConnectionStats, StatsSnapshot,
};
