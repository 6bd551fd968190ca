//! Command Handler Module
//!
//! Receives decoded requests, executes them against the storage engine and
//! returns the reply.
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  RESP Parser    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │ CommandHandler  │─────>│ AppendOnlyFile  │  (successful writes)
//! └────────┬────────┘      └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ StorageEngine   │  (storage module)
//! └─────────────────┘
//! ```
//!
//! Command names are matched case-insensitively. Unknown commands get an
//! empty status reply; every other failure becomes an error reply and the
//! connection stays open.

pub mod error;
pub mod handler;

pub use error::CommandError;
pub use handler::{Command, CommandHandler};
