//! Command Handler Module
//!
//! Maps a decoded request onto the storage engine and produces the reply.
//!
//! ## Supported Commands
//!
//! - `PING [message]` - Test connection
//! - `SET key value` - Set a key
//! - `GET key` - Get a key's value
//! - `DEL key [key ...]` - Delete keys
//! - `HSET key field value` - Set a hash field
//! - `HGET key field` - Get a hash field
//! - `HDEL key field [field ...]` - Delete hash fields
//! - `HGETALL key` - Dump a hash's values
//! - `EXPIRE key seconds nx|xx|gt|lt` - Set a deadline under a policy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  lookup()   │───>│  dispatch() │───>│ cmd_xxx()   │      │
//! │  └─────────────┘    └─────────────┘    └─────────────┘      │
//! │                                               │             │
//! │                          ┌────────────────────┤             │
//! │                          ▼                    ▼             │
//! │                   AppendOnlyFile        StorageEngine       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`CommandHandler::apply`] only touches the storage engine and is what AOF
//! replay calls. [`CommandHandler::execute`] is used for live connections and
//! additionally appends successful writes to the log.

use crate::commands::error::CommandError;
use crate::persistence::{AppendOnlyFile, FsyncPolicy};
use crate::protocol::RespValue;
use crate::storage::{deadline_after, ExpirePolicy, StorageEngine};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Reply to a successful EXPIRE
pub const EXPIRE_SET: &str = "Expire Time Set";

/// Commands understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Set,
    Get,
    Del,
    HSet,
    HGet,
    HDel,
    HGetAll,
    Expire,
}

impl Command {
    /// Looks up a command by name, ignoring ASCII case.
    pub fn lookup(name: &[u8]) -> Option<Command> {
        let command = match name.to_ascii_uppercase().as_slice() {
            b"PING" => Command::Ping,
            b"SET" => Command::Set,
            b"GET" => Command::Get,
            b"DEL" => Command::Del,
            b"HSET" => Command::HSet,
            b"HGET" => Command::HGet,
            b"HDEL" => Command::HDel,
            b"HGETALL" => Command::HGetAll,
            b"EXPIRE" => Command::Expire,
            _ => return None,
        };
        Some(command)
    }

    /// Lowercase name, as used in error replies.
    pub fn name(self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Set => "set",
            Command::Get => "get",
            Command::Del => "del",
            Command::HSet => "hset",
            Command::HGet => "hget",
            Command::HDel => "hdel",
            Command::HGetAll => "hgetall",
            Command::Expire => "expire",
        }
    }

    /// Whether successful invocations are recorded in the AOF.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Command::Set | Command::Del | Command::HSet | Command::HDel
        )
    }

    /// Returns the command named by a request, if it names a known one.
    pub fn of(request: &RespValue) -> Option<Command> {
        let name = request.as_array()?.first()?.as_bytes()?;
        Command::lookup(name)
    }
}

/// Handles commands by dispatching them to the storage engine.
#[derive(Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
    aof: Option<Arc<AppendOnlyFile>>,
}

impl CommandHandler {
    /// Creates a command handler without a durability log.
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage, aof: None }
    }

    /// Records successful writes in `aof`.
    pub fn with_aof(mut self, aof: Arc<AppendOnlyFile>) -> Self {
        self.aof = Some(aof);
        self
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    /// Executes a request from a client and returns the reply.
    ///
    /// Writes that succeed are appended to the AOF before the reply is
    /// returned. The log stays locked from the store mutation until the
    /// append, so concurrent writes reach the log in the order they reached
    /// the store. A write that cannot be logged is reported to the client as
    /// an error even though the store already holds it.
    pub fn execute(&self, request: RespValue) -> RespValue {
        let Some(aof) = self.log_for(&request) else {
            return self.apply(request);
        };

        let frame = request.serialize();
        let mut writer = aof.writer();
        let reply = self.apply(request);
        if reply.is_error() {
            return reply;
        }

        if let Err(e) = writer.append(&frame) {
            error!(error = %e, path = %aof.path().display(), "Failed to append to AOF");
            return CommandError::Persist.into();
        }
        reply
    }

    /// Whether executing `request` waits on an fsync.
    pub fn fsyncs(&self, request: &RespValue) -> bool {
        self.log_for(request)
            .is_some_and(|aof| aof.policy() == FsyncPolicy::Always)
    }

    /// The log a request is recorded in, if it is a write and logging is on.
    fn log_for(&self, request: &RespValue) -> Option<&Arc<AppendOnlyFile>> {
        self.aof
            .as_ref()
            .filter(|_| Command::of(request).is_some_and(Command::is_write))
    }

    /// Applies a request to the storage engine and returns the reply.
    ///
    /// Has no side effect beyond store and index mutation, which makes it
    /// suitable for AOF replay.
    ///
    /// Unknown commands get an empty status reply (`+\r\n`) rather than an
    /// error.
    pub fn apply(&self, request: RespValue) -> RespValue {
        let args = match request {
            RespValue::Array(args) => args,
            _ => return CommandError::InvalidRequest("expected an array").into(),
        };

        let Some((name, args)) = args.split_first() else {
            return CommandError::InvalidRequest("empty command").into();
        };

        let Some(name) = name.as_bytes() else {
            return CommandError::InvalidRequest("command name must be a bulk string").into();
        };

        let Some(command) = Command::lookup(name) else {
            debug!(command = %String::from_utf8_lossy(name), "Unknown command");
            return RespValue::simple_string("");
        };

        match self.dispatch(command, args) {
            Ok(reply) => reply,
            Err(e) => e.into(),
        }
    }

    fn dispatch(&self, command: Command, args: &[RespValue]) -> Result<RespValue, CommandError> {
        match command {
            Command::Ping => self.cmd_ping(args),
            Command::Set => self.cmd_set(args),
            Command::Get => self.cmd_get(args),
            Command::Del => self.cmd_del(args),
            Command::HSet => self.cmd_hset(args),
            Command::HGet => self.cmd_hget(args),
            Command::HDel => self.cmd_hdel(args),
            Command::HGetAll => self.cmd_hgetall(args),
            Command::Expire => self.cmd_expire(args),
        }
    }

    // ========================================================================
    // Helper functions
    // ========================================================================

    fn exact(command: Command, args: &[RespValue], n: usize) -> Result<(), CommandError> {
        if args.len() != n {
            return Err(CommandError::WrongArgCount(command.name()));
        }
        Ok(())
    }

    fn at_least(command: Command, args: &[RespValue], n: usize) -> Result<(), CommandError> {
        if args.len() < n {
            return Err(CommandError::WrongArgCount(command.name()));
        }
        Ok(())
    }

    fn bulk(command: Command, arg: &RespValue) -> Result<Bytes, CommandError> {
        arg.as_bytes()
            .cloned()
            .ok_or(CommandError::InvalidArgument(command.name()))
    }

    fn bulks(command: Command, args: &[RespValue]) -> Result<Vec<Bytes>, CommandError> {
        args.iter().map(|arg| Self::bulk(command, arg)).collect()
    }

    fn or_null(value: Option<Bytes>) -> RespValue {
        value.map(RespValue::BulkString).unwrap_or(RespValue::Null)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// PING [message]
    fn cmd_ping(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        match args {
            [] => Ok(RespValue::pong()),
            [message] => {
                let message = Self::bulk(Command::Ping, message)?;
                // simple strings are line-delimited
                let text = String::from_utf8_lossy(&message).replace(['\r', '\n'], " ");
                Ok(RespValue::simple_string(text))
            }
            _ => Err(CommandError::WrongArgCount(Command::Ping.name())),
        }
    }

    /// SET key value
    fn cmd_set(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        Self::exact(Command::Set, args, 2)?;
        let key = Self::bulk(Command::Set, &args[0])?;
        let value = Self::bulk(Command::Set, &args[1])?;

        self.storage.set(key, value);
        Ok(RespValue::ok())
    }

    /// GET key
    fn cmd_get(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        Self::exact(Command::Get, args, 1)?;
        let key = Self::bulk(Command::Get, &args[0])?;

        Ok(Self::or_null(self.storage.get(&key)))
    }

    /// DEL key [key ...]
    fn cmd_del(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        Self::at_least(Command::Del, args, 1)?;
        let keys = Self::bulks(Command::Del, args)?;

        self.storage.delete_many(&keys);
        Ok(RespValue::ok())
    }

    /// HSET key field value
    fn cmd_hset(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        Self::exact(Command::HSet, args, 3)?;
        let key = Self::bulk(Command::HSet, &args[0])?;
        let field = Self::bulk(Command::HSet, &args[1])?;
        let value = Self::bulk(Command::HSet, &args[2])?;

        self.storage.hset(key, field, value);
        Ok(RespValue::ok())
    }

    /// HGET key field
    fn cmd_hget(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        Self::exact(Command::HGet, args, 2)?;
        let key = Self::bulk(Command::HGet, &args[0])?;
        let field = Self::bulk(Command::HGet, &args[1])?;

        Ok(Self::or_null(self.storage.hget(&key, &field)))
    }

    /// HDEL key field [field ...]
    fn cmd_hdel(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        Self::at_least(Command::HDel, args, 2)?;
        let key = Self::bulk(Command::HDel, &args[0])?;
        let fields = Self::bulks(Command::HDel, &args[1..])?;

        self.storage.hdel(&key, &fields);
        Ok(RespValue::ok())
    }

    /// HGETALL key
    ///
    /// Replies with one bulk string: the key on the first line, then a
    /// `- <value>` line per field. Field names are not included.
    fn cmd_hgetall(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        Self::exact(Command::HGetAll, args, 1)?;
        let key = Self::bulk(Command::HGetAll, &args[0])?;

        let Some(pairs) = self.storage.hgetall(&key) else {
            return Ok(RespValue::null());
        };

        let mut text = Vec::with_capacity(key.len() + 1);
        text.extend_from_slice(&key);
        text.push(b'\n');
        for (_, value) in pairs {
            text.extend_from_slice(b"- ");
            text.extend_from_slice(&value);
            text.push(b'\n');
        }

        Ok(RespValue::bulk_string(text))
    }

    /// EXPIRE key seconds nx|xx|gt|lt
    fn cmd_expire(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        Self::exact(Command::Expire, args, 3)?;
        let key = Self::bulk(Command::Expire, &args[0])?;
        let seconds = Self::bulk(Command::Expire, &args[1])?;
        let policy = Self::bulk(Command::Expire, &args[2])?;

        let seconds: i64 = std::str::from_utf8(&seconds)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(CommandError::SecondsNotANumber)?;
        let policy: ExpirePolicy = String::from_utf8_lossy(&policy).parse()?;

        let deadline = deadline_after(Instant::now(), seconds);
        self.storage.expire(key, deadline, policy)?;

        Ok(RespValue::bulk_string(Bytes::from_static(EXPIRE_SET.as_bytes())))
    }
}
