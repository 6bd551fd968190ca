//! Command errors.
//!
//! Every variant is turned into an error reply by the dispatcher; none of
//! them closes the connection. The `Display` text is the reply text.

use crate::protocol::RespValue;
use crate::storage::{ExpireError, UnknownPolicy};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArgCount(&'static str),

    #[error("ERR seconds is not a number")]
    SecondsNotANumber,

    #[error("ERR unknown option '{0}'")]
    UnknownOption(String),

    /// NoExpiration, NotGreater or NotLesser from the expiration index
    #[error("ERR {0}")]
    Expire(#[from] ExpireError),

    #[error("ERR invalid argument for '{0}' command, expected a bulk string")]
    InvalidArgument(&'static str),

    #[error("ERR invalid request, {0}")]
    InvalidRequest(&'static str),

    /// The write was applied but could not be appended to the log
    #[error("ERR failed to persist write")]
    Persist,
}

impl From<UnknownPolicy> for CommandError {
    fn from(err: UnknownPolicy) -> Self {
        CommandError::UnknownOption(err.0)
    }
}

impl From<CommandError> for RespValue {
    fn from(err: CommandError) -> Self {
        RespValue::error(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_text() {
        assert_eq!(
            RespValue::from(CommandError::WrongArgCount("get")),
            RespValue::error("ERR wrong number of arguments for 'get' command")
        );
        assert_eq!(
            RespValue::from(CommandError::from(ExpireError::NotGreater)),
            RespValue::error("ERR new expiry is not greater than the current one")
        );
        assert_eq!(
            CommandError::from(UnknownPolicy("ex".into())).to_string(),
            "ERR unknown option 'ex'"
        );
    }
}
