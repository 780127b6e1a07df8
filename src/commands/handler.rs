//! Command Dispatch
//!
//! Turns a decoded request (an array of bulk strings `[command, arg...]`)
//! into a reply. Command names are matched case-insensitively.
//!
//! ## Supported Commands
//!
//! - `PING [message]` - Test connection
//! - `ECHO message` - Echo message
//! - `SET key value [PX milliseconds]` - Set a key, optionally with a TTL
//! - `GET key` - Get a key's value, or nil if absent or expired
//! - `DEL key [key ...]` - Delete keys
//! - `EXISTS key [key ...]` - Count live keys
//! - `DBSIZE` - Number of keys in the table
//! - `QUIT` - Reply OK and close the connection
//!
//! A bad argument never closes the connection: it is reported as an error
//! reply and the next request is processed normally.

use crate::protocol::RespValue;
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A recognized request that cannot be executed as sent.
///
/// Each variant renders to the text of the error reply sent to the client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR invalid command format")]
    InvalidRequest,

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpireTime(&'static str),

    #[error("ERR unknown option '{0}'")]
    UnknownOption(String),

    #[error("ERR syntax error")]
    Syntax,
}

impl From<CommandError> for RespValue {
    fn from(err: CommandError) -> Self {
        RespValue::error(err.to_string())
    }
}

type CommandResult = Result<RespValue, CommandError>;

/// Returns true if `request` is a QUIT command.
///
/// The connection uses this to close after sending the reply.
pub fn is_quit(request: &RespValue) -> bool {
    request
        .as_array()
        .and_then(|args| args.first())
        .and_then(RespValue::as_bytes)
        .is_some_and(|name| name.eq_ignore_ascii_case(b"QUIT"))
}

/// Executes requests against the shared storage engine.
///
/// Cheap to clone; each connection gets its own handle.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
}

impl CommandHandler {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage }
    }

    /// Executes a request and returns the reply.
    pub fn execute(&self, request: RespValue) -> RespValue {
        self.try_execute(request).unwrap_or_else(RespValue::from)
    }

    fn try_execute(&self, request: RespValue) -> CommandResult {
        let args = match request {
            RespValue::Array(args) if !args.is_empty() => args,
            _ => return Err(CommandError::InvalidRequest),
        };

        let name = args[0].as_bytes().ok_or(CommandError::InvalidRequest)?;
        let upper = name.to_ascii_uppercase();
        let args = &args[1..];

        match upper.as_slice() {
            b"PING" => self.cmd_ping(args),
            b"ECHO" => self.cmd_echo(args),
            b"SET" => self.cmd_set(args),
            b"GET" => self.cmd_get(args),
            b"DEL" => self.cmd_del(args),
            b"EXISTS" => self.cmd_exists(args),
            b"DBSIZE" => Ok(RespValue::integer(self.storage.len() as i64)),
            b"QUIT" => Ok(RespValue::ok()),
            _ => Err(CommandError::UnknownCommand(Self::quoted_arg(name))),
        }
    }

    // ========================================================================
    // Helper functions
    // ========================================================================

    fn get_bytes(value: &RespValue) -> Result<Bytes, CommandError> {
        value.as_bytes().cloned().ok_or(CommandError::Syntax)
    }

    /// Client bytes echoed inside an error line; line breaks become spaces.
    fn quoted_arg(arg: &[u8]) -> String {
        String::from_utf8_lossy(arg).replace(['\r', '\n'], " ")
    }

    /// Parses a millisecond TTL argument.
    fn get_millis(value: &RespValue, cmd: &'static str) -> Result<Duration, CommandError> {
        value
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .ok_or(CommandError::InvalidExpireTime(cmd))
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// PING [message]
    fn cmd_ping(&self, args: &[RespValue]) -> CommandResult {
        match args {
            [] => Ok(RespValue::pong()),
            [msg] => Ok(RespValue::bulk_string(Self::get_bytes(msg)?)),
            _ => Err(CommandError::WrongArity("ping")),
        }
    }

    /// ECHO message
    fn cmd_echo(&self, args: &[RespValue]) -> CommandResult {
        match args {
            [msg] => Ok(RespValue::bulk_string(Self::get_bytes(msg)?)),
            _ => Err(CommandError::WrongArity("echo")),
        }
    }

    /// SET key value [PX milliseconds]
    fn cmd_set(&self, args: &[RespValue]) -> CommandResult {
        let (key, value, options) = match args {
            [key, value, options @ ..] => (Self::get_bytes(key)?, Self::get_bytes(value)?, options),
            _ => return Err(CommandError::WrongArity("set")),
        };

        let ttl = match options {
            [] => None,
            [opt, rest @ ..] => {
                let opt = Self::get_bytes(opt)?;
                if !opt.eq_ignore_ascii_case(b"PX") {
                    return Err(CommandError::UnknownOption(Self::quoted_arg(&opt)));
                }
                match rest {
                    [millis] => Some(Self::get_millis(millis, "set")?),
                    _ => return Err(CommandError::Syntax),
                }
            }
        };

        match ttl {
            Some(ttl) => self.storage.set_with_ttl(key, value, ttl),
            None => self.storage.set(key, value),
        };

        Ok(RespValue::ok())
    }

    /// GET key
    fn cmd_get(&self, args: &[RespValue]) -> CommandResult {
        let [key] = args else {
            return Err(CommandError::WrongArity("get"));
        };

        Ok(match self.storage.get(&Self::get_bytes(key)?) {
            Some(value) => RespValue::bulk_string(value),
            None => RespValue::null(),
        })
    }

    /// DEL key [key ...]
    fn cmd_del(&self, args: &[RespValue]) -> CommandResult {
        if args.is_empty() {
            return Err(CommandError::WrongArity("del"));
        }

        let mut deleted = 0;
        for key in args {
            if self.storage.delete(&Self::get_bytes(key)?) {
                deleted += 1;
            }
        }
        Ok(RespValue::integer(deleted))
    }

    /// EXISTS key [key ...]
    fn cmd_exists(&self, args: &[RespValue]) -> CommandResult {
        if args.is_empty() {
            return Err(CommandError::WrongArity("exists"));
        }

        let mut count = 0;
        for key in args {
            if self.storage.exists(&Self::get_bytes(key)?) {
                count += 1;
            }
        }
        Ok(RespValue::integer(count))
    }
}
