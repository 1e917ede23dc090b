pub mod append;
pub mod dbsize;
pub mod decr;
pub mod del;
pub mod echo;
pub mod executable;
pub mod exists;
pub mod flushdb;
pub mod get;
pub mod incr;
pub mod ping;
pub mod publish;
pub mod set;
pub mod strlen;
pub mod subscribe;

use std::{str, vec};
use thiserror::Error as ThisError;

use crate::commands::executable::Executable;
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

use append::Append;
use bytes::Bytes;
use dbsize::DBSize;
use decr::Decr;
use del::Del;
use echo::Echo;
use exists::Exists;
use flushdb::FlushDb;
use get::Get;
use incr::Incr;
use ping::Ping;
use publish::Publish;
use set::Set;
use strlen::Strlen;
use subscribe::{Psubscribe, Punsubscribe, Subscribe, Unsubscribe};

/// A parsed inbound command. The name→variant mapping is a plain static
/// match on the lowercased verb; there is no reflective dispatch.
#[derive(Debug, PartialEq)]
pub enum Command {
    Append(Append),
    DBSize(DBSize),
    Decr(Decr),
    Del(Del),
    Echo(Echo),
    Exists(Exists),
    FlushDb(FlushDb),
    Get(Get),
    Incr(Incr),
    Ping(Ping),
    Set(Set),
    Strlen(Strlen),

    // Connection-stateful: handled by the connection driver, not the store.
    Publish(Publish),
    Subscribe(Subscribe),
    Psubscribe(Psubscribe),
    Unsubscribe(Unsubscribe),
    Punsubscribe(Punsubscribe),
}

impl Executable for Command {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        match self {
            Command::Append(cmd) => cmd.exec(store),
            Command::DBSize(cmd) => cmd.exec(store),
            Command::Decr(cmd) => cmd.exec(store),
            Command::Del(cmd) => cmd.exec(store),
            Command::Echo(cmd) => cmd.exec(store),
            Command::Exists(cmd) => cmd.exec(store),
            Command::FlushDb(cmd) => cmd.exec(store),
            Command::Get(cmd) => cmd.exec(store),
            Command::Incr(cmd) => cmd.exec(store),
            Command::Ping(cmd) => cmd.exec(store),
            Command::Set(cmd) => cmd.exec(store),
            Command::Strlen(cmd) => cmd.exec(store),

            // The connection driver routes these before dispatching here.
            Command::Publish(_)
            | Command::Subscribe(_)
            | Command::Psubscribe(_)
            | Command::Unsubscribe(_)
            | Command::Punsubscribe(_) => Ok(Frame::Error(
                "ERR subscription commands are handled by the connection".to_string(),
            )),
        }
    }
}

impl TryFrom<Frame> for Command {
    type Error = Error;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        // Clients send commands to the server as RESP arrays.
        let frames = match frame {
            Frame::Array(array) => array,
            frame => {
                return Err(CommandParserError::InvalidFrame {
                    expected: "array".to_string(),
                    actual: frame,
                }
                .into())
            }
        };

        let parser = &mut CommandParser {
            parts: frames.into_iter(),
        };

        let command_name = parser.parse_command_name()?;

        match &command_name[..] {
            "append" => Append::try_from(parser).map(Command::Append),
            "dbsize" => DBSize::try_from(parser).map(Command::DBSize),
            "decr" => Decr::try_from(parser).map(Command::Decr),
            "del" => Del::try_from(parser).map(Command::Del),
            "echo" => Echo::try_from(parser).map(Command::Echo),
            "exists" => Exists::try_from(parser).map(Command::Exists),
            "flushdb" => FlushDb::try_from(parser).map(Command::FlushDb),
            "get" => Get::try_from(parser).map(Command::Get),
            "incr" => Incr::try_from(parser).map(Command::Incr),
            "ping" => Ping::try_from(parser).map(Command::Ping),
            "publish" => Publish::try_from(parser).map(Command::Publish),
            "set" => Set::try_from(parser).map(Command::Set),
            "strlen" => Strlen::try_from(parser).map(Command::Strlen),
            "subscribe" => Subscribe::try_from(parser).map(Command::Subscribe),
            "psubscribe" => Psubscribe::try_from(parser).map(Command::Psubscribe),
            "unsubscribe" => Unsubscribe::try_from(parser).map(Command::Unsubscribe),
            "punsubscribe" => Punsubscribe::try_from(parser).map(Command::Punsubscribe),
            _ => Err(CommandParserError::UnknownCommand {
                command: command_name,
            }
            .into()),
        }
    }
}

pub struct CommandParser {
    parts: vec::IntoIter<Frame>,
}

impl CommandParser {
    fn parse_command_name(&mut self) -> Result<String, CommandParserError> {
        let command_name = self.parts.next().ok_or(CommandParserError::EndOfStream)?;

        match command_name {
            Frame::Simple(s) => Ok(s.to_lowercase()),
            Frame::Bulk(bytes) => str::from_utf8(&bytes[..])
                .map(|s| s.to_lowercase())
                .map_err(CommandParserError::InvalidUTF8String),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple string".to_string(),
                actual: frame,
            }),
        }
    }

    fn next_string(&mut self) -> Result<String, CommandParserError> {
        let frame = self.parts.next().ok_or(CommandParserError::EndOfStream)?;

        match frame {
            // Both `Simple` and `Bulk` representations may be strings.
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(bytes) => str::from_utf8(&bytes[..])
                .map(|s| s.to_string())
                .map_err(CommandParserError::InvalidUTF8String),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple or bulk string".to_string(),
                actual: frame,
            }),
        }
    }

    fn next_bytes(&mut self) -> Result<Bytes, CommandParserError> {
        let frame = self.parts.next().ok_or(CommandParserError::EndOfStream)?;

        match frame {
            Frame::Simple(s) => Ok(Bytes::from(s)),
            Frame::Bulk(bytes) => Ok(bytes),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple or bulk string".to_string(),
                actual: frame,
            }),
        }
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandParserError {
    #[error("protocol error; invalid frame, expected {expected}, got {actual}")]
    InvalidFrame { expected: String, actual: Frame },
    #[error("unknown command '{command}'")]
    UnknownCommand { command: String },
    #[error("protocol error; invalid UTF-8 string")]
    InvalidUTF8String(#[from] str::Utf8Error),
    #[error("wrong number of arguments")]
    EndOfStream,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn parse_get_command_with_simple_string() {
        let get_frame = Frame::Array(vec![
            Frame::Simple(String::from("GET")),
            Frame::Simple(String::from("foo")),
        ]);

        let get_command = Command::try_from(get_frame).unwrap();

        assert_eq!(
            get_command,
            Command::Get(Get {
                key: String::from("foo")
            })
        );
    }

    #[test]
    fn parse_get_command_with_bulk_string() {
        let get_frame = Frame::Array(vec![
            Frame::Simple(String::from("GET")),
            Frame::Bulk(Bytes::from("foo-from-bytes")),
        ]);

        let get_command = Command::try_from(get_frame).unwrap();

        assert_eq!(
            get_command,
            Command::Get(Get {
                key: String::from("foo-from-bytes")
            })
        );
    }

    #[test]
    fn parse_is_case_insensitive() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("PiNg")),
        ]);
        let command = Command::try_from(frame).unwrap();
        assert_eq!(command, Command::Ping(Ping { payload: None }));
    }

    #[test]
    fn parse_unknown_command() {
        let frame = Frame::Array(vec![Frame::Bulk(Bytes::from("FROB"))]);
        let err = Command::try_from(frame).err().unwrap();
        let err = err.downcast_ref::<CommandParserError>().unwrap();

        assert_eq!(
            *err,
            CommandParserError::UnknownCommand {
                command: "frob".to_string()
            }
        );
    }

    #[test]
    fn parse_rejects_non_array() {
        let err = Command::try_from(Frame::Simple("GET".to_string()))
            .err()
            .unwrap();
        let err = err.downcast_ref::<CommandParserError>().unwrap();

        assert!(matches!(*err, CommandParserError::InvalidFrame { .. }));
    }
}
