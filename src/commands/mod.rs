pub mod executable;
pub mod get;
pub mod hget;
pub mod hgetall;
pub mod hset;
pub mod ping;
pub mod set;

use bytes::Bytes;
use std::{str, vec};
use thiserror::Error as ThisError;

use crate::commands::executable::Executable;
use crate::frame::Frame;
use crate::registry::Registry;
use crate::store::Store;
use crate::Error;

use get::Get;
use hget::HGet;
use hgetall::HGetAll;
use hset::HSet;
use ping::Ping;
use set::Set;

/// Builds a registry holding every built-in command, all of them operating on `store`.
pub fn registry(store: Store) -> Registry {
    let mut registry = Registry::new();

    registry
        .register("ping", handler::<Ping>("ping", store.clone()))
        .register("get", handler::<Get>("get", store.clone()))
        .register("set", handler::<Set>("set", store.clone()))
        .register("hget", handler::<HGet>("hget", store.clone()))
        .register("hgetall", handler::<HGetAll>("hgetall", store.clone()))
        .register("hset", handler::<HSet>("hset", store));

    registry
}

/// Adapts a typed command into a registry handler: the arguments are parsed into `C`, which
/// is then executed against the store. Any failure is turned into an error reply.
fn handler<C>(name: &'static str, store: Store) -> impl Fn(&[Frame]) -> Frame + Send + Sync
where
    C: Executable + for<'a> TryFrom<&'a mut CommandParser, Error = Error>,
{
    move |args: &[Frame]| -> Frame {
        let parser = &mut CommandParser::new(name, args.to_vec());

        let res = C::try_from(&mut *parser).and_then(|cmd| {
            parser.finish()?;
            cmd.exec(&store)
        });

        res.unwrap_or_else(|e| Frame::Error(e.to_string()))
    }
}

pub struct CommandParser {
    command: &'static str,
    parts: vec::IntoIter<Frame>,
}

impl CommandParser {
    pub fn new(command: &'static str, args: Vec<Frame>) -> CommandParser {
        CommandParser {
            command,
            parts: args.into_iter(),
        }
    }

    fn next(&mut self) -> Result<Frame, CommandParserError> {
        self.parts
            .next()
            .ok_or_else(|| CommandParserError::EndOfStream {
                command: self.command.to_string(),
            })
    }

    pub fn has_remaining(&self) -> bool {
        self.parts.len() > 0
    }

    pub fn next_string(&mut self) -> Result<String, CommandParserError> {
        match self.next()? {
            // Both `Simple` and `Bulk` representation may be strings. Strings are parsed to UTF-8.
            // While errors are stored as strings, they are considered separate types.
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

    pub fn next_bytes(&mut self) -> Result<Bytes, CommandParserError> {
        match self.next()? {
            Frame::Simple(s) => Ok(Bytes::from(s)),
            Frame::Bulk(bytes) => Ok(bytes),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple or bulk string".to_string(),
                actual: frame,
            }),
        }
    }

    /// Fails if there are arguments left that the command did not consume.
    pub fn finish(&mut self) -> Result<(), CommandParserError> {
        if self.has_remaining() {
            return Err(CommandParserError::TrailingArguments {
                command: self.command.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandParserError {
    #[error("ERR invalid argument, expected {expected}, got {}", .actual.type_name())]
    InvalidFrame { expected: String, actual: Frame },
    #[error("ERR invalid UTF-8 string")]
    InvalidUTF8String(#[from] str::Utf8Error),
    #[error("ERR wrong number of arguments for '{command}' command")]
    EndOfStream { command: String },
    #[error("ERR wrong number of arguments for '{command}' command")]
    TrailingArguments { command: String },
}
