use crate::commands::{CommandParser, CommandParserError};
use crate::Error;

/// The subscribe family. All four are connection-stateful and handled by the
/// connection driver against the subscriber registry; their confirmations
/// are written as push-style frames, one per channel or pattern.
///
/// Ref: <https://redis.io/docs/latest/commands/subscribe/>
#[derive(Debug, PartialEq)]
pub struct Subscribe {
    pub channels: Vec<String>,
}

#[derive(Debug, PartialEq)]
pub struct Psubscribe {
    pub patterns: Vec<String>,
}

/// With no arguments, unsubscribes from every channel.
#[derive(Debug, PartialEq)]
pub struct Unsubscribe {
    pub channels: Vec<String>,
}

#[derive(Debug, PartialEq)]
pub struct Punsubscribe {
    pub patterns: Vec<String>,
}

/// At least one name required.
fn names(parser: &mut CommandParser) -> Result<Vec<String>, Error> {
    let mut names = vec![];
    loop {
        match parser.next_string() {
            Ok(name) => names.push(name),
            Err(CommandParserError::EndOfStream) if !names.is_empty() => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(names)
}

/// Zero names allowed.
fn optional_names(parser: &mut CommandParser) -> Result<Vec<String>, Error> {
    let mut names = vec![];
    loop {
        match parser.next_string() {
            Ok(name) => names.push(name),
            Err(CommandParserError::EndOfStream) => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(names)
}

impl TryFrom<&mut CommandParser> for Subscribe {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        Ok(Self {
            channels: names(parser)?,
        })
    }
}

impl TryFrom<&mut CommandParser> for Psubscribe {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        Ok(Self {
            patterns: names(parser)?,
        })
    }
}

impl TryFrom<&mut CommandParser> for Unsubscribe {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        Ok(Self {
            channels: optional_names(parser)?,
        })
    }
}

impl TryFrom<&mut CommandParser> for Punsubscribe {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        Ok(Self {
            patterns: optional_names(parser)?,
        })
    }
}
