use bytes::Bytes;

use crate::commands::CommandParser;
use crate::Error;

/// Posts `payload` to `channel`. Routed by the connection driver through the
/// subscriber registry; the reply is the number of clients that received the
/// message.
///
/// Ref: <https://redis.io/docs/latest/commands/publish/>
#[derive(Debug, PartialEq)]
pub struct Publish {
    pub channel: String,
    pub payload: Bytes,
}

impl TryFrom<&mut CommandParser> for Publish {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let channel = parser.next_string()?;
        let payload = parser.next_bytes()?;
        Ok(Self { channel, payload })
    }
}
