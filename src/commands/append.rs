use bytes::Bytes;

use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// Appends `value` to the string at `key`, creating it when absent. Replies
/// with the length of the string after the append.
///
/// Ref: <https://redis.io/docs/latest/commands/append/>
#[derive(Debug, PartialEq)]
pub struct Append {
    pub key: String,
    pub value: Bytes,
}

impl Executable for Append {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        let length = store.append(&self.key, &self.value);
        Ok(Frame::Integer(length as i64))
    }
}

impl TryFrom<&mut CommandParser> for Append {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_string()?;
        let value = parser.next_bytes()?;
        Ok(Self { key, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_to_missing_and_existing_key() {
        let store = Store::new();

        let cmd = Append {
            key: "k".to_string(),
            value: Bytes::from("foo"),
        };
        assert_eq!(cmd.exec(store.clone()).unwrap(), Frame::Integer(3));

        let cmd = Append {
            key: "k".to_string(),
            value: Bytes::from("bar"),
        };
        assert_eq!(cmd.exec(store.clone()).unwrap(), Frame::Integer(6));

        assert_eq!(store.get("k"), Some(Bytes::from("foobar")));
    }
}
