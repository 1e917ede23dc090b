use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// Removes every key from the store.
///
/// Ref: <https://redis.io/docs/latest/commands/flushdb/>
#[derive(Debug, PartialEq)]
pub struct FlushDb;

impl Executable for FlushDb {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        store.clear();
        Ok(Frame::Simple("OK".to_string()))
    }
}

impl TryFrom<&mut CommandParser> for FlushDb {
    type Error = Error;

    fn try_from(_parser: &mut CommandParser) -> Result<Self, Self::Error> {
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn empties_the_store() {
        let store = Store::new();
        store.set("a".to_string(), Bytes::from("1"));

        assert_eq!(
            FlushDb.exec(store.clone()).unwrap(),
            Frame::Simple("OK".to_string())
        );
        assert!(store.is_empty());
    }
}
