use std::fmt;

use bytes::Bytes;

use crate::frame::CRLF;

/// A request: an ordered sequence of binary-safe arguments, the verb first.
/// Immutable once built; the client layer serializes it as a RESP array of
/// bulk strings.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(verb: impl Into<Bytes>) -> Command {
        Command {
            args: vec![verb.into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Command {
        self.args.push(arg.into());
        self
    }

    /// The command verb, for diagnostics. Lossy on purpose; verbs are ASCII
    /// in practice.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).into_owned()
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Encodes the command exactly like a non-nil array of bulk strings, one
    /// per argument. An empty argument encodes as a zero-length bulk, never
    /// as a nil bulk; requests carry no null arguments.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.push(b'*');
        bytes.extend_from_slice(self.args.len().to_string().as_bytes());
        bytes.extend_from_slice(CRLF);
        for arg in &self.args {
            bytes.push(b'$');
            bytes.extend_from_slice(arg.len().to_string().as_bytes());
            bytes.extend_from_slice(CRLF);
            bytes.extend_from_slice(arg);
            bytes.extend_from_slice(CRLF);
        }
        bytes
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}
