// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::Bytes;
use thiserror::Error as ThisError;

pub(crate) static CRLF: &[u8; 2] = b"\r\n";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame type marker: {0}")]
    InvalidMarker(u8),
    #[error("invalid byte in integer: {0}")]
    InvalidInteger(u8),
    #[error("invalid declared length: {0}")]
    InvalidLength(i64),
    #[error("frame terminated with something other than CRLF")]
    BadLineEnding,
    #[error("frame text is not valid UTF-8")]
    InvalidUtf8,
    #[error("frame size exceeds limit")]
    FrameTooLarge,
}

/// A single RESP value.
///
/// The nil bulk string (`$-1\r\n`) and the nil array (`*-1\r\n`) are distinct
/// variants because they have distinct encodings and must round-trip. A frame
/// is self-contained once decoded; it holds no reference to the buffer or
/// connection it was parsed from.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    NullBulk,
    Array(Vec<Frame>),
    NullArray,
}

impl Frame {
    /// Encodes the frame into its RESP wire representation. Pure; the
    /// encoding rules are fixed by the protocol and not configurable.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Frame::Simple(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(b'+');
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Error(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(b'-');
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Integer(i) => {
                let digits = i.to_string();
                let mut bytes = Vec::with_capacity(1 + digits.len() + CRLF.len());
                bytes.push(b':');
                bytes.extend_from_slice(digits.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Bulk(data) => {
                let length = data.len().to_string();
                let mut bytes =
                    Vec::with_capacity(1 + length.len() + CRLF.len() + data.len() + CRLF.len());
                bytes.push(b'$');
                bytes.extend_from_slice(length.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::NullBulk => b"$-1\r\n".to_vec(),
            Frame::Array(items) => {
                let count = items.len().to_string();
                let mut bytes = Vec::with_capacity(1 + count.len() + CRLF.len());
                bytes.push(b'*');
                bytes.extend_from_slice(count.as_bytes());
                bytes.extend_from_slice(CRLF);
                for item in items {
                    bytes.extend(item.serialize());
                }
                bytes
            }
            Frame::NullArray => b"*-1\r\n".to_vec(),
        }
    }

    /// Short name of the frame's shape, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "simple string",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::Bulk(_) | Frame::NullBulk => "bulk string",
            Frame::Array(_) | Frame::NullArray => "array",
        }
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::NullBulk => write!(f, "$-1"),
            Frame::Array(items) => {
                write!(f, "*{}", items.len())?;
                for item in items {
                    write!(f, " {}", item)?;
                }
                Ok(())
            }
            Frame::NullArray => write!(f, "*-1"),
        }
    }
}
