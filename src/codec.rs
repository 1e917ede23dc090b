use bytes::{Buf, Bytes, BytesMut};
use std::env;
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::frame::{self, Frame, CRLF};
use crate::Error;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Incremental RESP frame codec.
///
/// The transport delivers arbitrary byte chunks with no frame alignment
/// guarantee, so `decode` must be resumable: it returns `Ok(None)` when the
/// buffered bytes do not yet contain a complete frame and picks up where it
/// left off on the next call.
///
/// Progress through a nested array is tracked as data, not control flow: the
/// codec keeps a stack of in-progress arrays recording how many children each
/// still needs. Completed children are consumed from the buffer exactly once
/// and parked on the stack, so a resume never re-decodes them. Leaf frames
/// are only consumed when complete; an interrupted leaf scan restarts from
/// the frame's first byte, which yields the same result because the bytes are
/// still buffered.
pub struct FrameCodec {
    stack: Vec<PartialArray>,
    max_frame_size: usize,
}

struct PartialArray {
    expected: usize,
    items: Vec<Frame>,
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        let max_frame_size = env::var("REDLINK_MAX_FRAME_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE);

        FrameCodec {
            stack: Vec::new(),
            max_frame_size,
        }
    }

    /// Like [`Decoder::decode`], but with the protocol-level error type so
    /// callers can tell a fatal protocol error from an I/O failure.
    pub fn try_decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, frame::Error> {
        if src.len() > self.max_frame_size {
            return Err(frame::Error::FrameTooLarge);
        }

        loop {
            let mut cursor = Cursor::new(&src[..]);
            let node = match parse_node(&mut cursor, self.max_frame_size) {
                Ok(node) => node,
                Err(frame::Error::Incomplete) => return Ok(None),
                Err(err) => return Err(err),
            };

            // The node is complete; drop its bytes from the buffer.
            let consumed = cursor.position() as usize;
            drop(cursor);
            src.advance(consumed);

            let mut frame = match node {
                Node::Value(frame) => frame,
                Node::ArrayHeader(count) => {
                    // The declared count is peer-controlled; cap what it can
                    // pre-allocate.
                    self.stack.push(PartialArray {
                        expected: count,
                        items: Vec::with_capacity(count.min(64)),
                    });
                    continue;
                }
            };

            // Fold the finished frame into the innermost in-progress array,
            // popping every array it completes.
            loop {
                let completes_array = match self.stack.last_mut() {
                    None => return Ok(Some(frame)),
                    Some(partial) => {
                        partial.items.push(frame);
                        partial.items.len() == partial.expected
                    }
                };
                if !completes_array {
                    break;
                }
                let done = self.stack.pop().expect("observed a non-empty stack");
                frame = Frame::Array(done.items);
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.try_decode(src).map_err(Into::into)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&frame.serialize());
        Ok(())
    }
}

impl Encoder<&Command> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, command: &Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&command.serialize());
        Ok(())
    }
}

/// Either a complete frame or the header of an array whose children have not
/// been decoded yet.
enum Node {
    Value(Frame),
    ArrayHeader(usize),
}

fn parse_node(src: &mut Cursor<&[u8]>, max_frame_size: usize) -> Result<Node, frame::Error> {
    let marker = get_byte(src)?;

    match marker {
        b'+' => {
            let line = get_line(src)?;
            Ok(Node::Value(Frame::Simple(to_utf8(line)?)))
        }
        b'-' => {
            let line = get_line(src)?;
            Ok(Node::Value(Frame::Error(to_utf8(line)?)))
        }
        b':' => Ok(Node::Value(Frame::Integer(get_integer(src)?))),
        b'$' => {
            let length = get_integer(src)?;
            if length == -1 {
                return Ok(Node::Value(Frame::NullBulk));
            }
            if length < 0 {
                return Err(frame::Error::InvalidLength(length));
            }
            let length = length as usize;
            if length > max_frame_size {
                return Err(frame::Error::FrameTooLarge);
            }

            let start = src.position() as usize;
            let buffer = *src.get_ref();
            if buffer.len() < start + length + CRLF.len() {
                return Err(frame::Error::Incomplete);
            }
            // The payload is opaque binary data; only the terminator is
            // validated.
            if &buffer[start + length..start + length + CRLF.len()] != CRLF {
                return Err(frame::Error::BadLineEnding);
            }
            let data = Bytes::copy_from_slice(&buffer[start..start + length]);
            src.set_position((start + length + CRLF.len()) as u64);

            Ok(Node::Value(Frame::Bulk(data)))
        }
        b'*' => {
            let count = get_integer(src)?;
            match count {
                -1 => Ok(Node::Value(Frame::NullArray)),
                0 => Ok(Node::Value(Frame::Array(Vec::new()))),
                n if n < 0 => Err(frame::Error::InvalidLength(n)),
                // Every element takes wire bytes, so a count past the frame
                // limit can never complete.
                n if n as u64 > max_frame_size as u64 => Err(frame::Error::FrameTooLarge),
                n => Ok(Node::ArrayHeader(n as usize)),
            }
        }
        marker => Err(frame::Error::InvalidMarker(marker)),
    }
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, frame::Error> {
    if !src.has_remaining() {
        return Err(frame::Error::Incomplete);
    }
    Ok(src.get_u8())
}

/// Returns the bytes up to the next CRLF and consumes through the terminator.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], frame::Error> {
    let start = src.position() as usize;
    let buffer = *src.get_ref();

    let line_end = buffer[start..]
        .windows(CRLF.len())
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(frame::Error::Incomplete)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&buffer[start..line_end])
}

/// Parses a signed base-10 integer line. Only ASCII digits with a single
/// optional leading `-` are accepted; anything else is a protocol error.
fn get_integer(src: &mut Cursor<&[u8]>) -> Result<i64, frame::Error> {
    let line = get_line(src)?;

    let (digits, sign) = match line.split_first() {
        Some((b'-', rest)) => (rest, -1i64),
        _ => (line, 1),
    };

    if digits.is_empty() {
        return Err(frame::Error::InvalidInteger(b'\r'));
    }

    let mut value: i64 = 0;
    for &byte in digits {
        if !byte.is_ascii_digit() {
            return Err(frame::Error::InvalidInteger(byte));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(i64::from(byte - b'0')))
            .ok_or(frame::Error::InvalidInteger(byte))?;
    }

    Ok(sign * value)
}

fn to_utf8(line: &[u8]) -> Result<String, frame::Error> {
    String::from_utf8(line.to_vec()).map_err(|_| frame::Error::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = codec.try_decode(&mut buffer).unwrap() {
            frames.push(frame);
        }
        assert!(buffer.is_empty(), "decoder left bytes behind");
        frames
    }

    fn decode_one(bytes: &[u8]) -> Frame {
        let mut frames = decode_all(bytes);
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }

    #[test]
    fn decode_simple_string() {
        assert_eq!(decode_one(b"+OK\r\n"), Frame::Simple("OK".to_string()));
    }

    #[test]
    fn decode_error() {
        assert_eq!(
            decode_one(b"-Error message\r\n"),
            Frame::Error("Error message".to_string())
        );
    }

    #[test]
    fn decode_integer() {
        assert_eq!(decode_one(b":1000\r\n"), Frame::Integer(1000));
        assert_eq!(decode_one(b":-1000\r\n"), Frame::Integer(-1000));
        assert_eq!(decode_one(b":0\r\n"), Frame::Integer(0));
    }

    #[test]
    fn decode_integer_rejects_plus_sign() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b":+1000\r\n"[..]);
        assert!(matches!(
            codec.try_decode(&mut buffer),
            Err(frame::Error::InvalidInteger(b'+'))
        ));
    }

    #[test]
    fn decode_integer_rejects_embedded_garbage() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b":12a4\r\n"[..]);
        assert!(matches!(
            codec.try_decode(&mut buffer),
            Err(frame::Error::InvalidInteger(b'a'))
        ));
    }

    #[test]
    fn decode_bulk_string() {
        assert_eq!(
            decode_one(b"$6\r\nfoobar\r\n"),
            Frame::Bulk(Bytes::from("foobar"))
        );
    }

    #[test]
    fn decode_bulk_string_empty() {
        assert_eq!(decode_one(b"$0\r\n\r\n"), Frame::Bulk(Bytes::new()));
    }

    #[test]
    fn decode_bulk_string_binary_safe() {
        assert_eq!(
            decode_one(b"$4\r\na\r\nb\r\n"),
            Frame::Bulk(Bytes::from(&b"a\r\nb"[..]))
        );
    }

    #[test]
    fn decode_bulk_string_null() {
        // The nil bulk decodes to the nil marker, not an empty byte string.
        assert_eq!(decode_one(b"$-1\r\n"), Frame::NullBulk);
    }

    #[test]
    fn decode_bulk_string_bad_terminator() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b"$3\r\nfooXX"[..]);
        assert!(matches!(
            codec.try_decode(&mut buffer),
            Err(frame::Error::BadLineEnding)
        ));
    }

    #[test]
    fn decode_array() {
        assert_eq!(
            decode_one(b"*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n"),
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("hello")),
                Frame::Bulk(Bytes::from("world")),
            ])
        );
    }

    #[test]
    fn decode_array_empty() {
        assert_eq!(decode_one(b"*0\r\n"), Frame::Array(Vec::new()));
    }

    #[test]
    fn decode_array_null() {
        assert_eq!(decode_one(b"*-1\r\n"), Frame::NullArray);
    }

    #[test]
    fn decode_array_with_null_in_the_middle() {
        assert_eq!(
            decode_one(b"*3\r\n$5\r\nhello\r\n$-1\r\n$5\r\nworld\r\n"),
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("hello")),
                Frame::NullBulk,
                Frame::Bulk(Bytes::from("world")),
            ])
        );
    }

    #[test]
    fn decode_array_nested() {
        assert_eq!(
            decode_one(b"*2\r\n*3\r\n:1\r\n:2\r\n:3\r\n*2\r\n+Hello\r\n-World\r\n"),
            Frame::Array(vec![
                Frame::Array(vec![
                    Frame::Integer(1),
                    Frame::Integer(2),
                    Frame::Integer(3),
                ]),
                Frame::Array(vec![
                    Frame::Simple("Hello".to_string()),
                    Frame::Error("World".to_string()),
                ]),
            ])
        );
    }

    #[test]
    fn decode_rejects_absurd_array_count() {
        // A tiny frame declaring an enormous array must be a protocol error,
        // not an allocation.
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b"*9000000000000000000\r\n"[..]);
        assert!(matches!(
            codec.try_decode(&mut buffer),
            Err(frame::Error::FrameTooLarge)
        ));
    }

    #[test]
    fn decode_invalid_marker() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b"foo\r\n"[..]);
        assert!(matches!(
            codec.try_decode(&mut buffer),
            Err(frame::Error::InvalidMarker(b'f'))
        ));
    }

    #[test]
    fn decode_incomplete_consumes_nothing() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b"$5\r\nhel"[..]);
        assert!(codec.try_decode(&mut buffer).unwrap().is_none());
        assert_eq!(&buffer[..], b"$5\r\nhel");
    }

    #[test]
    fn decode_multiple_frames_from_one_buffer() {
        let frames = decode_all(b"+OK\r\n:7\r\n$2\r\nhi\r\n");
        assert_eq!(
            frames,
            vec![
                Frame::Simple("OK".to_string()),
                Frame::Integer(7),
                Frame::Bulk(Bytes::from("hi")),
            ]
        );
    }

    #[test]
    fn encode_frames_and_commands_to_wire_bytes() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::new();

        codec
            .encode(&Frame::Simple("OK".to_string()), &mut buffer)
            .unwrap();
        codec
            .encode(&Command::new("GET").arg("k"), &mut buffer)
            .unwrap();

        assert_eq!(&buffer[..], b"+OK\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
    }

    #[test]
    fn round_trip_every_variant() {
        let frames = vec![
            Frame::Simple("OK".to_string()),
            Frame::Error("ERR nope".to_string()),
            Frame::Integer(42),
            Frame::Integer(-42),
            Frame::Bulk(Bytes::from("hello")),
            Frame::Bulk(Bytes::new()),
            Frame::NullBulk,
            Frame::NullArray,
            Frame::Array(Vec::new()),
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("message")),
                Frame::Array(vec![Frame::Integer(1), Frame::NullBulk]),
                Frame::Simple("nested".to_string()),
            ]),
        ];

        for frame in frames {
            assert_eq!(decode_one(&frame.serialize()), frame);
        }
    }

    /// Splitting an encoded frame at every possible cut point and feeding the
    /// two pieces separately must decode to the same value as one delivery.
    #[test]
    fn decode_is_chunking_invariant() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("pmessage")),
            Frame::Bulk(Bytes::from("news.*")),
            Frame::Array(vec![Frame::Integer(-3), Frame::NullBulk]),
            Frame::Bulk(Bytes::from("breaking\r\nnews")),
        ]);
        let encoded = frame.serialize();

        for cut in 0..=encoded.len() {
            let mut codec = FrameCodec::new();
            let mut buffer = BytesMut::new();

            buffer.extend_from_slice(&encoded[..cut]);
            let first = codec.try_decode(&mut buffer).unwrap();

            buffer.extend_from_slice(&encoded[cut..]);
            let decoded = match first {
                Some(frame) => frame,
                None => codec
                    .try_decode(&mut buffer)
                    .unwrap()
                    .expect("frame must complete once all bytes arrived"),
            };

            assert_eq!(decoded, frame, "cut point {}", cut);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn decode_byte_by_byte() {
        let frame = Frame::Array(vec![
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("deeply")),
                Frame::Array(vec![Frame::Bulk(Bytes::from("nested"))]),
            ]),
            Frame::Integer(360),
        ]);
        let encoded = frame.serialize();

        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::new();
        let mut decoded = None;

        for (i, byte) in encoded.iter().enumerate() {
            buffer.extend_from_slice(&[*byte]);
            if let Some(frame) = codec.try_decode(&mut buffer).unwrap() {
                assert_eq!(i, encoded.len() - 1, "frame completed early");
                decoded = Some(frame);
            }
        }

        assert_eq!(decoded, Some(frame));
    }
}
