use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Encoder;
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::command::Command;
use crate::frame::{self, Frame};
use crate::Error;

/// A framed RESP connection over a TCP stream.
///
/// Data is read from the socket into the read buffer; the codec consumes
/// bytes from it as frames complete. Frame decoding is strictly sequential
/// per connection: the codec's partial-frame state is not shareable.
pub struct Connection {
    pub id: Uuid,
    stream: TcpStream,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            stream,
            codec: FrameCodec::new(),
            // Allocate the buffer with 4kb of capacity.
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Reads the next complete frame, buffering partial deliveries as needed.
    /// Returns `None` on a clean peer shutdown at a frame boundary.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            if let Some(frame) = self.codec.try_decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                // The peer closed mid-frame.
                return Err(frame::Error::Incomplete.into());
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let mut bytes = BytesMut::new();
        self.codec.encode(frame, &mut bytes)?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn write_command(&mut self, command: &Command) -> Result<(), Error> {
        let mut bytes = BytesMut::new();
        self.codec.encode(command, &mut bytes)?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }
}
