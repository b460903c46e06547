//! Length-prefixed framing.
//!
//! Each frame is a 4-byte big-endian length header followed by exactly that
//! many payload bytes.

use crate::error::WireError;
use crate::message::Message;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single frame payload (1 MB).
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Encode a message as a complete frame (length header + payload).
pub fn encode_frame(msg: &Message) -> Result<Bytes, WireError> {
    let payload = msg.encode()?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(WireError::MessageTooLarge {
            size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            max: MAX_FRAME_SIZE,
        })?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(len);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Write one framed message and flush.
///
/// The frame is written with a single `write_all`, so callers that serialize
/// access to the writer never interleave frames.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_frame(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message.
///
/// A clean end of stream before a header is [`WireError::ConnectionClosed`];
/// an end of stream inside a frame is an I/O error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    Message::decode(&body)
}
