//! Length-prefixed framing: `u32` little-endian payload length, then a
//! bincode-encoded [`Message`].
//!
//! Decoding runs behind [`MAX_MESSAGE_BYTES`] so a hostile length prefix
//! cannot trigger huge allocations; the bincode options carry the same cap
//! for nested containers.

use bincode::Options;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Message, ProtocolError};

pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

fn options() -> impl Options {
    bincode::options()
        .with_limit(MAX_MESSAGE_BYTES as u64)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

pub fn encode_message(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = options()
        .serialize(message)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(payload)
}

pub fn decode_message(payload: &[u8]) -> Result<Message, ProtocolError> {
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    options()
        .deserialize(payload)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode_message(message)?;
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Err(Disconnected)` on clean EOF at a frame boundary.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Disconnected)
        }
        Err(err) => return Err(err.into()),
    };
    if len > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_MESSAGE_BYTES,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_message(&payload)
}

/// Blocking counterpart of [`write_message`], used by the indexer binary.
pub fn write_message_sync<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: std::io::Write,
{
    use byteorder::{LittleEndian, WriteBytesExt};

    let payload = encode_message(message)?;
    writer.write_u32::<LittleEndian>(payload.len() as u32)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Blocking counterpart of [`read_message`].
pub fn read_message_sync<R>(reader: &mut R) -> Result<Message, ProtocolError>
where
    R: std::io::Read,
{
    use byteorder::{LittleEndian, ReadBytesExt};

    let len = match reader.read_u32::<LittleEndian>() {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Disconnected)
        }
        Err(err) => return Err(err.into()),
    };
    if len > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_MESSAGE_BYTES,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    decode_message(&payload)
}
