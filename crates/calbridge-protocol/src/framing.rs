//! Length-prefixed framing.
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  JSON payload    |
//! +----------------+------------------+
//! ```
//!
//! [`encode_message`] and [`decode_message`] work on whole buffers.
//! [`FrameReader`] and [`FrameWriter`] drive the same format over any tokio
//! byte stream, which is how both ends of a bridge talk.

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

/// Serializes `message` and prepends its length.
pub fn encode_message<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(message)?;
    let len = checked_len(json.len())?;

    let mut buffer = Vec::with_capacity(4 + json.len());
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(&json);
    Ok(buffer)
}

/// Decodes one complete frame from the front of `data`.
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> ProtocolResult<T> {
    let Some((prefix, rest)) = data.split_first_chunk::<4>() else {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4,
            received: data.len(),
        });
    };

    let len = payload_len(*prefix)?;
    if rest.len() < len {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4 + len,
            received: data.len(),
        });
    }

    Ok(serde_json::from_slice(&rest[..len])?)
}

fn checked_len(len: usize) -> ProtocolResult<u32> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_MESSAGE_SIZE => Ok(len),
        _ => Err(ProtocolError::MessageTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: MAX_MESSAGE_SIZE,
        }),
    }
}

fn payload_len(prefix: [u8; 4]) -> ProtocolResult<usize> {
    let len = u32::from_be_bytes(prefix);
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }
    Ok(len as usize)
}

/// Reads frames off an async byte stream.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream between frames.
    /// A stream that ends inside a frame is an
    /// [`IncompleteMessage`](ProtocolError::IncompleteMessage).
    ///
    /// A payload that is valid length-wise but fails to deserialize returns
    /// [`ProtocolError::Serialization`]; the stream stays aligned and the
    /// caller may keep reading.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> ProtocolResult<Option<T>> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = self.reader.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::IncompleteMessage {
                    expected: 4,
                    received: filled,
                });
            }
            filled += n;
        }

        let len = payload_len(prefix)?;
        let mut payload = vec![0u8; len];
        let mut received = 0;
        while received < len {
            let n = self.reader.read(&mut payload[received..]).await?;
            if n == 0 {
                return Err(ProtocolError::IncompleteMessage {
                    expected: 4 + len,
                    received: 4 + received,
                });
            }
            received += n;
        }

        Ok(Some(serde_json::from_slice(&payload)?))
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes frames onto an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encodes, writes and flushes one frame.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> ProtocolResult<()> {
        let bytes = encode_message(message)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
