//! Codecs for control messages and session frames
//!
//! Control message format:
//! ```text
//! ┌──────────────┬──────────────┐
//! │ Length (u16) │ Message Body │
//! │ 2 bytes      │ N ≤ 65535    │
//! └──────────────┴──────────────┘
//! ```
//!
//! Session frame format:
//! ```text
//! ┌─────────────┬──────────────┐
//! │ Length (u32)│ Frame Data   │
//! │ 4 bytes     │ N bytes      │
//! └─────────────┴──────────────┘
//! ```
//!
//! Both bodies are bincode-encoded with the standard configuration.

use crate::constants::{FRAME_HEADER_LEN, MAX_FRAME_SIZE, MAX_MESSAGE_SIZE, MESSAGE_HEADER_LEN};
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{Message, MessageBody};
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Serialize a message body, enforcing the u16 size limit
pub fn encode_body(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode_next::serde::encode_to_vec(message, bincode_next::config::standard())?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(body)
}

/// Deserialize a message body that must be consumed exactly
pub fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let (message, consumed) =
        bincode_next::serde::decode_from_slice(body, bincode_next::config::standard())?;
    if consumed != body.len() {
        return Err(ProtocolError::LengthMismatch {
            declared: body.len(),
            consumed,
        });
    }
    Ok(message)
}

/// Write one message, retrying partial writes until fully flushed.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = encode_body(message)?;
    let mut frame = Vec::with_capacity(MESSAGE_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one message.
///
/// Never reads past the end of the message, so the connection can be handed
/// to another protocol afterwards.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; MESSAGE_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = u16::from_be_bytes(header) as usize;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_body(&body)
}

/// Read one message and require it to be of type `T`.
pub async fn read_to<T, R>(reader: &mut R) -> Result<T, ProtocolError>
where
    T: MessageBody,
    R: AsyncRead + Unpin + ?Sized,
{
    let message = read_message(reader).await?;
    T::from_message(message).map_err(|other| ProtocolError::BadResponseType {
        expected: T::KIND,
        actual: other.kind(),
    })
}

/// Control message codec for use with `Framed` transports
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MESSAGE_HEADER_LEN {
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < MESSAGE_HEADER_LEN + len {
            src.reserve(MESSAGE_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(MESSAGE_HEADER_LEN);
        let body = src.split_to(len);
        decode_body(&body).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode_body(&message)?;
        dst.reserve(MESSAGE_HEADER_LEN + body.len());
        dst.put_u16(body.len() as u16);
        dst.put_slice(&body);
        Ok(())
    }
}

/// Session frame codec
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE as usize,
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn too_large(&self, len: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame too large: {len} bytes (max: {})", self.max_frame_size),
        )
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; FRAME_HEADER_LEN];
        length_bytes.copy_from_slice(&src[..FRAME_HEADER_LEN]);
        let frame_length = u32::from_be_bytes(length_bytes) as usize;

        if frame_length > self.max_frame_size {
            return Err(self.too_large(frame_length));
        }

        if src.len() < FRAME_HEADER_LEN + frame_length {
            src.reserve(FRAME_HEADER_LEN + frame_length - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let frame_bytes = src.split_to(frame_length);

        let (frame, _) =
            bincode_next::serde::decode_from_slice(&frame_bytes, bincode_next::config::standard())
                .map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("Decode error: {e}"))
                })?;

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = bincode_next::serde::encode_to_vec(&frame, bincode_next::config::standard())
            .map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("Encode error: {e}"))
            })?;

        let frame_length = u32::try_from(body.len())
            .ok()
            .filter(|len| *len as usize <= self.max_frame_size)
            .ok_or_else(|| self.too_large(body.len()))?;

        dst.reserve(FRAME_HEADER_LEN + body.len());
        dst.put_u32(frame_length);
        dst.put_slice(&body);
        Ok(())
    }
}
