//! Protocol error type

use crate::message::MessageKind;
use std::io;
use thiserror::Error;

/// Errors raised while framing or decoding control messages.
///
/// Every variant is fatal for the connection it occurred on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("bad response type: expected {expected}, got {actual}")]
    BadResponseType {
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("length mismatch: header says {declared} bytes, message used {consumed}")]
    LengthMismatch { declared: usize, consumed: usize },
}

impl ProtocolError {
    /// Whether the underlying cause is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }
}

impl From<bincode_next::error::EncodeError> for ProtocolError {
    fn from(err: bincode_next::error::EncodeError) -> Self {
        ProtocolError::Encode(err.to_string())
    }
}

impl From<bincode_next::error::DecodeError> for ProtocolError {
    fn from(err: bincode_next::error::DecodeError) -> Self {
        ProtocolError::UnknownMessageType(err.to_string())
    }
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
