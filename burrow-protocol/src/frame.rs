//! Session frame definitions
//!
//! Once a tunnel connection completes its handshake it carries these frames
//! instead of control messages. Each frame belongs to one logical stream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Data-plane frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    /// Open a new stream. Ids are odd for the client role, even for the server.
    Open { stream_id: u32 },

    /// Stream payload; never empty
    Data { stream_id: u32, data: Bytes },

    /// Sender has finished writing (half-close)
    Fin { stream_id: u32 },

    /// Stream aborted or refused
    Reset { stream_id: u32 },

    /// Receiver consumed `credit` bytes; the sender may send that much more
    WindowUpdate { stream_id: u32, credit: u32 },
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Open { stream_id }
            | Frame::Data { stream_id, .. }
            | Frame::Fin { stream_id }
            | Frame::Reset { stream_id }
            | Frame::WindowUpdate { stream_id, .. } => *stream_id,
        }
    }
}
