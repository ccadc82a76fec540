//! Burrow wire protocol
//!
//! Two framings live here. The control plane (agent ↔ broker) carries
//! [`Message`] values behind a 2-byte length prefix. The data plane carries
//! session [`Frame`]s behind a 4-byte length prefix once a tunnel connection
//! has been upgraded to a multiplexed session.

pub mod codec;
pub mod constants;
pub mod error;
pub mod frame;
pub mod message;
pub mod status;

pub use codec::{read_message, read_to, write_message, FrameCodec, MessageCodec};
pub use error::ProtocolError;
pub use frame::Frame;
pub use message::{
    CloseTunnelRequest, CloseTunnelResponse, HandshakeRequest, HandshakeResponse, Message,
    MessageKind, NewTunnelRequest, NewTunnelResponse, PingRequest, PingResponse,
    ShutdownRequest, ShutdownResponse, TunnelHandshakeRequest, TunnelHandshakeResponse,
};
pub use status::StatusCode;
