//! Control-plane message definitions

use crate::status::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Agent login, sent once per control connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub id: String,
    pub client_hash: String,
    pub version: String,
    pub device: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub status: StatusCode,
}

/// Sent by the agent on a fresh connection to the tunnel registry, before the
/// connection is upgraded to a multiplexed session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelHandshakeRequest {
    pub id: String,
    pub client_hash: String,
    pub tunnel_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelHandshakeResponse {
    pub status: StatusCode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse;

/// Broker asks the agent to expose `export_addr` through the registry at
/// `registry_addr`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTunnelRequest {
    pub id: String,
    pub client_hash: String,
    pub tunnel_hash: String,
    pub proto: String,
    pub export_addr: String,
    pub registry_addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTunnelResponse {
    pub status: StatusCode,
    pub tunnel_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseTunnelRequest {
    pub id: String,
    pub client_hash: String,
    pub tunnel_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseTunnelResponse {
    pub status: StatusCode,
    pub tunnel_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub id: String,
    pub client_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub status: StatusCode,
}

/// Wire protocol message
///
/// Variant order is the serialized tag and must not be reordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    TunnelHandshakeRequest(TunnelHandshakeRequest),
    TunnelHandshakeResponse(TunnelHandshakeResponse),
    PingRequest(PingRequest),
    PingResponse(PingResponse),
    NewTunnelRequest(NewTunnelRequest),
    NewTunnelResponse(NewTunnelResponse),
    CloseTunnelRequest(CloseTunnelRequest),
    CloseTunnelResponse(CloseTunnelResponse),
    ShutdownRequest(ShutdownRequest),
    ShutdownResponse(ShutdownResponse),
}

/// Payload-free discriminant of [`Message`], used in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    HandshakeRequest,
    HandshakeResponse,
    TunnelHandshakeRequest,
    TunnelHandshakeResponse,
    PingRequest,
    PingResponse,
    NewTunnelRequest,
    NewTunnelResponse,
    CloseTunnelRequest,
    CloseTunnelResponse,
    ShutdownRequest,
    ShutdownResponse,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A message body that can be the target of a typed read.
pub trait MessageBody: Sized + Into<Message> {
    const KIND: MessageKind;

    /// Extract the body, handing the message back on mismatch
    fn from_message(message: Message) -> Result<Self, Message>;
}

macro_rules! message_bodies {
    ($($body:ident),* $(,)?) => {
        impl Message {
            pub fn kind(&self) -> MessageKind {
                match self {
                    $(Message::$body(_) => MessageKind::$body,)*
                }
            }
        }

        $(
            impl From<$body> for Message {
                fn from(body: $body) -> Self {
                    Message::$body(body)
                }
            }

            impl MessageBody for $body {
                const KIND: MessageKind = MessageKind::$body;

                fn from_message(message: Message) -> Result<Self, Message> {
                    match message {
                        Message::$body(body) => Ok(body),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

message_bodies!(
    HandshakeRequest,
    HandshakeResponse,
    TunnelHandshakeRequest,
    TunnelHandshakeResponse,
    PingRequest,
    PingResponse,
    NewTunnelRequest,
    NewTunnelResponse,
    CloseTunnelRequest,
    CloseTunnelResponse,
    ShutdownRequest,
    ShutdownResponse,
);
