//! Handshake and lifecycle status codes

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result code carried by every control-plane response.
///
/// Discriminants are part of the wire format and must stay stable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[repr(u8)]
pub enum StatusCode {
    #[default]
    #[error("no error")]
    Ok = 0,
    #[error("bad client, try download a new client from control panel")]
    BadClient = 1,
    #[error("bad version, try download a new client from control panel")]
    BadVersion = 2,
    #[error("bad protocol or address")]
    BadProtoOrAddr = 3,
    #[error("bad registry address")]
    BadRegistryAddr = 4,
    #[error("no such tunnel")]
    NoSuchTunnel = 5,
    #[error("duplicate agent")]
    DuplicateAgent = 6,
    #[error("internal server error")]
    InternalServerError = 7,
}

impl StatusCode {
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// Map the code to a result: `Ok` is success, anything else is the error.
    pub fn check(self) -> Result<(), StatusCode> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
