//! Error types for Burrow

use burrow_protocol::{ProtocolError, StatusCode};
use thiserror::Error;

/// Main error type for Burrow operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing or decoding failure on a control connection
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The remote answered a handshake or request with a non-OK status
    #[error("Rejected: {0}")]
    Rejected(#[from] StatusCode),

    /// Multiplexed session failure
    #[error("Session error: {0}")]
    Session(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Persistence collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// The operation stopped because its owner is shutting down.
    ///
    /// Retry loops return this unchanged so callers can tell a shutdown apart
    /// from exhausted retries.
    #[error("operation canceled")]
    Canceled,
}

impl TunnelError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, TunnelError::Canceled)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::Session("stream reset".to_string());
        assert!(err.to_string().contains("stream reset"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::other("test");
        let tunnel_err: TunnelError = io_err.into();
        assert!(matches!(tunnel_err, TunnelError::Io(_)));

        let rejected: TunnelError = StatusCode::BadVersion.into();
        assert!(rejected.to_string().contains("bad version"));
    }

    #[test]
    fn test_canceled_sentinel() {
        assert!(TunnelError::Canceled.is_canceled());
        assert!(!TunnelError::Timeout("dial".into()).is_canceled());
    }
}
