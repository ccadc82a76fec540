//! Common utilities and types for Burrow

pub mod config;
pub mod constants;
pub mod error;
pub mod version;

pub use config::{
    ChannelTimeouts, ControlClientConfig, ControlServerConfig, MuxerConfig, ProxyConfig, PumpConfig,
    RegistryConfig, RetryConfig, SessionConfig,
};
pub use error::{Result, TunnelError};
