//! Broker-side tunnel exposure for Burrow
//!
//! - [`registry`]: owns every tunnel and the listener agents dial back on
//! - [`tunnel`]: one public listener forwarding over the agent's session
//! - [`muxer`]: shared HTTP listener routing by Host header

pub mod listener;
pub mod muxer;
pub mod registry;
pub mod replay;
pub mod tunnel;

pub use listener::TunnelListener;
pub use muxer::{HttpMuxer, MuxerError, VhostListener};
pub use registry::{Registry, RegistryError};
pub use replay::ReplayStream;
pub use tunnel::{StreamError, Tunnel, TunnelSettings};
