//! Core building blocks of the Burrow relay
//!
//! - [`pump`]: typed in/out queues over one control connection
//! - [`control`]: agent-side control client and broker-side control server
//! - [`session`]: multiplexed streams over one tunnel connection
//! - [`proxy`]: agent-side tunnel proxy forwarding streams to a local service
//! - [`reconnect`], [`link`], [`delay`]: retry, byte-copy and heartbeat helpers

pub mod auth;
pub mod control;
pub mod delay;
pub mod link;
pub mod proxy;
pub mod pump;
pub mod reconnect;
pub mod session;
pub mod tracker;
pub mod transport;

pub use control::client::{ClientHandler, ClientState, ControlClient};
pub use control::server::{AgentConn, ControlServer, Validator};
pub use delay::DelayTimer;
pub use link::link_streams;
pub use proxy::{TunnelIdentity, TunnelProxy};
pub use pump::{MessagePump, PumpError};
pub use reconnect::Retrier;
pub use session::{Role, Session, SessionError, VirtualStream};
pub use tracker::{AgentTracker, NoopTracker, TunnelTracker};
