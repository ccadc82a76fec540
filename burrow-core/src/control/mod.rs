//! Control plane between agent and broker
//!
//! The agent runs a [`client::ControlClient`] that dials the broker,
//! handshakes, heartbeats and dispatches tunnel requests. The broker runs a
//! [`server::ControlServer`] that validates handshakes and hands accepted
//! agents to its owner.

pub mod client;
pub mod server;
