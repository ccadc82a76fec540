//! Lifecycle hooks for agents and tunnels
//!
//! The core reports lifecycle points through these traits; the broker plugs
//! in implementations that persist status and traffic. Every hook has a
//! no-op default.

use std::time::Duration;

/// Agent-scope hooks
pub trait AgentTracker: Send + Sync {
    fn connected(&self) {}

    fn disconnected(&self) {}

    /// Heartbeat arrived `delay` later than the recent average
    fn delayed(&self, _delay: Duration) {}
}

/// Tunnel-scope hooks
pub trait TunnelTracker: Send + Sync {
    fn opened(&self) {}

    fn closed(&self) {}

    /// Last live connection ended
    fn is_idle(&self) {}

    /// First live connection started
    fn is_working(&self) {}

    fn on_error(&self, _message: &str) {}

    fn incr_conn(&self) {}

    fn decr_conn(&self) {}

    fn record_traffic(&self, _bytes_in: u64, _bytes_out: u64) {}
}

/// Tracker that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracker;

impl AgentTracker for NoopTracker {}

impl TunnelTracker for NoopTracker {}
