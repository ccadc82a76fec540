//! Default timeouts, capacities and addresses.
//!
//! Use these constants instead of magic numbers so defaults stay consistent
//! between the broker, the agent and tests.

use std::time::Duration;

/// Control channel dial timeout
pub const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Control channel read deadline. Must exceed the heartbeat interval.
pub const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Agent heartbeat interval
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

pub const TUNNEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const TUNNEL_READ_TIMEOUT: Duration = Duration::from_secs(2);
pub const TUNNEL_WRITE_TIMEOUT: Duration = Duration::from_millis(300);

/// Dial timeout towards an agent's local export address
pub const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);
pub const RETRY_MAX_ATTEMPTS: u32 = 10;

pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

pub const MUXER_READ_TIMEOUT: Duration = Duration::from_secs(2);
pub const MUXER_WRITE_TIMEOUT: Duration = Duration::from_millis(300);

/// How long the muxer waits for a tunnel to take a routed connection
pub const MUXER_DELIVER_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-subdomain accept queue capacity
pub const MUXER_QUEUE_CAPACITY: usize = 16;

/// Largest HTTP request head the muxer buffers before giving up
pub const MUXER_MAX_HEAD_BYTES: usize = 16 * 1024;

/// Validated control connections waiting to be claimed
pub const CONTROL_CLIENT_QUEUE: usize = 128;

/// Pump inbound/outbound queue capacity
pub const PUMP_QUEUE_CAPACITY: usize = 16;

/// Pump error slot capacity
pub const PUMP_ERROR_CAPACITY: usize = 2;

/// Stream linker copy buffer
pub const LINK_BUFFER_SIZE: usize = 2048;

/// Stream-open attempts per forwarded connection
pub const SESSION_OPEN_RETRY: usize = 2;

pub const SESSION_MAX_STREAMS: usize = 256;
pub const SESSION_WRITE_QUEUE: usize = 64;
pub const SESSION_ACCEPT_BACKLOG: usize = 256;

/// Window of the heartbeat delay timer
pub const DELAY_WINDOW: usize = 10;

/// Default bind address for the tunnel-handshake listener (ephemeral port)
pub const DEFAULT_REGISTRY_BIND: &str = "0.0.0.0:0";

/// Default bind address for the control plane
pub const DEFAULT_CONTROL_BIND: &str = "0.0.0.0:7800";
