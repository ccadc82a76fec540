//! Configuration types shared by the broker and the agent
//!
//! Every struct carries the defaults of a production deployment; callers
//! override individual fields.

use crate::constants::{
    CONTROL_CLIENT_QUEUE, CONTROL_CONNECT_TIMEOUT, CONTROL_READ_TIMEOUT, CONTROL_WRITE_TIMEOUT,
    DEFAULT_REGISTRY_BIND, DELAY_WINDOW, HEARTBEAT_INTERVAL, LINK_BUFFER_SIZE,
    LOCAL_CONNECT_TIMEOUT, MUXER_DELIVER_TIMEOUT, MUXER_MAX_HEAD_BYTES, MUXER_QUEUE_CAPACITY,
    MUXER_READ_TIMEOUT, MUXER_WRITE_TIMEOUT, PUMP_ERROR_CAPACITY, PUMP_QUEUE_CAPACITY,
    RETRY_BACKOFF, RETRY_MAX_ATTEMPTS, SESSION_ACCEPT_BACKLOG, SESSION_MAX_STREAMS,
    SESSION_OPEN_RETRY, SESSION_WRITE_QUEUE, TUNNEL_CONNECT_TIMEOUT, TUNNEL_READ_TIMEOUT,
    TUNNEL_WRITE_TIMEOUT,
};
use crate::version::{device, VERSION};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deadlines for one logical channel (control, tunnel or local)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl ChannelTimeouts {
    pub fn control() -> Self {
        Self {
            connect: CONTROL_CONNECT_TIMEOUT,
            read: CONTROL_READ_TIMEOUT,
            write: CONTROL_WRITE_TIMEOUT,
        }
    }

    pub fn tunnel() -> Self {
        Self {
            connect: TUNNEL_CONNECT_TIMEOUT,
            read: TUNNEL_READ_TIMEOUT,
            write: TUNNEL_WRITE_TIMEOUT,
        }
    }

    /// Local export dials only use the connect deadline
    pub fn local() -> Self {
        Self {
            connect: LOCAL_CONNECT_TIMEOUT,
            read: TUNNEL_READ_TIMEOUT,
            write: TUNNEL_WRITE_TIMEOUT,
        }
    }
}

/// Backoff retrier settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay; attempt `n` sleeps `backoff * n` plus up to one `backoff` of jitter
    pub backoff: Duration,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: RETRY_BACKOFF,
            max_attempts: RETRY_MAX_ATTEMPTS,
        }
    }
}

/// Connection pump settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub error_capacity: usize,
    /// Consecutive idle read deadlines tolerated before the pump is torn down.
    /// Each tolerated expiry is reported as a transient error.
    pub idle_reads_allowed: u32,
}

impl PumpConfig {
    pub fn from_timeouts(timeouts: &ChannelTimeouts) -> Self {
        Self {
            read_timeout: timeouts.read,
            write_timeout: timeouts.write,
            ..Self::default()
        }
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            read_timeout: CONTROL_READ_TIMEOUT,
            write_timeout: CONTROL_WRITE_TIMEOUT,
            queue_capacity: PUMP_QUEUE_CAPACITY,
            error_capacity: PUMP_ERROR_CAPACITY,
            idle_reads_allowed: 0,
        }
    }
}

/// Multiplexed session settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Concurrent streams per session, across both directions
    pub max_streams: usize,
    /// Opened streams waiting to be accepted
    pub accept_backlog: usize,
    /// Frames queued for the session writer
    pub write_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_streams: SESSION_MAX_STREAMS,
            accept_backlog: SESSION_ACCEPT_BACKLOG,
            write_queue: SESSION_WRITE_QUEUE,
        }
    }
}

/// HTTP virtual-host muxer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxerConfig {
    /// Domain stripped from the Host header to obtain the subdomain key
    pub domain: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub deliver_timeout: Duration,
    pub queue_capacity: usize,
    pub max_head_bytes: usize,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            read_timeout: MUXER_READ_TIMEOUT,
            write_timeout: MUXER_WRITE_TIMEOUT,
            deliver_timeout: MUXER_DELIVER_TIMEOUT,
            queue_capacity: MUXER_QUEUE_CAPACITY,
            max_head_bytes: MUXER_MAX_HEAD_BYTES,
        }
    }
}

/// Tunnel registry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Bind address of the tunnel-handshake listener
    pub listen_addr: String,
    /// Host advertised to agents; defaults to the bound IP
    pub advertise_host: Option<String>,
    /// Deadlines applied to the tunnel handshake
    pub handshake: ChannelTimeouts,
    /// Stream-open attempts per forwarded connection
    pub session_retry: usize,
    pub link_buffer: usize,
    pub session: SessionConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_REGISTRY_BIND.to_string(),
            advertise_host: None,
            handshake: ChannelTimeouts::tunnel(),
            session_retry: SESSION_OPEN_RETRY,
            link_buffer: LINK_BUFFER_SIZE,
            session: SessionConfig::default(),
        }
    }
}

/// Agent-side control client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlClientConfig {
    pub server_addr: String,
    pub id: String,
    pub client_hash: String,
    pub version: String,
    pub device: String,
    pub timeouts: ChannelTimeouts,
    pub heartbeat_interval: Duration,
    pub retry: RetryConfig,
    pub pump: PumpConfig,
    pub delay_window: usize,
}

impl Default for ControlClientConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            id: String::new(),
            client_hash: String::new(),
            version: VERSION.to_string(),
            device: device(),
            timeouts: ChannelTimeouts::control(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            retry: RetryConfig::default(),
            pump: PumpConfig::from_timeouts(&ChannelTimeouts::control()),
            delay_window: DELAY_WINDOW,
        }
    }
}

/// Broker-side control server settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlServerConfig {
    /// Deadlines applied to the handshake of an accepted connection
    pub timeouts: ChannelTimeouts,
    /// Pump settings for validated agents
    pub pump: PumpConfig,
    /// Validated connections waiting to be claimed
    pub queue_capacity: usize,
}

impl Default for ControlServerConfig {
    fn default() -> Self {
        Self {
            timeouts: ChannelTimeouts::control(),
            pump: PumpConfig::from_timeouts(&ChannelTimeouts::control()),
            queue_capacity: CONTROL_CLIENT_QUEUE,
        }
    }
}

/// Agent-side tunnel proxy settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Deadlines for the registry dial and tunnel handshake
    pub tunnel: ChannelTimeouts,
    /// Deadline for dialing the local export address
    pub local: ChannelTimeouts,
    pub retry: RetryConfig,
    pub session: SessionConfig,
    pub link_buffer: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tunnel: ChannelTimeouts::tunnel(),
            local: ChannelTimeouts::local(),
            retry: RetryConfig::default(),
            session: SessionConfig::default(),
            link_buffer: LINK_BUFFER_SIZE,
        }
    }
}
