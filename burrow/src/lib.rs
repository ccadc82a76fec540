//! # Burrow
//!
//! A reverse-tunnel relay: agents behind NAT keep a control connection to a
//! public broker, and the broker exposes their local services as public TCP
//! ports or as HTTP subdomains.
//!
//! ## Architecture
//!
//! - [`burrow-protocol`] - control messages, status codes, wire codec
//! - [`burrow-common`] - configuration, constants and errors
//! - [`burrow-core`] - message pump, multiplexed sessions, control client and server, tunnel proxy
//! - [`burrow-http`] - tunnel registry, public listeners and the HTTP virtual-host muxer
//! - [`burrow-observability`] - logging setup and Prometheus metrics
//!
//! This crate ties them together into an embeddable [`Broker`] and [`Agent`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use burrow::{Broker, BrokerConfig, MemoryStorage, PubSub, TunnelRecord};
//! use std::sync::Arc;
//!
//! # async fn example() -> burrow::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! storage.add_agent("agent-1", "secret-hash");
//! storage.add_tunnel(
//!     "agent-1",
//!     "secret-hash",
//!     TunnelRecord {
//!         hash: "web".into(),
//!         proto: "http".into(),
//!         export_addr: "127.0.0.1:3000".into(),
//!         server_addr: "web".into(),
//!         enabled: true,
//!         ..TunnelRecord::default()
//!     },
//! );
//!
//! let config = BrokerConfig::builder()
//!     .http("0.0.0.0:8080", "tunnel.example")
//!     .build()?;
//! let broker = Broker::bind(config, storage, PubSub::new()).await?;
//! broker.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod broker;
pub mod config;
pub mod pubsub;
pub mod storage;
pub mod tracker;

pub use burrow_common as common;
pub use burrow_protocol as protocol;

pub use agent::{Agent, AgentBuilder, Controller};
pub use broker::{Broker, BrokerValidator};
pub use config::{AgentConfig, BrokerBuilder, BrokerConfig};
pub use pubsub::{Event, PubSub};
pub use storage::{
    AgentRecord, AgentUpdate, MemoryStorage, Storage, StorageError, TunnelRecord, TunnelUpdate,
};
pub use tracker::{StorageAgentTracker, StorageTunnelTracker};

pub use common::{Result, TunnelError};
pub use protocol::StatusCode;
