//! Persistence collaborator
//!
//! The broker reads which tunnels an agent should run and writes back status,
//! delay and traffic. [`MemoryStorage`] keeps everything in process.

use burrow_core::auth::verify_credential;
use dashmap::DashMap;
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("tunnel {agent}/{tunnel} not found")]
    TunnelNotFound { agent: String, tunnel: String },

    #[error("storage backend: {0}")]
    Backend(String),
}

impl From<StorageError> for burrow_common::TunnelError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentRecord {
    pub id: String,
    pub hash: String,
    pub device: String,
    pub version: String,
    pub status: String,
    pub delayed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelRecord {
    pub hash: String,
    /// `tcp` or `http`
    pub proto: String,
    /// Address the agent forwards to
    pub export_addr: String,
    /// Public bind address, or the subdomain of an HTTP tunnel
    pub server_addr: String,
    pub enabled: bool,
    pub status: String,
    pub num_conn: usize,
    pub traffic_in: u64,
    pub traffic_out: u64,
    /// Start of the current traffic accounting window
    pub count_at: Option<SystemTime>,
}

/// Agent fields to overwrite; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentUpdate {
    pub device: Option<String>,
    pub version: Option<String>,
    pub status: Option<String>,
    pub delayed: Option<Duration>,
}

/// Tunnel fields to overwrite; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelUpdate {
    pub status: Option<String>,
    pub num_conn: Option<usize>,
    pub traffic_in: Option<u64>,
    pub traffic_out: Option<u64>,
    pub count_at: Option<SystemTime>,
}

/// Agent and tunnel records, addressed by agent id and credential hash
pub trait Storage: Send + Sync + 'static {
    /// Enabled tunnels of the agent, to be opened when it connects
    fn enabled_tunnels(&self, id: &str, hash: &str) -> Result<Vec<TunnelRecord>, StorageError>;

    fn tunnel(&self, id: &str, hash: &str, tunnel: &str) -> Result<TunnelRecord, StorageError>;

    /// Returns false if the agent does not exist
    fn update_agent(&self, id: &str, hash: &str, update: AgentUpdate)
        -> Result<bool, StorageError>;

    /// Returns false if the tunnel does not exist
    fn update_tunnel(
        &self,
        id: &str,
        hash: &str,
        tunnel: &str,
        update: TunnelUpdate,
    ) -> Result<bool, StorageError>;
}

/// In-process storage. Agents are keyed by id; every lookup checks the
/// presented credential hash against the stored one.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    agents: DashMap<String, AgentRecord>,
    tunnels: DashMap<(String, String), TunnelRecord>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an agent and its credential
    pub fn add_agent(&self, id: &str, hash: &str) {
        self.agents.insert(
            id.to_string(),
            AgentRecord {
                id: id.to_string(),
                hash: hash.to_string(),
                ..AgentRecord::default()
            },
        );
    }

    /// Adds or replaces a tunnel of an existing agent.
    ///
    /// Returns false if the agent is unknown or the credential does not match.
    pub fn add_tunnel(&self, id: &str, hash: &str, tunnel: TunnelRecord) -> bool {
        if !self.authorized(id, hash) {
            return false;
        }
        self.tunnels
            .insert((id.to_string(), tunnel.hash.clone()), tunnel);
        true
    }

    pub fn agent(&self, id: &str, hash: &str) -> Option<AgentRecord> {
        self.agents
            .get(id)
            .filter(|entry| verify_credential(hash, &entry.hash))
            .map(|entry| entry.value().clone())
    }

    pub fn set_enabled(&self, id: &str, hash: &str, tunnel: &str, enabled: bool) -> bool {
        if !self.authorized(id, hash) {
            return false;
        }
        match self.tunnels.get_mut(&(id.to_string(), tunnel.to_string())) {
            Some(mut entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    fn authorized(&self, id: &str, hash: &str) -> bool {
        self.agents
            .get(id)
            .is_some_and(|entry| verify_credential(hash, &entry.hash))
    }
}

impl Storage for MemoryStorage {
    fn enabled_tunnels(&self, id: &str, hash: &str) -> Result<Vec<TunnelRecord>, StorageError> {
        if !self.authorized(id, hash) {
            return Ok(Vec::new());
        }
        let mut tunnels: Vec<TunnelRecord> = self
            .tunnels
            .iter()
            .filter(|entry| entry.key().0 == id && entry.value().enabled)
            .map(|entry| entry.value().clone())
            .collect();
        tunnels.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(tunnels)
    }

    fn tunnel(&self, id: &str, hash: &str, tunnel: &str) -> Result<TunnelRecord, StorageError> {
        self.authorized(id, hash)
            .then(|| self.tunnels.get(&(id.to_string(), tunnel.to_string())))
            .flatten()
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::TunnelNotFound {
                agent: id.to_string(),
                tunnel: tunnel.to_string(),
            })
    }

    fn update_agent(
        &self,
        id: &str,
        hash: &str,
        update: AgentUpdate,
    ) -> Result<bool, StorageError> {
        let Some(mut agent) = self.agents.get_mut(id) else {
            return Ok(false);
        };
        if !verify_credential(hash, &agent.hash) {
            return Ok(false);
        }
        if let Some(device) = update.device {
            agent.device = device;
        }
        if let Some(version) = update.version {
            agent.version = version;
        }
        if let Some(status) = update.status {
            agent.status = status;
        }
        if let Some(delayed) = update.delayed {
            agent.delayed = delayed;
        }
        Ok(true)
    }

    fn update_tunnel(
        &self,
        id: &str,
        hash: &str,
        tunnel: &str,
        update: TunnelUpdate,
    ) -> Result<bool, StorageError> {
        if !self.authorized(id, hash) {
            return Ok(false);
        }
        let Some(mut record) = self
            .tunnels
            .get_mut(&(id.to_string(), tunnel.to_string()))
        else {
            return Ok(false);
        };
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(num_conn) = update.num_conn {
            record.num_conn = num_conn;
        }
        if let Some(traffic_in) = update.traffic_in {
            record.traffic_in = traffic_in;
        }
        if let Some(traffic_out) = update.traffic_out {
            record.traffic_out = traffic_out;
        }
        if let Some(count_at) = update.count_at {
            record.count_at = Some(count_at);
        }
        Ok(true)
    }
}
