//! Trackers that persist agent and tunnel status
//!
//! Status strings match what the admin side displays: `Connected`,
//! `Disconnected`, `Opened`, `Closed`, `IDLE`, `Working` and `Err(<msg>)`.

use crate::storage::{AgentUpdate, Storage, TunnelUpdate};
use burrow_core::tracker::{AgentTracker, TunnelTracker};
use burrow_observability::TunnelMetrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::error;

pub const STATUS_CONNECTED: &str = "Connected";
pub const STATUS_DISCONNECTED: &str = "Disconnected";
pub const STATUS_OPENED: &str = "Opened";
pub const STATUS_CLOSED: &str = "Closed";
pub const STATUS_IDLE: &str = "IDLE";
pub const STATUS_WORKING: &str = "Working";

/// Traffic counters restart after this long
const TRAFFIC_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn error_status(message: &str) -> String {
    format!("Err({message})")
}

/// Agent-scope tracker backed by storage
pub struct StorageAgentTracker<S: Storage> {
    storage: Arc<S>,
    metrics: Arc<TunnelMetrics>,
    id: String,
    hash: String,
}

impl<S: Storage> StorageAgentTracker<S> {
    pub fn new(
        storage: Arc<S>,
        metrics: Arc<TunnelMetrics>,
        id: impl Into<String>,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            metrics,
            id: id.into(),
            hash: hash.into(),
        }
    }

    /// Tracker for one of this agent's tunnels
    pub fn tunnel_tracker(&self, tunnel: &str) -> StorageTunnelTracker<S> {
        StorageTunnelTracker {
            storage: Arc::clone(&self.storage),
            metrics: Arc::clone(&self.metrics),
            id: self.id.clone(),
            hash: self.hash.clone(),
            tunnel: tunnel.to_string(),
            conns: AtomicUsize::new(0),
        }
    }

    fn update(&self, update: AgentUpdate) {
        if let Err(e) = self.storage.update_agent(&self.id, &self.hash, update) {
            error!(agent = %self.hash, "Update agent failed: {}", e);
        }
    }

    fn set_status(&self, status: &str) {
        self.update(AgentUpdate {
            status: Some(status.to_string()),
            ..AgentUpdate::default()
        });
    }
}

impl<S: Storage> AgentTracker for StorageAgentTracker<S> {
    fn connected(&self) {
        self.metrics.agents_connected.inc();
        self.set_status(STATUS_CONNECTED);
    }

    fn disconnected(&self) {
        self.metrics.agents_connected.dec();
        self.set_status(STATUS_DISCONNECTED);
    }

    fn delayed(&self, delay: Duration) {
        self.update(AgentUpdate {
            delayed: Some(delay),
            ..AgentUpdate::default()
        });
    }
}

/// Tunnel-scope tracker backed by storage
pub struct StorageTunnelTracker<S: Storage> {
    storage: Arc<S>,
    metrics: Arc<TunnelMetrics>,
    id: String,
    hash: String,
    tunnel: String,
    conns: AtomicUsize,
}

impl<S: Storage> StorageTunnelTracker<S> {
    fn update(&self, update: TunnelUpdate) {
        if let Err(e) = self
            .storage
            .update_tunnel(&self.id, &self.hash, &self.tunnel, update)
        {
            error!(agent = %self.hash, tunnel = %self.tunnel, "Update tunnel failed: {}", e);
        }
    }

    fn set_status(&self, status: String) {
        self.update(TunnelUpdate {
            status: Some(status),
            ..TunnelUpdate::default()
        });
    }

    fn set_num_conn(&self, num_conn: usize) {
        self.update(TunnelUpdate {
            num_conn: Some(num_conn),
            ..TunnelUpdate::default()
        });
    }
}

impl<S: Storage> TunnelTracker for StorageTunnelTracker<S> {
    fn opened(&self) {
        self.metrics.tunnels_open.inc();
        self.set_status(STATUS_OPENED.to_string());
    }

    fn closed(&self) {
        self.metrics.tunnels_open.dec();
        self.conns.store(0, Ordering::Release);
        self.set_status(STATUS_CLOSED.to_string());
    }

    fn is_idle(&self) {
        self.set_status(STATUS_IDLE.to_string());
    }

    fn is_working(&self) {
        self.set_status(STATUS_WORKING.to_string());
    }

    fn on_error(&self, message: &str) {
        self.metrics.tunnel_errors_total.inc();
        self.set_status(error_status(message));
    }

    fn incr_conn(&self) {
        self.metrics.active_connections.inc();
        self.metrics.connections_total.inc();
        let num_conn = self.conns.fetch_add(1, Ordering::AcqRel) + 1;
        self.set_num_conn(num_conn);
    }

    fn decr_conn(&self) {
        self.metrics.active_connections.dec();
        let previous = self
            .conns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        self.set_num_conn(previous.saturating_sub(1));
    }

    fn record_traffic(&self, bytes_in: u64, bytes_out: u64) {
        self.metrics.traffic_in_bytes.inc_by(bytes_in);
        self.metrics.traffic_out_bytes.inc_by(bytes_out);

        let record = match self.storage.tunnel(&self.id, &self.hash, &self.tunnel) {
            Ok(record) => record,
            Err(e) => {
                error!(agent = %self.hash, tunnel = %self.tunnel, "Query tunnel failed: {}", e);
                return;
            }
        };

        let now = SystemTime::now();
        let window_expired = record.count_at.is_none_or(|start| {
            now.duration_since(start)
                .is_ok_and(|elapsed| elapsed >= TRAFFIC_WINDOW)
        });
        let (traffic_in, traffic_out, count_at) = if window_expired {
            (bytes_in, bytes_out, now)
        } else {
            (
                record.traffic_in.saturating_add(bytes_in),
                record.traffic_out.saturating_add(bytes_out),
                record.count_at.unwrap_or(now),
            )
        };

        self.update(TunnelUpdate {
            traffic_in: Some(traffic_in),
            traffic_out: Some(traffic_out),
            count_at: Some(count_at),
            ..TunnelUpdate::default()
        });
    }
}
