//! Prometheus metrics for tunnel activity
//!
//! Each [`TunnelMetrics`] owns its registry; the broker creates one and hands
//! it to its trackers.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct TunnelMetrics {
    registry: Registry,

    /// Agents with a live control connection
    pub agents_connected: IntGauge,
    /// Tunnels currently registered
    pub tunnels_open: IntGauge,
    /// Forwarded connections currently linked
    pub active_connections: IntGauge,
    pub connections_total: IntCounter,
    /// Bytes from public callers towards agents
    pub traffic_in_bytes: IntCounter,
    /// Bytes from agents back to public callers
    pub traffic_out_bytes: IntCounter,
    pub tunnel_errors_total: IntCounter,
}

impl std::fmt::Debug for TunnelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelMetrics")
            .field("agents_connected", &self.agents_connected.get())
            .field("tunnels_open", &self.tunnels_open.get())
            .field("active_connections", &self.active_connections.get())
            .finish_non_exhaustive()
    }
}

impl TunnelMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("burrow".to_string()), None)?;

        let agents_connected =
            IntGauge::new("agents_connected", "Agents with a live control connection")?;
        let tunnels_open = IntGauge::new("tunnels_open", "Tunnels currently registered")?;
        let active_connections = IntGauge::new(
            "tunnel_active_connections",
            "Forwarded connections currently linked",
        )?;
        let connections_total = IntCounter::new(
            "tunnel_connections_total",
            "Forwarded connections accepted",
        )?;
        let traffic_in_bytes = IntCounter::new(
            "tunnel_traffic_in_bytes_total",
            "Bytes forwarded from public callers to agents",
        )?;
        let traffic_out_bytes = IntCounter::new(
            "tunnel_traffic_out_bytes_total",
            "Bytes forwarded from agents to public callers",
        )?;
        let tunnel_errors_total =
            IntCounter::new("tunnel_errors_total", "Errors reported by tunnels")?;

        registry.register(Box::new(agents_connected.clone()))?;
        registry.register(Box::new(tunnels_open.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(traffic_in_bytes.clone()))?;
        registry.register(Box::new(traffic_out_bytes.clone()))?;
        registry.register(Box::new(tunnel_errors_total.clone()))?;

        Ok(Self {
            registry,
            agents_connected,
            tunnels_open,
            active_connections,
            connections_total,
            traffic_in_bytes,
            traffic_out_bytes,
            tunnel_errors_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric in this collection
    pub fn gather(&self) -> String {
        gather_metrics(&self.registry)
    }
}

/// Render `registry` in the Prometheus text format
pub fn gather_metrics(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
