//! Configuration types for the embeddable broker and agent.

use burrow_common::config::{
    ControlClientConfig, ControlServerConfig, MuxerConfig, ProxyConfig, RegistryConfig,
};
use burrow_common::constants::{DEFAULT_CONTROL_BIND, DELAY_WINDOW, GRACEFUL_SHUTDOWN_TIMEOUT};
use burrow_common::{Result, TunnelError};
use burrow_core::auth::validate_identity;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the broker.
///
/// Use [`BrokerBuilder`] for ergonomic construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address agents dial for the control connection
    pub control_addr: String,

    pub control: ControlServerConfig,

    pub registry: RegistryConfig,

    /// Shared HTTP listener. Without it every HTTP tunnel binds its own port.
    pub http_addr: Option<String>,

    pub muxer: MuxerConfig,

    /// Window of the per-agent heartbeat delay timer
    pub delay_window: usize,

    /// Upper bound on waiting for tunnels to drain at shutdown
    pub graceful_shutdown: Duration,
}

impl BrokerConfig {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.control_addr.is_empty() {
            return Err(TunnelError::Config("control_addr is required".into()));
        }
        if self.registry.listen_addr.is_empty() {
            return Err(TunnelError::Config("registry listen_addr is required".into()));
        }
        if self.http_addr.is_some() && self.muxer.domain.is_empty() {
            return Err(TunnelError::Config(
                "domain is required when http_addr is set".into(),
            ));
        }
        if self.delay_window == 0 {
            return Err(TunnelError::Config("delay_window must be positive".into()));
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            control_addr: DEFAULT_CONTROL_BIND.to_string(),
            control: ControlServerConfig::default(),
            registry: RegistryConfig::default(),
            http_addr: None,
            muxer: MuxerConfig::default(),
            delay_window: DELAY_WINDOW,
            graceful_shutdown: GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Builder for [`BrokerConfig`]
#[derive(Debug, Default)]
pub struct BrokerBuilder {
    config: BrokerConfig,
}

impl BrokerBuilder {
    /// Control-plane bind address.
    ///
    /// Default: `0.0.0.0:7800`
    #[must_use]
    pub fn control_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.control_addr = addr.into();
        self
    }

    /// Tunnel-handshake bind address.
    ///
    /// Default: `0.0.0.0:0`
    #[must_use]
    pub fn registry_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.registry.listen_addr = addr.into();
        self
    }

    /// Host advertised to agents for the tunnel handshake
    #[must_use]
    pub fn advertise_host(mut self, host: impl Into<String>) -> Self {
        self.config.registry.advertise_host = Some(host.into());
        self
    }

    /// Route HTTP tunnels through one listener by `<subdomain>.<domain>`
    #[must_use]
    pub fn http(mut self, addr: impl Into<String>, domain: impl Into<String>) -> Self {
        self.config.http_addr = Some(addr.into());
        self.config.muxer.domain = domain.into();
        self
    }

    /// Stream-open attempts per forwarded connection.
    ///
    /// Default: 2
    #[must_use]
    pub fn session_retry(mut self, retry: usize) -> Self {
        self.config.registry.session_retry = retry;
        self
    }

    #[must_use]
    pub fn graceful_shutdown(mut self, timeout: Duration) -> Self {
        self.config.graceful_shutdown = timeout;
        self
    }

    pub fn build(self) -> Result<BrokerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration for the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub control: ControlClientConfig,
    pub proxy: ProxyConfig,
    /// Upper bound on waiting for forwarded streams at shutdown
    pub graceful_shutdown: Duration,
}

impl AgentConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.control.server_addr.is_empty() {
            return Err(TunnelError::Config("server_addr is required".into()));
        }
        validate_identity(&self.control.id)
            .map_err(|e| TunnelError::Config(format!("id: {e}")))?;
        validate_identity(&self.control.client_hash)
            .map_err(|e| TunnelError::Config(format!("client_hash: {e}")))?;
        if self.control.heartbeat_interval >= self.control.timeouts.read {
            return Err(TunnelError::Config(
                "heartbeat interval must be shorter than the read timeout".into(),
            ));
        }
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control: ControlClientConfig::default(),
            proxy: ProxyConfig::default(),
            graceful_shutdown: GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_defaults_are_valid() {
        let config = BrokerConfig::builder().build().unwrap();
        assert_eq!(config.control_addr, "0.0.0.0:7800");
        assert_eq!(config.graceful_shutdown, Duration::from_secs(3));
        assert_eq!(config.registry.session_retry, 2);
    }

    #[test]
    fn test_broker_http_needs_domain() {
        let err = BrokerConfig::builder()
            .http("127.0.0.1:8080", "")
            .build()
            .unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));

        let config = BrokerConfig::builder()
            .http("127.0.0.1:8080", "tunnel.example")
            .session_retry(3)
            .build()
            .unwrap();
        assert_eq!(config.muxer.domain, "tunnel.example");
        assert_eq!(config.registry.session_retry, 3);
    }

    #[test]
    fn test_agent_requires_identity() {
        let mut config = AgentConfig::default();
        config.control.server_addr = "127.0.0.1:7800".into();
        assert!(config.validate().is_err());

        config.control.id = "agent-1".into();
        config.control.client_hash = "hash".into();
        assert!(config.validate().is_ok());

        config.control.id = "bad\nid".into();
        assert!(config.validate().is_err());
    }
}
