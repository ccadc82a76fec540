//! Embeddable agent
//!
//! Keeps a control connection to the broker and runs one tunnel proxy for
//! every tunnel the broker asks for.
//!
//! # Example
//!
//! ```rust,no_run
//! use burrow::Agent;
//!
//! # async fn example() -> burrow::Result<()> {
//! let agent = Agent::builder()
//!     .server_addr("broker.example.com:7800")
//!     .id("agent-1")
//!     .client_hash("secret-hash")
//!     .build()?;
//! agent.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::AgentConfig;
use burrow_common::config::{ProxyConfig, RetryConfig};
use burrow_common::Result;
use burrow_core::control::client::ClientState;
use burrow_core::tracker::{NoopTracker, TunnelTracker};
use burrow_core::{ClientHandler, ControlClient, PumpError, TunnelProxy};
use burrow_protocol::{
    CloseTunnelRequest, CloseTunnelResponse, NewTunnelRequest, NewTunnelResponse,
    ShutdownRequest, StatusCode,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

type ProxyMap = HashMap<String, Arc<TunnelProxy>>;

/// Agent-side handler of broker requests; owns the running proxies
pub struct Controller {
    id: String,
    client_hash: String,
    proxy: ProxyConfig,
    proxies: Arc<Mutex<ProxyMap>>,
    tasks: TaskTracker,
    tracker: Arc<dyn TunnelTracker>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(id: impl Into<String>, client_hash: impl Into<String>, proxy: ProxyConfig) -> Self {
        Self {
            id: id.into(),
            client_hash: client_hash.into(),
            proxy,
            proxies: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
            tracker: Arc::new(NoopTracker),
        }
    }

    /// Report tunnel lifecycle and traffic of every proxy to `tracker`
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<dyn TunnelTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    fn is_self(&self, id: &str, client_hash: &str) -> bool {
        self.id == id && self.client_hash == client_hash
    }

    /// Hashes of the tunnels currently proxied
    pub async fn tunnels(&self) -> Vec<String> {
        self.proxies.lock().await.keys().cloned().collect()
    }

    /// Close every proxy, then wait up to `grace` for forwarded streams.
    pub async fn close_all(&self, grace: Duration) -> bool {
        let proxies = std::mem::take(&mut *self.proxies.lock().await);
        for proxy in proxies.values() {
            proxy.close();
        }
        self.tasks.close();
        tokio::time::timeout(grace, self.tasks.wait()).await.is_ok()
    }

    async fn open(&self, request: &NewTunnelRequest) -> StatusCode {
        if !self.is_self(&request.id, &request.client_hash) {
            return StatusCode::BadClient;
        }

        if self.proxies.lock().await.contains_key(&request.tunnel_hash) {
            return StatusCode::Ok;
        }

        let proxy = match TunnelProxy::connect(
            request,
            self.proxy,
            Arc::clone(&self.tracker),
            self.tasks.clone(),
        )
        .await
        {
            Ok(proxy) => proxy,
            Err(e) => {
                error!(tunnel = %request.tunnel_hash, "Connect registry failed: {}", e);
                return StatusCode::BadRegistryAddr;
            }
        };

        {
            let mut proxies = self.proxies.lock().await;
            if proxies.contains_key(&request.tunnel_hash) {
                // Lost a race with a duplicate request
                proxy.close();
                return StatusCode::Ok;
            }
            proxies.insert(request.tunnel_hash.clone(), Arc::clone(&proxy));
        }

        let registry = Arc::clone(&self.proxies);
        let tunnel = request.tunnel_hash.clone();
        self.tasks.spawn(async move {
            Arc::clone(&proxy).serve().await;
            let mut proxies = registry.lock().await;
            if proxies.get(&tunnel).is_some_and(|p| Arc::ptr_eq(p, &proxy)) {
                proxies.remove(&tunnel);
            }
        });
        StatusCode::Ok
    }

    async fn close(&self, request: &CloseTunnelRequest) -> StatusCode {
        if !self.is_self(&request.id, &request.client_hash) {
            return StatusCode::BadClient;
        }
        match self.proxies.lock().await.remove(&request.tunnel_hash) {
            Some(proxy) => {
                proxy.close();
                StatusCode::Ok
            }
            None => StatusCode::NoSuchTunnel,
        }
    }
}

impl ClientHandler for Controller {
    fn on_disconnected(&self, error: &PumpError) {
        warn!(agent = %self.id, "Disconnected from broker: {}", error);
    }

    fn on_ping_response(&self, delay: Duration) {
        debug!(agent = %self.id, ?delay, "Ping response");
    }

    async fn on_new_tunnel(&self, request: NewTunnelRequest) -> NewTunnelResponse {
        info!(tunnel = %request.tunnel_hash, export = %request.export_addr, "New tunnel requested");
        let status = self.open(&request).await;
        NewTunnelResponse {
            status,
            tunnel_hash: request.tunnel_hash,
        }
    }

    async fn on_close_tunnel(&self, request: CloseTunnelRequest) -> CloseTunnelResponse {
        info!(tunnel = %request.tunnel_hash, "Close tunnel requested");
        let status = self.close(&request).await;
        CloseTunnelResponse {
            status,
            tunnel_hash: request.tunnel_hash,
        }
    }

    fn on_shutdown(&self, request: &ShutdownRequest) -> bool {
        let accepted = self.is_self(&request.id, &request.client_hash);
        if !accepted {
            warn!(agent = %self.id, "Ignoring shutdown request for {}", request.id);
        }
        accepted
    }
}

/// A reverse-tunnel agent that can be embedded in your application.
///
/// Use [`Agent::builder()`] for ergonomic construction.
pub struct Agent {
    client: ControlClient<Controller>,
    graceful_shutdown: Duration,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("controller", self.controller())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let controller = Controller::new(
            config.control.id.clone(),
            config.control.client_hash.clone(),
            config.proxy,
        );
        Ok(Self::with_controller(config, controller))
    }

    /// Build an agent around a prepared controller, e.g. one with a tracker.
    pub fn with_controller(config: AgentConfig, controller: Controller) -> Self {
        Self {
            client: ControlClient::new(config.control, controller),
            graceful_shutdown: config.graceful_shutdown,
        }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        self.client.handler()
    }

    pub fn state(&self) -> ClientState {
        self.client.state()
    }

    /// Run until the broker shuts the agent down, [`close`](Self::close) is
    /// called or reconnecting gives up.
    pub async fn run(&self) -> Result<()> {
        let result = self.client.run().await;
        if let Err(e) = &result {
            error!("Agent stopped: {}", e);
        }
        self.controller().close_all(self.graceful_shutdown).await;
        result
    }

    /// Signal [`run`](Self::run) to stop. Idempotent.
    pub fn close(&self) {
        self.client.close();
    }

    /// Stop and wait up to the graceful timeout for in-flight requests and
    /// forwarded streams. Returns false if the timeout expired first.
    pub async fn shutdown(&self) -> bool {
        info!("Graceful shutdown..");
        let grace = self.graceful_shutdown;
        let requests = self.client.shutdown(grace).await;
        let streams = self.controller().close_all(grace).await;
        requests && streams
    }
}

/// Builder for [`Agent`]
#[derive(Debug, Default)]
pub struct AgentBuilder {
    config: AgentConfig,
}

impl AgentBuilder {
    /// Broker control address
    #[must_use]
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.control.server_addr = addr.into();
        self
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.control.id = id.into();
        self
    }

    #[must_use]
    pub fn client_hash(mut self, hash: impl Into<String>) -> Self {
        self.config.control.client_hash = hash.into();
        self
    }

    /// Control-connection heartbeat period.
    ///
    /// Default: 3 seconds
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.control.heartbeat_interval = interval;
        self
    }

    /// Reconnect policy for both the control connection and tunnel proxies
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.control.retry = retry;
        self.config.proxy.retry = retry;
        self
    }

    #[must_use]
    pub fn graceful_shutdown(mut self, timeout: Duration) -> Self {
        self.config.graceful_shutdown = timeout;
        self
    }

    pub fn build(self) -> Result<Agent> {
        Agent::new(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_common::TunnelError;

    fn controller() -> Controller {
        Controller::new("agent-1", "hash-1", ProxyConfig::default())
    }

    #[test]
    fn test_builder_requires_identity() {
        let err = Agent::builder()
            .server_addr("127.0.0.1:7800")
            .build()
            .unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));

        let agent = Agent::builder()
            .server_addr("127.0.0.1:7800")
            .id("agent-1")
            .client_hash("hash-1")
            .build()
            .unwrap();
        assert_eq!(agent.state(), ClientState::Idle);
    }

    #[test]
    fn test_builder_defaults() {
        let builder = Agent::builder();
        assert_eq!(
            builder.config.control.heartbeat_interval,
            Duration::from_secs(3)
        );
        assert_eq!(builder.config.proxy.retry, RetryConfig::default());
    }

    #[tokio::test]
    async fn test_requests_for_other_agents_are_refused() {
        let controller = controller();
        let response = controller
            .on_new_tunnel(NewTunnelRequest {
                id: "agent-2".into(),
                client_hash: "hash-1".into(),
                tunnel_hash: "t1".into(),
                ..NewTunnelRequest::default()
            })
            .await;
        assert_eq!(response.status, StatusCode::BadClient);
        assert_eq!(response.tunnel_hash, "t1");

        let response = controller
            .on_close_tunnel(CloseTunnelRequest {
                id: "agent-1".into(),
                client_hash: "other".into(),
                tunnel_hash: "t1".into(),
            })
            .await;
        assert_eq!(response.status, StatusCode::BadClient);

        assert!(!controller.on_shutdown(&ShutdownRequest {
            id: "agent-2".into(),
            client_hash: "hash-1".into(),
        }));
        assert!(controller.on_shutdown(&ShutdownRequest {
            id: "agent-1".into(),
            client_hash: "hash-1".into(),
        }));
    }

    #[tokio::test]
    async fn test_close_unknown_tunnel() {
        let response = controller()
            .on_close_tunnel(CloseTunnelRequest {
                id: "agent-1".into(),
                client_hash: "hash-1".into(),
                tunnel_hash: "missing".into(),
            })
            .await;
        assert_eq!(response.status, StatusCode::NoSuchTunnel);
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        // Default retry policy; the first registration is still a single try
        let controller = controller();

        let started = tokio::time::Instant::now();
        let response = controller
            .on_new_tunnel(NewTunnelRequest {
                id: "agent-1".into(),
                client_hash: "hash-1".into(),
                tunnel_hash: "t1".into(),
                proto: "tcp".into(),
                export_addr: "127.0.0.1:1".into(),
                registry_addr: "127.0.0.1:1".into(),
            })
            .await;
        assert_eq!(response.status, StatusCode::BadRegistryAddr);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(controller.tunnels().await.is_empty());
    }
}
