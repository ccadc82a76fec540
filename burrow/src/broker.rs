//! Embeddable broker
//!
//! Accepts agent control connections, opens each agent's tunnels in the
//! registry and keeps one control session per agent until it disconnects.
//!
//! # Example
//!
//! ```rust,no_run
//! use burrow::{Broker, BrokerConfig, MemoryStorage, PubSub};
//! use std::sync::Arc;
//!
//! # async fn example() -> burrow::Result<()> {
//! let config = BrokerConfig::builder()
//!     .control_addr("0.0.0.0:7800")
//!     .http("0.0.0.0:8080", "tunnel.example")
//!     .build()?;
//! let broker = Broker::bind(config, Arc::new(MemoryStorage::new()), PubSub::new()).await?;
//! broker.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::BrokerConfig;
use crate::pubsub::{Event, PubSub};
use crate::storage::{AgentUpdate, Storage, TunnelRecord};
use crate::tracker::StorageAgentTracker;
use burrow_common::version::{is_compatible, VERSION};
use burrow_common::{Result, TunnelError};
use burrow_core::auth::validate_identity;
use burrow_core::tracker::AgentTracker;
use burrow_core::{AgentConn, ControlServer, DelayTimer, Validator};
use burrow_http::{HttpMuxer, Registry};
use burrow_observability::TunnelMetrics;
use burrow_protocol::{
    CloseTunnelRequest, HandshakeRequest, Message, NewTunnelRequest, PingResponse,
    ShutdownRequest, StatusCode,
};
use kanal::AsyncReceiver;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long a rejected agent gets to hang up after its shutdown request
const REJECT_GRACE: Duration = Duration::from_secs(1);

/// Admission policy: known agent, compatible version, one session per agent
pub struct BrokerValidator<S: Storage> {
    storage: Arc<S>,
    connected: Mutex<HashSet<String>>,
}

impl<S: Storage> BrokerValidator<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            connected: Mutex::new(HashSet::new()),
        }
    }

    fn key(id: &str, hash: &str) -> String {
        format!("{id}:{hash}")
    }

    pub fn is_connected(&self, id: &str, hash: &str) -> bool {
        self.connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&Self::key(id, hash))
    }

    fn remove(&self, id: &str, hash: &str) {
        self.connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::key(id, hash));
    }

    fn admit(&self, request: &HandshakeRequest) -> StatusCode {
        if validate_identity(&request.id).is_err() || validate_identity(&request.client_hash).is_err()
        {
            return StatusCode::BadClient;
        }

        let key = Self::key(&request.id, &request.client_hash);
        let mut connected = self
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if connected.contains(&key) {
            warn!(agent = %request.id, "Agent already connected");
            return StatusCode::DuplicateAgent;
        }

        if !is_compatible(&request.version, VERSION) {
            return StatusCode::BadVersion;
        }

        let update = AgentUpdate {
            device: Some(request.device.clone()),
            version: Some(request.version.clone()),
            ..AgentUpdate::default()
        };
        match self
            .storage
            .update_agent(&request.id, &request.client_hash, update)
        {
            Ok(true) => {
                connected.insert(key);
                StatusCode::Ok
            }
            Ok(false) => {
                warn!(agent = %request.id, "Agent may not exist");
                StatusCode::BadClient
            }
            Err(e) => {
                error!(agent = %request.id, "Update agent failed: {}", e);
                StatusCode::InternalServerError
            }
        }
    }
}

impl<S: Storage> Validator for BrokerValidator<S> {
    async fn validate(&self, request: &HandshakeRequest) -> StatusCode {
        self.admit(request)
    }

    fn release(&self, request: &HandshakeRequest) {
        self.remove(&request.id, &request.client_hash);
    }
}

/// Reverse-tunnel broker
pub struct Broker<S: Storage> {
    config: BrokerConfig,
    storage: Arc<S>,
    pubsub: PubSub,
    metrics: Arc<TunnelMetrics>,
    server: ControlServer<BrokerValidator<S>>,
    accepted: AsyncReceiver<AgentConn>,
    registry: Registry,
    sessions: TaskTracker,
    shutdown: CancellationToken,
}

impl<S: Storage> std::fmt::Debug for Broker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("control_addr", &self.server.local_addr())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> Broker<S> {
    /// Bind the control, registry and (if configured) HTTP listeners.
    pub async fn bind(config: BrokerConfig, storage: Arc<S>, pubsub: PubSub) -> Result<Self> {
        config.validate()?;

        let metrics = TunnelMetrics::new().map_err(|e| TunnelError::Config(e.to_string()))?;

        let muxer = match &config.http_addr {
            Some(addr) => Some(HttpMuxer::bind(addr, config.muxer.clone()).await?),
            None => None,
        };
        let registry = Registry::bind(config.registry.clone(), muxer).await?;
        let (server, accepted) = ControlServer::bind(
            &config.control_addr,
            BrokerValidator::new(Arc::clone(&storage)),
            config.control,
        )
        .await?;

        Ok(Self {
            config,
            storage,
            pubsub,
            metrics: Arc::new(metrics),
            server,
            accepted,
            registry,
            sessions: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    pub fn metrics(&self) -> &Arc<TunnelMetrics> {
        &self.metrics
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn validator(&self) -> &Arc<BrokerValidator<S>> {
        self.server.validator()
    }

    /// Serve until [`close`](Self::close) or a listener fails.
    pub async fn run(&self) -> Result<()> {
        info!("Starting broker");
        info!("  Control: {}", self.server.local_addr());
        info!("  Registry: {}", self.registry.advertise_addr());
        if let Some(muxer) = self.registry.muxer() {
            info!("  HTTP: {} (*.{})", muxer.local_addr(), muxer.domain());
        }

        let control = self.server.run();
        let registry = self.registry.serve();
        tokio::pin!(control, registry);

        let result = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break Ok(()),
                served = &mut control => break served,
                served = &mut registry => break served.map_err(TunnelError::from),
                conn = self.accepted.recv() => match conn {
                    Ok(conn) => self.spawn_session(conn),
                    Err(_) => break Ok(()),
                },
            }
        };

        self.shutdown.cancel();
        self.server.close();
        self.registry.close().await;
        result
    }

    fn spawn_session(&self, conn: AgentConn) {
        info!(agent = %conn.id, peer_addr = ?conn.peer_addr(), "New agent connected");

        let session = AgentSession {
            tracker: StorageAgentTracker::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.metrics),
                conn.id.clone(),
                conn.client_hash.clone(),
            ),
            conn,
            storage: Arc::clone(&self.storage),
            registry: self.registry.clone(),
            pubsub: self.pubsub.clone(),
            validator: Arc::clone(self.server.validator()),
            delay_window: self.config.delay_window,
            shutdown: self.shutdown.child_token(),
        };
        self.sessions.spawn(session.run());
    }

    /// Signal [`run`](Self::run) and every agent session to stop. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Close, then wait up to the graceful timeout for sessions and tunnels.
    ///
    /// Returns false if the timeout expired first.
    pub async fn shutdown(&self) -> bool {
        info!("Graceful shutdown..");
        self.close();
        self.server.close();
        self.registry.close().await;

        let drained = async {
            self.sessions.close();
            self.sessions.wait().await;
            self.registry.wait_done().await;
        };
        tokio::time::timeout(self.config.graceful_shutdown, drained)
            .await
            .is_ok()
    }
}

impl<S: Storage> Drop for Broker<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One agent's control session on the broker
struct AgentSession<S: Storage> {
    conn: AgentConn,
    storage: Arc<S>,
    registry: Registry,
    pubsub: PubSub,
    validator: Arc<BrokerValidator<S>>,
    tracker: StorageAgentTracker<S>,
    delay_window: usize,
    shutdown: CancellationToken,
}

impl<S: Storage> AgentSession<S> {
    async fn run(self) {
        self.tracker.connected();
        let events = self.pubsub.subscribe(&self.conn.client_hash);

        let result = match self.open_all_tunnels().await {
            Ok(()) => self.serve(&events).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!(agent = %self.conn.id, "Stopping.."),
            Err(e) => error!(agent = %self.conn.id, "Session ended: {}", e),
        }

        self.pubsub.unsubscribe(&self.conn.client_hash);
        self.conn.close();
        self.registry.deregister_all(&self.conn.client_hash).await;
        self.tracker.disconnected();
        self.validator.remove(&self.conn.id, &self.conn.client_hash);
    }

    async fn serve(&self, events: &AsyncReceiver<Event>) -> Result<()> {
        let mut delay_timer = DelayTimer::new(self.delay_window);
        let mut last_ping: Option<Instant> = None;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                received = self.conn.recv() => match received {
                    Ok(Message::PingRequest(_)) => {
                        let now = Instant::now();
                        // Reply first so the delay covers the full ping cycle
                        self.conn.send(PingResponse).await?;
                        if let Some(last) = last_ping {
                            let delay = delay_timer.observe(now - last);
                            self.tracker.delayed(delay);
                        }
                        last_ping = Some(now);
                    }
                    Ok(message) => self.handle_message(message).await,
                    Err(e) if e.is_transient() => debug!(agent = %self.conn.id, "{e}"),
                    Err(e) => return Err(e.into()),
                },
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await?,
                    // Unsubscribed or replaced
                    Err(_) => return Ok(()),
                },
            }
        }
    }

    async fn handle_message(&self, message: Message) {
        match message {
            Message::NewTunnelResponse(response) => {
                if let Err(status) = response.status.check() {
                    error!(
                        agent = %self.conn.id,
                        tunnel = %response.tunnel_hash,
                        "Received bad NewTunnelResponse: {}",
                        status
                    );
                    self.registry
                        .deregister(&self.conn.client_hash, &response.tunnel_hash)
                        .await;
                } else {
                    info!(agent = %self.conn.id, tunnel = %response.tunnel_hash, "Tunnel registered");
                }
            }
            Message::CloseTunnelResponse(response) => match response.status.check() {
                Ok(()) => {
                    info!(agent = %self.conn.id, tunnel = %response.tunnel_hash, "Tunnel has been closed");
                }
                Err(status) => {
                    error!(agent = %self.conn.id, "Received bad CloseTunnelResponse: {}", status);
                }
            },
            other => warn!(agent = %self.conn.id, kind = %other.kind(), "Unknown message"),
        }
    }

    async fn handle_event(&self, event: Event) -> Result<()> {
        let id = &self.conn.id;
        let hash = &self.conn.client_hash;

        match event {
            Event::OpenTunnel(tunnel) => {
                let record = self.storage.tunnel(id, hash, &tunnel)?;
                self.open_tunnel(&record).await?;
            }
            Event::CloseTunnel(tunnel) => {
                if self.registry.deregister(hash, &tunnel).await {
                    let request = CloseTunnelRequest {
                        id: id.clone(),
                        client_hash: hash.clone(),
                        tunnel_hash: tunnel,
                    };
                    self.conn.send(request).await?;
                }
            }
            Event::RejectAgent => {
                let request = ShutdownRequest {
                    id: id.clone(),
                    client_hash: hash.clone(),
                };
                self.conn.send(request).await?;
                // The agent hangs up once it has read the request
                let _ = tokio::time::timeout(REJECT_GRACE, self.conn.pump().closed()).await;
                return Err(TunnelError::Rejected(StatusCode::BadClient));
            }
        }
        Ok(())
    }

    async fn open_all_tunnels(&self) -> Result<()> {
        let tunnels = self
            .storage
            .enabled_tunnels(&self.conn.id, &self.conn.client_hash)?;
        for tunnel in &tunnels {
            self.open_tunnel(tunnel).await?;
        }
        Ok(())
    }

    /// Register the tunnel, then ask the agent to dial back for it.
    /// A failed registration is logged and skipped.
    async fn open_tunnel(&self, tunnel: &TunnelRecord) -> Result<()> {
        let tracker = Arc::new(self.tracker.tunnel_tracker(&tunnel.hash));
        let registered = self
            .registry
            .register(
                &self.conn.client_hash,
                &tunnel.hash,
                &tunnel.proto,
                &tunnel.server_addr,
                tracker,
            )
            .await;
        if let Err(e) = registered {
            error!(agent = %self.conn.id, tunnel = %tunnel.hash, "Open tunnel failed: {}", e);
            return Ok(());
        }

        let request = NewTunnelRequest {
            id: self.conn.id.clone(),
            client_hash: self.conn.client_hash.clone(),
            tunnel_hash: tunnel.hash.clone(),
            proto: tunnel.proto.clone(),
            export_addr: tunnel.export_addr.clone(),
            registry_addr: self.registry.advertise_addr().to_string(),
        };
        self.conn.send(request).await?;
        Ok(())
    }
}
