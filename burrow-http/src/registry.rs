//! Tunnel registry
//!
//! Owns every tunnel the broker exposes, keyed by agent hash then tunnel
//! hash, and the listener agents dial back on to attach a session to one of
//! them.

use crate::listener::TunnelListener;
use crate::muxer::{HttpMuxer, MuxerError};
use crate::tunnel::{Tunnel, TunnelSettings};
use burrow_common::config::{ChannelTimeouts, RegistryConfig};
use burrow_common::TunnelError;
use burrow_core::tracker::TunnelTracker;
use burrow_core::transport::{deadline, socket_tuning};
use burrow_protocol::{
    read_to, write_message, StatusCode, TunnelHandshakeRequest, TunnelHandshakeResponse,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("registry closed")]
    Closed,

    #[error(transparent)]
    Muxer(#[from] MuxerError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<RegistryError> for TunnelError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Io(e) => Self::Io(e),
            e => Self::InvalidState(e.to_string()),
        }
    }
}

type TunnelMap = HashMap<String, HashMap<String, Arc<Tunnel>>>;

struct RegistryInner {
    listener: TcpListener,
    advertise_addr: String,
    settings: TunnelSettings,
    handshake: ChannelTimeouts,
    muxer: Option<HttpMuxer>,
    tunnels: Mutex<TunnelMap>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Broker-side tunnel registry. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("advertise_addr", &self.inner.advertise_addr)
            .field("muxer", &self.inner.muxer)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Bind the tunnel-handshake listener.
    ///
    /// HTTP tunnels go through `muxer` when one is given and get a dedicated
    /// port otherwise.
    pub async fn bind(
        config: RegistryConfig,
        muxer: Option<HttpMuxer>,
    ) -> Result<Self, RegistryError> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let advertise_addr = advertise_addr(config.advertise_host.as_deref(), local_addr);

        Ok(Self {
            inner: Arc::new(RegistryInner {
                listener,
                advertise_addr,
                settings: TunnelSettings {
                    session: config.session,
                    session_retry: config.session_retry,
                    link_buffer: config.link_buffer,
                },
                handshake: config.handshake,
                muxer,
                tunnels: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Address agents dial for the tunnel handshake
    pub fn advertise_addr(&self) -> &str {
        &self.inner.advertise_addr
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.listener.local_addr()
    }

    pub fn muxer(&self) -> Option<&HttpMuxer> {
        self.inner.muxer.as_ref()
    }

    /// Serve tunnel handshakes and, if configured, the HTTP muxer.
    /// Returns when either stops.
    pub async fn serve(&self) -> Result<(), RegistryError> {
        info!(addr = %self.inner.advertise_addr, "Tunnel registry listening");

        match &self.inner.muxer {
            Some(muxer) => tokio::select! {
                served = muxer.serve() => served.map_err(RegistryError::from),
                served = self.serve_handshakes() => served,
            },
            None => self.serve_handshakes().await,
        }
    }

    async fn serve_handshakes(&self) -> Result<(), RegistryError> {
        loop {
            let accepted = tokio::select! {
                () = self.inner.shutdown.cancelled() => return Ok(()),
                accepted = self.inner.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    socket_tuning::tune_silent(&stream);
                    let registry = self.clone();
                    tokio::spawn(async move { registry.handshake(stream, peer_addr).await });
                }
                Err(e) => {
                    if self.inner.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    return Err(e.into());
                }
            }
        }
    }

    async fn handshake(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let timeouts = self.inner.handshake;
        let request: TunnelHandshakeRequest =
            match deadline(timeouts.read, read_to(&mut stream)).await {
                Ok(request) => request,
                Err(e) => {
                    warn!(peer_addr = %peer_addr, "Read handshake request failed: {}", e);
                    return;
                }
            };

        let tunnel = self.tunnel(&request.client_hash, &request.tunnel_hash).await;
        let status = if tunnel.is_some() {
            StatusCode::Ok
        } else {
            info!(
                agent = %request.client_hash,
                tunnel = %request.tunnel_hash,
                "No tunnel registered"
            );
            StatusCode::NoSuchTunnel
        };

        let response = TunnelHandshakeResponse { status };
        if let Err(e) = deadline(timeouts.write, write_message(&mut stream, &response.into())).await
        {
            warn!(
                agent = %request.client_hash,
                tunnel = %request.tunnel_hash,
                "Write handshake response failed: {}",
                e
            );
            return;
        }

        if let Some(tunnel) = tunnel {
            if !tunnel.new_session(stream) {
                info!(
                    agent = %request.client_hash,
                    tunnel = %request.tunnel_hash,
                    "Duplicate connection for tunnel"
                );
            }
        }
    }

    /// Expose a tunnel. Registering an existing key is a no-op returning the
    /// running tunnel.
    ///
    /// `proto` is `tcp` or `http`; `server_addr` is the bind address for TCP
    /// and the subdomain for HTTP when a muxer is configured.
    pub async fn register(
        &self,
        agent_hash: &str,
        tunnel_hash: &str,
        proto: &str,
        server_addr: &str,
        tracker: Arc<dyn TunnelTracker>,
    ) -> Result<Arc<Tunnel>, RegistryError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RegistryError::Closed);
        }

        let mut tunnels = self.inner.tunnels.lock().await;
        let agent_tunnels = tunnels.entry(agent_hash.to_string()).or_default();
        if let Some(tunnel) = agent_tunnels.get(tunnel_hash) {
            return Ok(Arc::clone(tunnel));
        }

        let listener = match self.make_listener(proto, server_addr, tracker.as_ref()).await {
            Ok(listener) => listener,
            Err(e) => {
                if agent_tunnels.is_empty() {
                    tunnels.remove(agent_hash);
                }
                return Err(e);
            }
        };
        let tunnel = Arc::new(Tunnel::new(
            agent_hash,
            tunnel_hash,
            listener,
            self.inner.settings,
            tracker,
        ));
        agent_tunnels.insert(tunnel_hash.to_string(), Arc::clone(&tunnel));
        drop(tunnels);

        let registry = self.clone();
        let serving = Arc::clone(&tunnel);
        self.inner.tasks.spawn(async move {
            if let Err(e) = Arc::clone(&serving).serve().await {
                warn!(tunnel = %serving.tunnel_hash(), "Tunnel listener failed: {}", e);
            }
            registry.remove(&serving).await;
            serving.wait_and_cleanup().await;
        });

        info!(
            agent = %agent_hash,
            tunnel = %tunnel_hash,
            proto = %proto,
            addr = ?tunnel.local_addr(),
            "New tunnel registered"
        );
        Ok(tunnel)
    }

    async fn make_listener(
        &self,
        proto: &str,
        server_addr: &str,
        tracker: &dyn TunnelTracker,
    ) -> Result<TunnelListener, RegistryError> {
        let proto = proto.to_ascii_lowercase();
        match (proto.as_str(), &self.inner.muxer) {
            ("http", Some(muxer)) => Ok(TunnelListener::Vhost(muxer.listen(server_addr)?)),
            ("http" | "tcp", _) => match TunnelListener::bind_tcp(server_addr).await {
                Ok(listener) => Ok(listener),
                Err(e) => {
                    tracker.on_error(&format!("listen on server address: {e}"));
                    Err(e.into())
                }
            },
            (other, _) => Err(RegistryError::UnsupportedProtocol(other.to_string())),
        }
    }

    pub async fn tunnel(&self, agent_hash: &str, tunnel_hash: &str) -> Option<Arc<Tunnel>> {
        self.inner
            .tunnels
            .lock()
            .await
            .get(agent_hash)
            .and_then(|tunnels| tunnels.get(tunnel_hash))
            .cloned()
    }

    /// Close and forget one tunnel. Returns false if it was not registered.
    pub async fn deregister(&self, agent_hash: &str, tunnel_hash: &str) -> bool {
        let mut tunnels = self.inner.tunnels.lock().await;
        let Some(agent_tunnels) = tunnels.get_mut(agent_hash) else {
            return false;
        };
        let Some(tunnel) = agent_tunnels.remove(tunnel_hash) else {
            return false;
        };
        if agent_tunnels.is_empty() {
            tunnels.remove(agent_hash);
        }
        drop(tunnels);

        tunnel.close();
        info!(agent = %agent_hash, tunnel = %tunnel_hash, "Tunnel deregistered");
        true
    }

    /// Close and forget every tunnel of an agent
    pub async fn deregister_all(&self, agent_hash: &str) -> bool {
        let removed = self.inner.tunnels.lock().await.remove(agent_hash);
        let Some(agent_tunnels) = removed else {
            return false;
        };

        for (tunnel_hash, tunnel) in agent_tunnels {
            tunnel.close();
            info!(agent = %agent_hash, tunnel = %tunnel_hash, "Tunnel deregistered");
        }
        true
    }

    /// Drop the map entry of a tunnel whose accept loop ended, unless a newer
    /// tunnel took its key.
    async fn remove(&self, tunnel: &Arc<Tunnel>) {
        let mut tunnels = self.inner.tunnels.lock().await;
        if let Some(agent_tunnels) = tunnels.get_mut(tunnel.agent_hash()) {
            let same = agent_tunnels
                .get(tunnel.tunnel_hash())
                .is_some_and(|current| Arc::ptr_eq(current, tunnel));
            if same {
                agent_tunnels.remove(tunnel.tunnel_hash());
                if agent_tunnels.is_empty() {
                    tunnels.remove(tunnel.agent_hash());
                }
            }
        }
        drop(tunnels);
        tunnel.close();
    }

    /// Number of registered tunnels across all agents
    pub async fn len(&self) -> usize {
        self.inner.tunnels.lock().await.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop listening and close every tunnel.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        if let Some(muxer) = &self.inner.muxer {
            muxer.close();
        }

        let tunnels = std::mem::take(&mut *self.inner.tunnels.lock().await);
        for tunnel in tunnels.into_values().flat_map(HashMap::into_values) {
            tunnel.close();
        }
    }

    /// Wait for every tunnel's accept loop and cleanup to finish
    pub async fn wait_done(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

fn advertise_addr(host: Option<&str>, local_addr: SocketAddr) -> String {
    let port = local_addr.port();
    match host {
        Some(host) if !host.is_empty() => format!("{host}:{port}"),
        _ if local_addr.ip().is_unspecified() => format!("127.0.0.1:{port}"),
        _ => local_addr.to_string(),
    }
}
