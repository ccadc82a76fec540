//! Agent-side tunnel proxy
//!
//! Dials the broker's registry, upgrades the connection into a client-role
//! session and forwards every stream the broker opens to the local export
//! address. A lost session is re-registered through the retrier.

use crate::link::link_streams;
use crate::reconnect::Retrier;
use crate::session::{Session, VirtualStream};
use crate::tracker::TunnelTracker;
use crate::transport::{self, deadline};
use burrow_common::config::ProxyConfig;
use burrow_common::{Result, TunnelError};
use burrow_protocol::{
    read_to, write_message, NewTunnelRequest, TunnelHandshakeRequest, TunnelHandshakeResponse,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Which tunnel of which agent a proxy serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelIdentity {
    pub id: String,
    pub client_hash: String,
    pub tunnel_hash: String,
}

impl From<&NewTunnelRequest> for TunnelIdentity {
    fn from(request: &NewTunnelRequest) -> Self {
        Self {
            id: request.id.clone(),
            client_hash: request.client_hash.clone(),
            tunnel_hash: request.tunnel_hash.clone(),
        }
    }
}

pub struct TunnelProxy {
    identity: TunnelIdentity,
    registry_addr: String,
    export_addr: String,
    config: ProxyConfig,
    retrier: Retrier,
    tracker: Arc<dyn TunnelTracker>,
    tasks: TaskTracker,
    session: Mutex<Option<Session>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for TunnelProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelProxy")
            .field("identity", &self.identity)
            .field("registry_addr", &self.registry_addr)
            .field("export_addr", &self.export_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl TunnelProxy {
    /// Register with the broker's registry for the tunnel in `request`.
    ///
    /// The first registration is tried once; only re-registration after a
    /// lost session goes through the retrier. Forwarded streams are spawned on `tasks` so the owner can wait for
    /// them on shutdown.
    pub async fn connect(
        request: &NewTunnelRequest,
        config: ProxyConfig,
        tracker: Arc<dyn TunnelTracker>,
        tasks: TaskTracker,
    ) -> Result<Arc<Self>> {
        let proxy = Self {
            identity: TunnelIdentity::from(request),
            registry_addr: request.registry_addr.clone(),
            export_addr: request.export_addr.clone(),
            retrier: Retrier::new(config.retry),
            config,
            tracker,
            tasks,
            session: Mutex::new(None),
            shutdown: CancellationToken::new(),
        };

        let session = proxy.register_once().await?;
        *proxy.lock_session() = Some(session);
        Ok(Arc::new(proxy))
    }

    pub fn identity(&self) -> &TunnelIdentity {
        &self.identity
    }

    pub fn export_addr(&self) -> &str {
        &self.export_addr
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_session(&self) -> Option<Session> {
        self.lock_session().clone()
    }

    /// Closes the proxy and its session. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(session) = self.lock_session().take() {
            session.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn register(&self) -> Result<Session> {
        self.retrier
            .run(move |attempt| async move {
                if self.is_closed() {
                    return Err(TunnelError::Canceled);
                }
                self.register_once().await.inspect_err(|e| {
                    warn!(
                        tunnel = %self.identity.tunnel_hash,
                        attempt,
                        "Register with {} failed: {}",
                        self.registry_addr,
                        e
                    );
                })
            })
            .await
    }

    async fn register_once(&self) -> Result<Session> {
        let timeouts = self.config.tunnel;
        let mut stream = transport::connect(&self.registry_addr, timeouts.connect).await?;

        let request = TunnelHandshakeRequest {
            id: self.identity.id.clone(),
            client_hash: self.identity.client_hash.clone(),
            tunnel_hash: self.identity.tunnel_hash.clone(),
        };
        deadline(timeouts.write, write_message(&mut stream, &request.into())).await?;
        let response: TunnelHandshakeResponse =
            deadline(timeouts.read, read_to(&mut stream)).await?;
        response.status.check()?;

        Ok(Session::client(stream, &self.config.session))
    }

    /// Accept streams until closed or re-registration gives up.
    pub async fn serve(self: Arc<Self>) {
        let tunnel = self.identity.tunnel_hash.clone();
        info!(tunnel = %tunnel, export = %self.export_addr, "Proxy serving");

        while let Some(session) = self.current_session() {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = session.accept_stream() => accepted,
            };

            match accepted {
                Ok(stream) => {
                    let proxy = Arc::clone(&self);
                    self.tasks.spawn(async move { proxy.handle_stream(stream).await });
                }
                Err(e) if e.is_exhausted() => {
                    warn!(tunnel = %tunnel, "Accept stream: {}", e);
                }
                Err(e) => {
                    if self.is_closed() {
                        break;
                    }
                    error!(tunnel = %tunnel, "Session lost: {}, re-registering", e);

                    match self.register().await {
                        Ok(session) => {
                            let mut current = self.lock_session();
                            if self.is_closed() {
                                session.close();
                                break;
                            }
                            *current = Some(session);
                        }
                        Err(TunnelError::Canceled) => break,
                        Err(e) => {
                            error!(tunnel = %tunnel, "Reconnect failed: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        info!(tunnel = %tunnel, "Proxy stopped");
    }

    async fn handle_stream(&self, stream: VirtualStream) {
        let stream_id = stream.id();
        let local = match transport::connect(&self.export_addr, self.config.local.connect).await {
            Ok(local) => local,
            Err(e) => {
                error!(
                    tunnel = %self.identity.tunnel_hash,
                    stream_id,
                    "Failed to connect to {}: {}",
                    self.export_addr,
                    e
                );
                return;
            }
        };

        debug!(stream_id, export = %self.export_addr, "linking stream");
        let (bytes_in, bytes_out) = link_streams(stream, local, self.config.link_buffer).await;
        self.tracker.record_traffic(bytes_in, bytes_out);
        debug!(stream_id, bytes_in, bytes_out, "linked stream closed");
    }
}

impl Drop for TunnelProxy {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::NoopTracker;
    use burrow_common::config::{RetryConfig, SessionConfig};
    use burrow_protocol::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn request(registry_addr: String, export_addr: String) -> NewTunnelRequest {
        NewTunnelRequest {
            id: "agent-1".into(),
            client_hash: "hash-1".into(),
            tunnel_hash: "tunnel-1".into(),
            proto: "tcp".into(),
            export_addr,
            registry_addr,
        }
    }

    fn config(max_attempts: u32) -> ProxyConfig {
        ProxyConfig {
            retry: RetryConfig {
                backoff: Duration::from_millis(5),
                max_attempts,
            },
            ..ProxyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_forwards_streams_to_export_addr() {
        let export = echo_server().await;
        let registry = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry_addr = registry.local_addr().unwrap().to_string();

        let broker = tokio::spawn(async move {
            let (mut conn, _) = registry.accept().await.unwrap();
            let hs: TunnelHandshakeRequest = read_to(&mut conn).await.unwrap();
            assert_eq!(hs.tunnel_hash, "tunnel-1");
            write_message(&mut conn, &TunnelHandshakeResponse::default().into())
                .await
                .unwrap();

            let session = Session::server(conn, &SessionConfig::default());
            let mut stream = session.open_stream().await.unwrap();
            stream.write_all(b"ping through tunnel").await.unwrap();
            stream.shutdown().await.unwrap();
            let mut echoed = Vec::new();
            stream.read_to_end(&mut echoed).await.unwrap();
            echoed
        });

        let proxy = TunnelProxy::connect(
            &request(registry_addr, export),
            config(3),
            Arc::new(NoopTracker),
            TaskTracker::new(),
        )
        .await
        .unwrap();
        let serving = tokio::spawn(Arc::clone(&proxy).serve());

        assert_eq!(broker.await.unwrap(), b"ping through tunnel");
        proxy.close();
        proxy.close();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_registration_fails_without_retry() {
        let registry = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry_addr = registry.local_addr().unwrap().to_string();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        tokio::spawn(async move {
            while let Ok((mut conn, _)) = registry.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let _: TunnelHandshakeRequest = read_to(&mut conn).await.unwrap();
                let response = TunnelHandshakeResponse {
                    status: StatusCode::NoSuchTunnel,
                };
                write_message(&mut conn, &response.into()).await.unwrap();
            }
        });

        let err = TunnelProxy::connect(
            &request(registry_addr, "127.0.0.1:1".into()),
            config(4),
            Arc::new(NoopTracker),
            TaskTracker::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TunnelError::Rejected(StatusCode::NoSuchTunnel)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lost_session_is_re_registered() {
        let export = echo_server().await;
        let registry = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry_addr = registry.local_addr().unwrap().to_string();

        let broker = tokio::spawn(async move {
            let mut echoed = Vec::new();
            for round in 0..2u8 {
                let (mut conn, _) = registry.accept().await.unwrap();
                let _: TunnelHandshakeRequest = read_to(&mut conn).await.unwrap();
                write_message(&mut conn, &TunnelHandshakeResponse::default().into())
                    .await
                    .unwrap();
                let session = Session::server(conn, &SessionConfig::default());
                if round == 0 {
                    session.close();
                    continue;
                }
                let mut stream = session.open_stream().await.unwrap();
                stream.write_all(b"second").await.unwrap();
                stream.shutdown().await.unwrap();
                stream.read_to_end(&mut echoed).await.unwrap();
            }
            echoed
        });

        let proxy = TunnelProxy::connect(
            &request(registry_addr, export),
            config(3),
            Arc::new(NoopTracker),
            TaskTracker::new(),
        )
        .await
        .unwrap();
        let serving = tokio::spawn(Arc::clone(&proxy).serve());

        assert_eq!(broker.await.unwrap(), b"second");
        proxy.close();
        serving.await.unwrap();
    }
}
