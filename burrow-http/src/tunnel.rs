//! One registered tunnel: a public listener bound to the agent's session
//!
//! The agent dials back and its connection becomes the tunnel's session.
//! Every connection accepted on the public listener is forwarded over a
//! fresh stream of that session. At most one live session is installed at a
//! time; a version counter keeps a failed stream-open on an old session from
//! discarding a newer one.

use crate::listener::TunnelListener;
use burrow_common::config::SessionConfig;
use burrow_core::link::link_streams;
use burrow_core::session::{Session, VirtualStream};
use burrow_core::tracker::TunnelTracker;
use burrow_core::transport::BoxedStream;
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Why a forwarded connection could not get a stream
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    #[error("local address may be not working")]
    NoSession,

    #[error("too many open connections")]
    TooManyConnections,

    #[error("max retry exceeded")]
    MaxRetryExceeded,
}

/// Per-tunnel forwarding settings
#[derive(Debug, Clone, Copy)]
pub struct TunnelSettings {
    pub session: SessionConfig,
    /// Stream-open attempts per forwarded connection
    pub session_retry: usize,
    pub link_buffer: usize,
}

#[derive(Default)]
struct SessionSlot {
    session: Option<Session>,
    version: u64,
    closed: bool,
}

pub struct Tunnel {
    agent_hash: String,
    tunnel_hash: String,
    local_addr: Option<SocketAddr>,
    settings: TunnelSettings,
    tracker: Arc<dyn TunnelTracker>,
    slot: Mutex<SessionSlot>,
    listener: Mutex<Option<TunnelListener>>,
    conns: AtomicUsize,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("agent", &self.agent_hash)
            .field("tunnel", &self.tunnel_hash)
            .field("local_addr", &self.local_addr)
            .field("conns", &self.conns.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Reports `opened` to the tracker.
    pub fn new(
        agent_hash: impl Into<String>,
        tunnel_hash: impl Into<String>,
        listener: TunnelListener,
        settings: TunnelSettings,
        tracker: Arc<dyn TunnelTracker>,
    ) -> Self {
        tracker.opened();
        Self {
            agent_hash: agent_hash.into(),
            tunnel_hash: tunnel_hash.into(),
            local_addr: listener.local_addr().ok(),
            settings,
            tracker,
            slot: Mutex::new(SessionSlot::default()),
            listener: Mutex::new(Some(listener)),
            conns: AtomicUsize::new(0),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn agent_hash(&self) -> &str {
        &self.agent_hash
    }

    pub fn tunnel_hash(&self) -> &str {
        &self.tunnel_hash
    }

    /// Public address of the tunnel
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Forwarded connections currently linked
    pub fn active_conns(&self) -> usize {
        self.conns.load(Ordering::Acquire)
    }

    fn slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `io` as the tunnel's session.
    ///
    /// Returns false when the tunnel is closed or a live session is already
    /// installed; `io` is dropped in that case.
    pub fn new_session<T>(&self, io: T) -> bool
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut slot = self.slot();
        if slot.closed {
            debug!(tunnel = %self.tunnel_hash, "tunnel closed");
            return false;
        }
        if let Some(session) = &slot.session {
            if !session.is_closed() {
                return false;
            }
            debug!(tunnel = %self.tunnel_hash, "previous session already closed");
        }

        slot.session = Some(Session::server(io, &self.settings.session));
        slot.version = slot.version.wrapping_add(1);
        debug!(tunnel = %self.tunnel_hash, version = slot.version, "session installed");
        true
    }

    pub fn session_version(&self) -> u64 {
        self.slot().version
    }

    pub fn has_session(&self) -> bool {
        self.slot().session.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Drops the session if it is still the one observed at `version`.
    /// Returns the session and version now installed.
    fn invalidate_session(&self, version: u64) -> (Option<Session>, u64) {
        let mut slot = self.slot();
        if slot.version == version {
            slot.session = None;
        }
        (slot.session.clone(), slot.version)
    }

    /// Open a stream on the current session, retrying on a replaced session.
    ///
    /// Stream opening runs on a snapshot of the session; the slot lock is
    /// never held across it.
    pub async fn get_stream(&self, retry: usize) -> Result<VirtualStream, StreamError> {
        let (mut session, mut version) = {
            let slot = self.slot();
            (slot.session.clone(), slot.version)
        };

        for _ in 0..retry {
            let Some(current) = session else {
                self.tracker.on_error(&StreamError::NoSession.to_string());
                return Err(StreamError::NoSession);
            };

            match current.open_stream().await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_exhausted() => {
                    self.tracker
                        .on_error(&StreamError::TooManyConnections.to_string());
                    return Err(StreamError::TooManyConnections);
                }
                Err(e) => {
                    debug!(tunnel = %self.tunnel_hash, version, "open stream failed: {e}");
                    (session, version) = self.invalidate_session(version);
                }
            }
        }

        Err(StreamError::MaxRetryExceeded)
    }

    /// Accept loop. Returns once the tunnel is closed or the listener fails.
    pub async fn serve(self: Arc<Self>) -> io::Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            return Ok(());
        };

        let result = loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((conn, peer_addr)) => {
                    let tunnel = Arc::clone(&self);
                    self.tasks.spawn(async move {
                        let handled = AssertUnwindSafe(tunnel.handle_conn(conn, peer_addr))
                            .catch_unwind()
                            .await;
                        if handled.is_err() {
                            error!(tunnel = %tunnel.tunnel_hash, "forwarding task panicked");
                        }
                    });
                }
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        break Ok(());
                    }
                    break Err(e);
                }
            }
        };

        drop(listener);
        result
    }

    async fn handle_conn(&self, conn: BoxedStream, peer_addr: Option<SocketAddr>) {
        let _active = ActiveConn::enter(self);

        let stream = match self.get_stream(self.settings.session_retry).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(tunnel = %self.tunnel_hash, ?peer_addr, "Open stream failed: {}", e);
                return;
            }
        };

        let stream_id = stream.id();
        info!(tunnel = %self.tunnel_hash, stream_id, ?peer_addr, "Linking stream");
        let (bytes_in, bytes_out) = link_streams(conn, stream, self.settings.link_buffer).await;
        self.tracker.record_traffic(bytes_in, bytes_out);
        info!(tunnel = %self.tunnel_hash, stream_id, bytes_in, bytes_out, "Linked stream closed");
    }

    /// Stops accepting; in-flight connections keep running. Idempotent.
    pub fn close(&self) {
        {
            let mut slot = self.slot();
            if slot.closed {
                return;
            }
            slot.closed = true;
        }
        self.shutdown.cancel();
        drop(
            self.listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.tracker.closed();
    }

    pub fn is_closed(&self) -> bool {
        self.slot().closed
    }

    /// Wait for in-flight connections, then close the session.
    pub async fn wait_and_cleanup(&self) {
        self.tasks.close();
        self.tasks.wait().await;

        if let Some(session) = self.slot().session.take() {
            session.close();
        }
    }
}

/// Connection accounting for one forwarded connection
struct ActiveConn<'a> {
    tunnel: &'a Tunnel,
}

impl<'a> ActiveConn<'a> {
    fn enter(tunnel: &'a Tunnel) -> Self {
        tunnel.tracker.incr_conn();
        if tunnel.conns.fetch_add(1, Ordering::AcqRel) == 0 {
            tunnel.tracker.is_working();
        }
        Self { tunnel }
    }
}

impl Drop for ActiveConn<'_> {
    fn drop(&mut self) {
        self.tunnel.tracker.decr_conn();
        if self.tunnel.conns.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tunnel.tracker.is_idle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_common::config::RegistryConfig;
    use std::sync::atomic::AtomicU32;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[derive(Default)]
    struct Recorder {
        errors: Mutex<Vec<String>>,
        opened: AtomicU32,
        closed: AtomicU32,
        working: AtomicU32,
        idle: AtomicU32,
        traffic: Mutex<Vec<(u64, u64)>>,
    }

    impl TunnelTracker for Recorder {
        fn opened(&self) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }

        fn closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn is_working(&self) {
            self.working.fetch_add(1, Ordering::SeqCst);
        }

        fn is_idle(&self) {
            self.idle.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }

        fn record_traffic(&self, bytes_in: u64, bytes_out: u64) {
            self.traffic.lock().unwrap().push((bytes_in, bytes_out));
        }
    }

    fn settings() -> TunnelSettings {
        let config = RegistryConfig::default();
        TunnelSettings {
            session: config.session,
            session_retry: config.session_retry,
            link_buffer: config.link_buffer,
        }
    }

    async fn tunnel(tracker: Arc<Recorder>) -> Arc<Tunnel> {
        let listener = TunnelListener::bind_tcp("127.0.0.1:0").await.unwrap();
        Arc::new(Tunnel::new("agent", "tunnel", listener, settings(), tracker))
    }

    #[tokio::test]
    async fn test_one_live_session_at_a_time() {
        let tracker = Arc::new(Recorder::default());
        let tunnel = tunnel(Arc::clone(&tracker)).await;
        assert_eq!(tracker.opened.load(Ordering::SeqCst), 1);

        let (first, _peer1) = tokio::io::duplex(1024);
        let (second, _peer2) = tokio::io::duplex(1024);
        assert!(tunnel.new_session(first));
        assert!(!tunnel.new_session(second));
        assert_eq!(tunnel.session_version(), 1);
        assert!(tunnel.has_session());
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced() {
        let tunnel = tunnel(Arc::new(Recorder::default())).await;

        let (first, peer1) = tokio::io::duplex(1024);
        assert!(tunnel.new_session(first));
        drop(peer1);
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while tunnel.has_session() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let (second, _peer2) = tokio::io::duplex(1024);
        assert!(tunnel.new_session(second));
        assert_eq!(tunnel.session_version(), 2);
    }

    #[tokio::test]
    async fn test_stale_invalidate_keeps_newer_session() {
        let tunnel = tunnel(Arc::new(Recorder::default())).await;

        let (first, _peer1) = tokio::io::duplex(1024);
        assert!(tunnel.new_session(first));
        let stale = tunnel.session_version();

        // A newer session replaces the first one behind the caller's back
        tunnel.slot().session.as_ref().unwrap().close();
        let (second, _peer2) = tokio::io::duplex(1024);
        assert!(tunnel.new_session(second));

        let (session, version) = tunnel.invalidate_session(stale);
        assert!(session.is_some());
        assert_eq!(version, stale + 1);

        let (session, _) = tunnel.invalidate_session(version);
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn test_no_session_reports_error() {
        let tracker = Arc::new(Recorder::default());
        let tunnel = tunnel(Arc::clone(&tracker)).await;

        let err = tunnel.get_stream(2).await.unwrap_err();
        assert_eq!(err, StreamError::NoSession);
        assert_eq!(
            tracker.errors.lock().unwrap().as_slice(),
            ["local address may be not working"]
        );
    }

    #[tokio::test]
    async fn test_closed_session_exceeds_retry() {
        let tunnel = tunnel(Arc::new(Recorder::default())).await;
        let (first, _peer) = tokio::io::duplex(1024);
        assert!(tunnel.new_session(first));
        tunnel.slot().session.as_ref().unwrap().close();

        // First attempt fails and invalidates; nothing newer is installed
        let err = tunnel.get_stream(2).await.unwrap_err();
        assert_eq!(err, StreamError::NoSession);
    }

    #[tokio::test]
    async fn test_forwards_and_accounts_connection() {
        let tracker = Arc::new(Recorder::default());
        let tunnel = tunnel(Arc::clone(&tracker)).await;
        let addr = tunnel.local_addr().unwrap();

        let (io, agent_io) = tokio::io::duplex(64 * 1024);
        assert!(tunnel.new_session(io));
        let agent = Session::client(agent_io, &SessionConfig::default());
        tokio::spawn(async move {
            let mut stream = agent.accept_stream().await.unwrap();
            let mut buf = vec![0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"world").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let serving = tokio::spawn(Arc::clone(&tunnel).serve());

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut reply = Vec::new();
        conn.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"world");
        drop(conn);

        tunnel.close();
        tunnel.close();
        serving.await.unwrap().unwrap();
        tunnel.wait_and_cleanup().await;

        assert_eq!(tracker.traffic.lock().unwrap().as_slice(), [(5, 5)]);
        assert_eq!(tracker.working.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.idle.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.closed.load(Ordering::SeqCst), 1);
        assert!(!tunnel.new_session(tokio::io::duplex(8).0));
    }
}
