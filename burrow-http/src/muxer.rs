//! HTTP virtual-host muxer
//!
//! One shared listener for every HTTP tunnel. Each connection's request head
//! is parsed to find the Host header; `<subdomain>.<domain>` selects the
//! per-subdomain queue the connection is delivered to. Unknown subdomains get
//! a 404.

use crate::replay::ReplayStream;
use burrow_common::config::MuxerConfig;
use burrow_core::transport::{deadline, socket_tuning};
use bytes::{Bytes, BytesMut};
use kanal::{bounded_async, AsyncReceiver, AsyncSender};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum MuxerError {
    #[error("listener already closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-subdomain accept queue
struct Route {
    tx: AsyncSender<ReplayStream>,
    rx: AsyncReceiver<ReplayStream>,
    /// Set before the queue is drained; deliveries check it first
    draining: AtomicBool,
    done: CancellationToken,
}

impl Route {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded_async(capacity.max(1));
        Self {
            tx,
            rx,
            draining: AtomicBool::new(false),
            done: CancellationToken::new(),
        }
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Stop taking connections and drop whatever is still queued
    fn drain(&self) {
        self.draining.store(true, Ordering::Release);
        self.done.cancel();
        while let Ok(Some(conn)) = self.rx.try_recv() {
            drop(conn);
        }
        let _ = self.rx.close();
    }
}

struct MuxerInner {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: MuxerConfig,
    domain_suffix: String,
    routes: Mutex<HashMap<String, Arc<Route>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl MuxerInner {
    fn routes(&self) -> MutexGuard<'_, HashMap<String, Arc<Route>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unlisten(&self, subdomain: &str, route: &Arc<Route>) {
        let mut routes = self.routes();
        if routes
            .get(subdomain)
            .is_some_and(|current| Arc::ptr_eq(current, route))
        {
            routes.remove(subdomain);
        }
    }

    fn cleanup(&self) {
        self.closed.store(true, Ordering::Release);
        let routes: Vec<Arc<Route>> = self.routes().drain().map(|(_, r)| r).collect();
        for route in routes {
            route.drain();
        }
    }
}

/// Shared HTTP listener routing by Host header. Cheap to clone.
#[derive(Clone)]
pub struct HttpMuxer {
    inner: Arc<MuxerInner>,
}

impl std::fmt::Debug for HttpMuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMuxer")
            .field("local_addr", &self.inner.local_addr)
            .field("domain", &self.inner.config.domain)
            .finish_non_exhaustive()
    }
}

impl HttpMuxer {
    pub async fn bind(addr: &str, config: MuxerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let domain_suffix = format!(".{}", config.domain.to_ascii_lowercase());

        Ok(Self {
            inner: Arc::new(MuxerInner {
                listener,
                local_addr,
                config,
                domain_suffix,
                routes: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn domain(&self) -> &str {
        &self.inner.config.domain
    }

    /// Accept loop. Every registered subdomain is drained when it returns.
    pub async fn serve(&self) -> io::Result<()> {
        info!(addr = %self.inner.local_addr, domain = %self.inner.config.domain, "HTTP muxer listening");

        let result = loop {
            let accepted = tokio::select! {
                () = self.inner.shutdown.cancelled() => break Ok(()),
                accepted = self.inner.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    socket_tuning::tune_silent(&stream);
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move { handle_conn(inner, stream, peer_addr).await });
                }
                Err(e) => {
                    if self.inner.shutdown.is_cancelled() {
                        break Ok(());
                    }
                    break Err(e);
                }
            }
        };

        self.inner.cleanup();
        result
    }

    /// Queue for `subdomain`, created on first use.
    pub fn listen(&self, subdomain: &str) -> Result<VhostListener, MuxerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MuxerError::Closed);
        }

        let key = subdomain.to_ascii_lowercase();
        let mut routes = self.inner.routes();
        let route = match routes.get(&key) {
            Some(route) if !route.is_draining() => Arc::clone(route),
            _ => {
                let route = Arc::new(Route::new(self.inner.config.queue_capacity));
                routes.insert(key.clone(), Arc::clone(&route));
                route
            }
        };
        drop(routes);

        Ok(VhostListener {
            subdomain: key,
            route,
            muxer: Arc::clone(&self.inner),
        })
    }

    /// Remove the queue for `subdomain` and drop its pending connections.
    pub fn unlisten(&self, subdomain: &str) {
        let removed = self.inner.routes().remove(&subdomain.to_ascii_lowercase());
        if let Some(route) = removed {
            route.drain();
        }
    }

    pub fn is_listening(&self, subdomain: &str) -> bool {
        self.inner
            .routes()
            .get(&subdomain.to_ascii_lowercase())
            .is_some_and(|route| !route.is_draining())
    }

    /// Stop accepting and drain every queue. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.cleanup();
    }
}

/// Accept side of one subdomain. Dropping it unregisters the subdomain.
pub struct VhostListener {
    subdomain: String,
    route: Arc<Route>,
    muxer: Arc<MuxerInner>,
}

impl std::fmt::Debug for VhostListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VhostListener")
            .field("subdomain", &self.subdomain)
            .finish_non_exhaustive()
    }
}

impl VhostListener {
    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    /// Shared muxer address
    pub fn local_addr(&self) -> SocketAddr {
        self.muxer.local_addr
    }

    pub async fn accept(&self) -> Result<ReplayStream, MuxerError> {
        tokio::select! {
            biased;
            () = self.route.done.cancelled() => Err(MuxerError::Closed),
            conn = self.route.rx.recv() => conn.map_err(|_| MuxerError::Closed),
        }
    }

    pub fn close(&self) {
        if self.route.is_draining() {
            return;
        }
        self.muxer.unlisten(&self.subdomain, &self.route);
        self.route.drain();
    }
}

impl Drop for VhostListener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn handle_conn(inner: Arc<MuxerInner>, mut stream: TcpStream, peer_addr: SocketAddr) {
    let config = &inner.config;

    let head = match deadline(
        config.read_timeout,
        read_head(&mut stream, config.max_head_bytes),
    )
    .await
    {
        Ok(head) => head,
        Err(e) => {
            if e.kind() != io::ErrorKind::UnexpectedEof {
                debug!(peer_addr = %peer_addr, "Failed to read request: {e}");
            }
            return;
        }
    };

    let subdomain = subdomain_of(&head.host, &inner.domain_suffix);
    let route = inner.routes().get(&subdomain).cloned();

    if let Some(route) = route.filter(|route| !route.is_draining()) {
        let conn = ReplayStream::new(head.bytes, stream);
        match tokio::time::timeout(config.deliver_timeout, route.tx.send(conn)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                debug!(peer_addr = %peer_addr, subdomain = %subdomain, "tunnel did not take connection");
            }
        }
        return;
    }

    let response = not_found(&subdomain, head.version);
    let written = deadline(config.write_timeout, async {
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    })
    .await;
    if let Err(e) = written {
        warn!(peer_addr = %peer_addr, "Failed to write error response: {e}");
    }
}

/// Buffered request head of one HTTP/1.x request
#[derive(Debug)]
struct RequestHead {
    bytes: Bytes,
    host: String,
    version: u8,
}

/// Read until one complete request head is buffered. Body bytes that arrive
/// with it stay in the buffer.
async fn read_head(stream: &mut TcpStream, max_bytes: usize) -> io::Result<RequestHead> {
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                let host = request
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("host"))
                    .map(|h| String::from_utf8_lossy(h.value).into_owned())
                    .unwrap_or_default();
                let version = request.version.unwrap_or(1);
                return Ok(RequestHead {
                    bytes: buf.freeze(),
                    host,
                    version,
                });
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() >= max_bytes {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "request head too large",
                    ));
                }
            }
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

/// `Host` value → routing key: port removed, lowercased, domain suffix removed
fn subdomain_of(host: &str, domain_suffix: &str) -> String {
    let host = host.trim();
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    };
    let host = host.to_ascii_lowercase();
    match host.strip_suffix(domain_suffix) {
        Some(sub) => sub.to_string(),
        None => host,
    }
}

fn not_found(subdomain: &str, version: u8) -> String {
    let body = format!("No such tunnel: {subdomain}");
    format!(
        "HTTP/1.{version} 404 Not Found\r\nContent-Length: {}\r\nContent-Type: text/plain; charset=utf-8\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}
