//! Connection pump
//!
//! Turns one raw connection into a bounded inbound queue, a bounded outbound
//! queue and an error slot. A read task and a write task own the two halves
//! of the connection; closing the pump stops both and drops the connection.
//!
//! Errors posted while the pump is still open are transient (see
//! [`PumpError::is_transient`]). Every other error is posted after the pump
//! has closed and is fatal for this connection.

use burrow_common::config::PumpConfig;
use burrow_common::TunnelError;
use burrow_protocol::{Message, MessageCodec, ProtocolError};
use futures::{FutureExt, SinkExt, StreamExt};
use kanal::{bounded_async, AsyncReceiver, AsyncSender};
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PumpError {
    /// A read deadline expired with nothing buffered and the pump stayed open
    #[error("read deadline expired while idle")]
    Idle,

    #[error("read deadline expired")]
    ReadTimeout,

    #[error("write deadline expired")]
    WriteTimeout,

    #[error("connection closed by peer")]
    Eof,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection pump closed")]
    Closed,

    /// A pump task panicked; the panic is contained and reported here
    #[error("connection pump fault: {0}")]
    Fault(String),
}

impl PumpError {
    /// Transient errors leave the current connection usable.
    pub fn is_transient(&self) -> bool {
        matches!(self, PumpError::Idle)
    }
}

impl From<PumpError> for TunnelError {
    fn from(err: PumpError) -> Self {
        match err {
            PumpError::Protocol(e) => TunnelError::Protocol(e),
            PumpError::ReadTimeout | PumpError::WriteTimeout | PumpError::Idle => {
                TunnelError::Timeout(err.to_string())
            }
            other => TunnelError::Connection(other.to_string()),
        }
    }
}

struct Shared {
    closed: AtomicBool,
    done: CancellationToken,
    errors: AsyncSender<PumpError>,
}

impl Shared {
    /// Returns true only for the call that actually closed the pump
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.done.cancel();
        true
    }

    fn report(&self, err: PumpError) {
        let _ = self.errors.try_send(err);
    }

    /// Post first so the owner finds the error once it sees the pump closed
    fn fail(&self, err: PumpError) {
        self.report(err);
        self.close();
    }
}

/// Typed queues over one control connection.
///
/// Dropping the pump closes it.
pub struct MessagePump {
    inbound: AsyncReceiver<Message>,
    outbound: AsyncSender<Message>,
    errors: AsyncReceiver<PumpError>,
    shared: Arc<Shared>,
    peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for MessagePump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePump")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MessagePump {
    /// Spawn the read and write loops over `stream`.
    pub fn start<S>(stream: S, config: &PumpConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (inbound_tx, inbound) = bounded_async(config.queue_capacity);
        let (outbound, outbound_rx) = bounded_async(config.queue_capacity);
        let (errors_tx, errors) = bounded_async(config.error_capacity.max(2));

        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            done: CancellationToken::new(),
            errors: errors_tx,
        });

        let (reader, writer) = tokio::io::split(stream);
        let frames = FramedRead::new(reader, MessageCodec::new());
        let sink = FramedWrite::new(writer, MessageCodec::new());

        supervise(
            Arc::clone(&shared),
            "read",
            read_loop(frames, inbound_tx, Arc::clone(&shared), *config),
        );
        supervise(
            Arc::clone(&shared),
            "write",
            write_loop(sink, outbound_rx, Arc::clone(&shared), *config),
        );

        Self {
            inbound,
            outbound,
            errors,
            shared,
            peer_addr: None,
        }
    }

    #[must_use]
    pub fn with_peer_addr(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Next inbound message, or the error that ended the pump.
    ///
    /// Transient errors are returned as they are posted; the pump stays open.
    pub async fn recv(&self) -> Result<Message, PumpError> {
        tokio::select! {
            biased;
            message = self.inbound.recv() => match message {
                Ok(message) => Ok(message),
                Err(_) => Err(self.next_error().await),
            },
            err = self.errors.recv() => Err(err.unwrap_or(PumpError::Closed)),
        }
    }

    /// Queue a message, waiting for room in the outbound queue.
    pub async fn send(&self, message: impl Into<Message>) -> Result<(), PumpError> {
        if self.is_closed() {
            return Err(PumpError::Closed);
        }
        self.outbound
            .send(message.into())
            .await
            .map_err(|_| PumpError::Closed)
    }

    /// Queue a message without waiting. Returns false if the queue is full.
    pub fn try_send(&self, message: impl Into<Message>) -> Result<bool, PumpError> {
        if self.is_closed() {
            return Err(PumpError::Closed);
        }
        self.outbound
            .try_send(message.into())
            .map_err(|_| PumpError::Closed)
    }

    /// Clone of the outbound queue for responders running on other tasks
    pub fn sender(&self) -> AsyncSender<Message> {
        self.outbound.clone()
    }

    /// Drain one posted error without waiting
    pub fn try_error(&self) -> Option<PumpError> {
        self.errors.try_recv().ok().flatten()
    }

    /// Wait for the next posted error. Resolves to `Closed` when the pump
    /// was closed without a posted cause.
    pub async fn next_error(&self) -> PumpError {
        tokio::select! {
            biased;
            err = self.errors.recv() => err.unwrap_or(PumpError::Closed),
            () = self.shared.done.cancelled() => self.try_error().unwrap_or(PumpError::Closed),
        }
    }

    /// Idempotent.
    pub fn close(&self) {
        if self.shared.close() {
            debug!(peer_addr = ?self.peer_addr, "connection pump closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Resolves once the pump has closed
    pub async fn closed(&self) {
        self.shared.done.cancelled().await;
    }
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Run one pump loop, converting its error or panic into a posted error.
fn supervise<F>(shared: Arc<Shared>, name: &'static str, task: F)
where
    F: Future<Output = Result<(), PumpError>> + Send + 'static,
{
    tokio::spawn(async move {
        let err = match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(())) => {
                shared.close();
                return;
            }
            Ok(Err(err)) => err,
            Err(panic) => PumpError::Fault(panic_message(panic.as_ref())),
        };
        debug!(pump_loop = name, error = %err, "connection pump loop stopped");
        shared.fail(err);
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn read_loop<R>(
    mut frames: FramedRead<R, MessageCodec>,
    inbound: AsyncSender<Message>,
    shared: Arc<Shared>,
    config: PumpConfig,
) -> Result<(), PumpError>
where
    R: AsyncRead + Unpin,
{
    let mut idle_reads = 0u32;

    loop {
        let next = tokio::select! {
            () = shared.done.cancelled() => return Ok(()),
            next = timeout(config.read_timeout, frames.next()) => next,
        };

        let message = match next {
            Err(_) => {
                // A partially received message is never idle
                if frames.read_buffer().is_empty() && idle_reads < config.idle_reads_allowed {
                    idle_reads += 1;
                    shared.report(PumpError::Idle);
                    continue;
                }
                return Err(PumpError::ReadTimeout);
            }
            Ok(None) => return Err(PumpError::Eof),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(message))) => message,
        };
        idle_reads = 0;

        tokio::select! {
            () = shared.done.cancelled() => return Ok(()),
            sent = inbound.send(message) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, MessageCodec>,
    outbound: AsyncReceiver<Message>,
    shared: Arc<Shared>,
    config: PumpConfig,
) -> Result<(), PumpError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            () = shared.done.cancelled() => return Ok(()),
            message = outbound.recv() => match message {
                Ok(message) => message,
                Err(_) => return Ok(()),
            },
        };

        match timeout(config.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(PumpError::WriteTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_protocol::{read_message, write_message, PingRequest, PingResponse};
    use std::time::Duration;

    fn config() -> PumpConfig {
        PumpConfig {
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(200),
            ..PumpConfig::default()
        }
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let pump = MessagePump::start(local, &config());

        pump.send(PingRequest).await.unwrap();
        let got = read_message(&mut remote).await.unwrap();
        assert_eq!(got, Message::PingRequest(PingRequest));

        write_message(&mut remote, &PingResponse.into()).await.unwrap();
        let got = pump.recv().await.unwrap();
        assert_eq!(got, Message::PingResponse(PingResponse));
        assert!(!pump.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_is_fatal() {
        let (local, remote) = tokio::io::duplex(4096);
        let pump = MessagePump::start(local, &config());
        drop(remote);

        let err = pump.recv().await.unwrap_err();
        assert!(matches!(err, PumpError::Eof));
        assert!(!err.is_transient());
        assert!(pump.is_closed());
    }

    #[tokio::test]
    async fn test_idle_deadline_fatal_by_default() {
        let (local, _remote) = tokio::io::duplex(4096);
        let pump = MessagePump::start(local, &config());

        let err = pump.recv().await.unwrap_err();
        assert!(matches!(err, PumpError::ReadTimeout));
        assert!(pump.is_closed());
    }

    #[tokio::test]
    async fn test_tolerated_idle_deadline_is_transient() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let pump = MessagePump::start(
            local,
            &PumpConfig {
                idle_reads_allowed: 1,
                ..config()
            },
        );

        let err = pump.recv().await.unwrap_err();
        assert!(err.is_transient());
        assert!(!pump.is_closed());

        // The connection is still usable after a transient error
        write_message(&mut remote, &PingResponse.into()).await.unwrap();
        assert!(pump.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (local, _remote) = tokio::io::duplex(4096);
        let pump = MessagePump::start(local, &config());

        pump.close();
        pump.close();
        assert!(pump.is_closed());
        assert!(matches!(pump.send(PingRequest).await, Err(PumpError::Closed)));
        assert!(matches!(pump.next_error().await, PumpError::Closed));
    }

    #[tokio::test]
    async fn test_garbage_is_protocol_error() {
        use tokio::io::AsyncWriteExt;

        let (local, mut remote) = tokio::io::duplex(4096);
        let pump = MessagePump::start(local, &config());
        remote.write_all(&[0, 1, 250]).await.unwrap();

        let err = pump.recv().await.unwrap_err();
        assert!(matches!(err, PumpError::Protocol(_)));
        assert!(pump.is_closed());
    }
}
