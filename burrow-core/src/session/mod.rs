//! Stream multiplexing over one tunnel connection
//!
//! A [`Session`] carries many [`VirtualStream`]s over a single connection
//! using session [`Frame`]s. The broker side holds the server role and opens
//! one stream per forwarded user connection; the agent side holds the client
//! role and accepts them.

mod limits;
mod stream;
mod writer;

pub use limits::{StreamLimit, StreamSlot};
pub use stream::VirtualStream;

use burrow_common::config::SessionConfig;
use burrow_common::TunnelError;
use burrow_protocol::{Frame, FrameCodec};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use kanal::{bounded_async, unbounded_async, AsyncReceiver, AsyncSender};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use stream::{FrameQueues, StreamEntry, StreamEvent, StreamMap, StreamShared};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which end of the tunnel connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Agent side; opens odd stream ids
    Client,
    /// Broker side; opens even stream ids
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` was allocated by the other end
    fn is_peer_id(self, id: u32) -> bool {
        match self {
            Role::Client => id != 0 && id % 2 == 0,
            Role::Server => id % 2 == 1,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("maximum streams per session reached ({max})")]
    StreamsExhausted { max: usize },
}

impl SessionError {
    /// Exhaustion is transient; the session is still alive.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, SessionError::StreamsExhausted { .. })
    }
}

impl From<SessionError> for TunnelError {
    fn from(err: SessionError) -> Self {
        TunnelError::Session(err.to_string())
    }
}

struct Inner {
    role: Role,
    streams: StreamMap,
    next_id: AtomicU32,
    queues: FrameQueues,
    accept_rx: AsyncReceiver<VirtualStream>,
    limit: StreamLimit,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Multiplexed session. Cheap to clone; the connection closes when
/// [`Session::close`] is called, the peer goes away or the last clone drops.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("streams", &self.inner.streams.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub fn new<T>(io: T, role: Role, config: &SessionConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (frame_tx, frame_rx) = bounded_async(config.write_queue.max(1));
        let (control_tx, control_rx) = unbounded_async();
        let queues = FrameQueues {
            data: frame_tx,
            control: control_tx,
        };
        let (accept_tx, accept_rx) = bounded_async(config.accept_backlog.max(1));
        let streams: StreamMap = Arc::new(DashMap::new());
        let limit = StreamLimit::new(config.max_streams);
        let shutdown = CancellationToken::new();

        tokio::spawn(writer::run_frame_writer(
            control_rx,
            frame_rx,
            write_half,
            shutdown.clone(),
        ));

        let reader = FrameReader {
            role,
            streams: Arc::clone(&streams),
            queues: queues.clone(),
            accept_tx,
            limit: limit.clone(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(reader.run(FramedRead::new(read_half, FrameCodec::new())));

        Self {
            inner: Arc::new(Inner {
                role,
                streams,
                next_id: AtomicU32::new(role.first_stream_id()),
                queues,
                accept_rx,
                limit,
                shutdown,
            }),
        }
    }

    pub fn client<T>(io: T, config: &SessionConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Client, config)
    }

    pub fn server<T>(io: T, config: &SessionConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Server, config)
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Open a stream towards the peer.
    ///
    /// Fails with [`SessionError::StreamsExhausted`] while the local stream
    /// limit is reached; the session itself stays usable.
    pub async fn open_stream(&self) -> Result<VirtualStream, SessionError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SessionError::Closed);
        }

        let slot = inner
            .limit
            .try_reserve()
            .ok_or(SessionError::StreamsExhausted {
                max: inner.limit.max_streams(),
            })?;
        let id = inner.next_id.fetch_add(2, Ordering::Relaxed);

        let (events, rx) = unbounded_async();
        let shared = StreamShared::new();
        inner.streams.insert(
            id,
            StreamEntry {
                events,
                shared: Arc::clone(&shared),
            },
        );
        let stream = VirtualStream::new(
            id,
            rx,
            inner.queues.clone(),
            shared,
            Arc::clone(&inner.streams),
            slot,
        );

        // Same queue as resets, so a reset never overtakes its open
        match inner.queues.control.try_send(Frame::Open { stream_id: id }) {
            Ok(true) => Ok(stream),
            _ => Err(SessionError::Closed),
        }
    }

    /// Wait for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<VirtualStream, SessionError> {
        tokio::select! {
            biased;
            () = self.inner.shutdown.cancelled() => Err(SessionError::Closed),
            stream = self.inner.accept_rx.recv() => stream.map_err(|_| SessionError::Closed),
        }
    }

    /// Number of live streams in both directions
    pub fn num_streams(&self) -> usize {
        self.inner.streams.len()
    }

    /// Closes the underlying connection. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }
}

/// Routes inbound frames to their streams. Never waits on a stream.
struct FrameReader {
    role: Role,
    streams: StreamMap,
    queues: FrameQueues,
    accept_tx: AsyncSender<VirtualStream>,
    limit: StreamLimit,
    shutdown: CancellationToken,
}

impl FrameReader {
    async fn run<R>(self, mut frames: FramedRead<R, FrameCodec>)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                () = self.shutdown.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!("session read failed: {e}");
                        break;
                    }
                    None => break,
                },
            };

            match frame {
                Frame::Open { stream_id } => self.on_open(stream_id),
                Frame::Data { stream_id, data } => {
                    if !data.is_empty() {
                        self.on_data(stream_id, data);
                    }
                }
                Frame::Fin { stream_id } => self.deliver(stream_id, StreamEvent::Fin),
                Frame::Reset { stream_id } => {
                    if let Some((_, entry)) = self.streams.remove(&stream_id) {
                        entry.shared.reset();
                        let _ = entry.events.try_send(StreamEvent::Reset);
                    }
                }
                Frame::WindowUpdate { stream_id, credit } => {
                    if let Some(entry) = self.streams.get(&stream_id) {
                        entry.shared.grant(credit);
                    }
                }
            }
        }

        self.shutdown.cancel();
        for entry in self.streams.iter() {
            entry.shared.reset();
        }
        self.streams.clear();
    }

    fn on_open(&self, stream_id: u32) {
        if !self.role.is_peer_id(stream_id) {
            warn!(stream_id, "peer opened a stream with a local id");
            self.queues.send_reset(stream_id);
            return;
        }

        let Some(slot) = self.limit.try_reserve() else {
            debug!(stream_id, "refusing stream: limit reached");
            self.queues.send_reset(stream_id);
            return;
        };

        let (events, rx) = unbounded_async();
        let shared = StreamShared::new();
        match self.streams.entry(stream_id) {
            Entry::Occupied(_) => {
                warn!(stream_id, "stream already exists");
                return;
            }
            Entry::Vacant(entry) => {
                entry.insert(StreamEntry {
                    events,
                    shared: Arc::clone(&shared),
                });
            }
        }

        let stream = VirtualStream::new(
            stream_id,
            rx,
            self.queues.clone(),
            shared,
            Arc::clone(&self.streams),
            slot,
        );
        // A full backlog drops the stream, which resets it on the peer
        if !matches!(self.accept_tx.try_send(stream), Ok(true)) {
            debug!(stream_id, "accept backlog full");
        }
    }

    fn on_data(&self, stream_id: u32, data: Bytes) {
        let Some(entry) = self.streams.get(&stream_id).map(|r| r.clone()) else {
            return;
        };
        if entry.shared.receive(data.len()) {
            self.deliver(stream_id, StreamEvent::Data(data));
            return;
        }

        warn!(stream_id, "peer overran the stream window");
        self.streams.remove(&stream_id);
        entry.shared.reset();
        let _ = entry.events.try_send(StreamEvent::Reset);
        self.queues.send_reset(stream_id);
    }

    fn deliver(&self, stream_id: u32, event: StreamEvent) {
        let Some(events) = self.streams.get(&stream_id).map(|r| r.events.clone()) else {
            return;
        };
        if !matches!(events.try_send(event), Ok(true)) {
            self.streams.remove(&stream_id);
        }
    }
}
