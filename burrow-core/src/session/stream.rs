//! Virtual stream over a multiplexed session
//!
//! Each direction of a stream is credit-limited: a writer may have at most
//! [`STREAM_WINDOW`] bytes unacknowledged, and the reader returns credit with
//! `WindowUpdate` frames as the application consumes data. The session reader
//! therefore never waits on a slow stream.

use super::limits::StreamSlot;
use burrow_protocol::constants::{MAX_DATA_PAYLOAD, STREAM_WINDOW};
use burrow_protocol::Frame;
use bytes::{Buf, Bytes};
use dashmap::DashMap;
use futures::task::AtomicWaker;
use kanal::{AsyncReceiver, AsyncSender, ReceiveError, SendError};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What the session reader hands to one stream
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Fin,
    Reset,
}

/// Flow-control state shared by a stream and the session reader
#[derive(Debug)]
pub(crate) struct StreamShared {
    /// Bytes this end may still send
    credit: AtomicUsize,
    credit_waker: AtomicWaker,
    /// Bytes received and not yet granted back to the peer
    unacked: AtomicUsize,
    reset: AtomicBool,
}

impl StreamShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            credit: AtomicUsize::new(STREAM_WINDOW as usize),
            credit_waker: AtomicWaker::new(),
            unacked: AtomicUsize::new(0),
            reset: AtomicBool::new(false),
        })
    }

    pub(crate) fn grant(&self, credit: u32) {
        self.credit.fetch_add(credit as usize, Ordering::AcqRel);
        self.credit_waker.wake();
    }

    /// Account for `len` inbound bytes. `false` when the peer overran the window.
    pub(crate) fn receive(&self, len: usize) -> bool {
        self.unacked.fetch_add(len, Ordering::AcqRel) + len <= STREAM_WINDOW as usize
    }

    /// Wake a writer waiting for credit; its next write fails
    pub(crate) fn reset(&self) {
        self.reset.store(true, Ordering::Release);
        self.credit_waker.wake();
    }

    fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }
}

/// Session reader's view of one live stream
#[derive(Debug, Clone)]
pub(crate) struct StreamEntry {
    pub(crate) events: AsyncSender<StreamEvent>,
    pub(crate) shared: Arc<StreamShared>,
}

pub(crate) type StreamMap = Arc<DashMap<u32, StreamEntry>>;

/// Frame queues a stream writes into
#[derive(Debug, Clone)]
pub(crate) struct FrameQueues {
    /// Bounded, ordered with data
    pub(crate) data: AsyncSender<Frame>,
    /// Unbounded, drained first by the writer; never loses a frame
    pub(crate) control: AsyncSender<Frame>,
}

impl FrameQueues {
    /// Queue a frame that must not be lost.
    ///
    /// Keeps order with data when the data queue has room; otherwise jumps it.
    pub(crate) fn send_reset(&self, stream_id: u32) {
        let frame = Frame::Reset { stream_id };
        if !matches!(self.data.try_send(frame.clone()), Ok(true)) {
            let _ = self.control.try_send(frame);
        }
    }
}

type RecvFuture = Pin<Box<dyn Future<Output = Result<StreamEvent, ReceiveError>> + Send>>;
type SendFuture = Pin<Box<dyn Future<Output = Result<(), SendError>> + Send>>;

/// One logical byte stream of a [`Session`](super::Session).
///
/// Implements `AsyncRead` + `AsyncWrite`. `shutdown` half-closes the stream;
/// dropping it before both directions finished resets it on the peer.
pub struct VirtualStream {
    id: u32,
    rx: AsyncReceiver<StreamEvent>,
    queues: FrameQueues,
    shared: Arc<StreamShared>,
    streams: StreamMap,
    read_buf: Bytes,
    /// Bytes handed to the caller since the last window update
    consumed: usize,
    read_closed: bool,
    write_closed: bool,
    pending_recv: Option<RecvFuture>,
    /// In-flight data frame and the number of caller bytes it carries
    pending_send: Option<(SendFuture, usize)>,
    pending_fin: Option<SendFuture>,
    _slot: StreamSlot,
}

impl std::fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStream")
            .field("id", &self.id)
            .field("buffered", &self.read_buf.len())
            .field("read_closed", &self.read_closed)
            .field("write_closed", &self.write_closed)
            .finish_non_exhaustive()
    }
}

impl VirtualStream {
    pub(crate) fn new(
        id: u32,
        rx: AsyncReceiver<StreamEvent>,
        queues: FrameQueues,
        shared: Arc<StreamShared>,
        streams: StreamMap,
        slot: StreamSlot,
    ) -> Self {
        Self {
            id,
            rx,
            queues,
            shared,
            streams,
            read_buf: Bytes::new(),
            consumed: 0,
            read_closed: false,
            write_closed: false,
            pending_recv: None,
            pending_send: None,
            pending_fin: None,
            _slot: slot,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn broken_pipe() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "session closed")
    }

    /// Return credit to the peer once half the window has been read
    fn consume(&mut self, len: usize) {
        self.consumed += len;
        if self.consumed < STREAM_WINDOW as usize / 2 {
            return;
        }
        let credit = std::mem::take(&mut self.consumed);
        self.shared.unacked.fetch_sub(credit, Ordering::AcqRel);
        let _ = self.queues.control.try_send(Frame::WindowUpdate {
            stream_id: self.id,
            credit: u32::try_from(credit).unwrap_or(STREAM_WINDOW),
        });
    }

    /// Credit available for the next frame, registering for a wakeup when none
    fn poll_credit(&self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        for _ in 0..2 {
            if self.shared.is_reset() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream reset",
                )));
            }
            let credit = self.shared.credit.load(Ordering::Acquire);
            if credit > 0 {
                return Poll::Ready(Ok(credit));
            }
            self.shared.credit_waker.register(cx.waker());
        }
        Poll::Pending
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.streams.remove(&self.id);
        if !(self.read_closed && self.write_closed) {
            self.queues.send_reset(self.id);
        }
    }
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.read_buf.is_empty() {
            let len = buf.remaining().min(this.read_buf.len());
            buf.put_slice(&this.read_buf[..len]);
            this.read_buf.advance(len);
            this.consume(len);
            return Poll::Ready(Ok(()));
        }

        if this.read_closed {
            return Poll::Ready(Ok(()));
        }

        let fut = this.pending_recv.get_or_insert_with(|| {
            let rx = this.rx.clone();
            Box::pin(async move { rx.recv().await })
        });

        let event = match fut.as_mut().poll(cx) {
            Poll::Ready(event) => event,
            Poll::Pending => return Poll::Pending,
        };
        this.pending_recv = None;

        match event {
            Ok(StreamEvent::Data(mut data)) => {
                let len = buf.remaining().min(data.len());
                buf.put_slice(&data[..len]);
                data.advance(len);
                this.read_buf = data;
                this.consume(len);
                Poll::Ready(Ok(()))
            }
            Ok(StreamEvent::Fin) => {
                this.read_closed = true;
                Poll::Ready(Ok(()))
            }
            Ok(StreamEvent::Reset) => {
                this.read_closed = true;
                this.write_closed = true;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream reset by peer",
                )))
            }
            Err(_) => {
                this.read_closed = true;
                this.write_closed = true;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "session closed",
                )))
            }
        }
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let Some((fut, len)) = this.pending_send.as_mut() {
            let len = *len;
            return match fut.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    this.pending_send = None;
                    match result {
                        Ok(()) => Poll::Ready(Ok(len)),
                        Err(_) => {
                            this.write_closed = true;
                            Poll::Ready(Err(Self::broken_pipe()))
                        }
                    }
                }
                Poll::Pending => Poll::Pending,
            };
        }

        if this.write_closed {
            return Poll::Ready(Err(Self::broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let credit = match this.poll_credit(cx) {
            Poll::Ready(Ok(credit)) => credit,
            Poll::Ready(Err(e)) => {
                this.write_closed = true;
                return Poll::Ready(Err(e));
            }
            Poll::Pending => return Poll::Pending,
        };
        let len = buf.len().min(MAX_DATA_PAYLOAD).min(credit);
        // Only this stream takes credit; the session reader only adds it
        this.shared.credit.fetch_sub(len, Ordering::AcqRel);

        let frame = Frame::Data {
            stream_id: this.id,
            data: Bytes::copy_from_slice(&buf[..len]),
        };
        let tx = this.queues.data.clone();
        let mut fut: SendFuture = Box::pin(async move { tx.send(frame).await });

        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(len)),
            Poll::Ready(Err(_)) => {
                this.write_closed = true;
                Poll::Ready(Err(Self::broken_pipe()))
            }
            Poll::Pending => {
                this.pending_send = Some((fut, len));
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some((fut, _)) = this.pending_send.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    this.pending_send = None;
                    if result.is_err() {
                        this.write_closed = true;
                        return Poll::Ready(Err(Self::broken_pipe()));
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_closed && self.pending_fin.is_none() {
            return Poll::Ready(Ok(()));
        }
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }

        let this = self.get_mut();
        let fut = this.pending_fin.get_or_insert_with(|| {
            let tx = this.queues.data.clone();
            let frame = Frame::Fin { stream_id: this.id };
            Box::pin(async move { tx.send(frame).await })
        });

        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                this.pending_fin = None;
                this.write_closed = true;
                Poll::Ready(result.map_err(|_| Self::broken_pipe()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
