//! Batched frame writer
//!
//! Drains whatever is already queued behind the first frame and writes the
//! batch with one `write_all` + `flush`. Control frames (resets, window
//! updates) go ahead of queued data.

use burrow_protocol::{Frame, FrameCodec};
use bytes::BytesMut;
use kanal::AsyncReceiver;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_BATCH: usize = 32;

/// Write queued frames until the data queue closes, the writer fails or
/// `cancel` fires. A write failure cancels the session.
pub(crate) async fn run_frame_writer<W>(
    control: AsyncReceiver<Frame>,
    frames: AsyncReceiver<Frame>,
    mut writer: W,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(16 * 1024);

    loop {
        let first = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = control.recv() => match frame {
                Ok(frame) => frame,
                Err(_) => break,
            },
            frame = frames.recv() => match frame {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };

        buf.clear();
        encode(&mut codec, first, &mut buf);

        let mut batched = 1;
        while batched < MAX_BATCH {
            let next = match control.try_recv() {
                Ok(Some(frame)) => frame,
                _ => match frames.try_recv() {
                    Ok(Some(frame)) => frame,
                    _ => break,
                },
            };
            encode(&mut codec, next, &mut buf);
            batched += 1;
        }
        if buf.is_empty() {
            continue;
        }

        let written = tokio::select! {
            () = cancel.cancelled() => break,
            res = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            } => res,
        };

        if let Err(e) = written {
            debug!("session write failed: {e}");
            break;
        }
    }

    cancel.cancel();
    let _ = writer.shutdown().await;
}

fn encode(codec: &mut FrameCodec, frame: Frame, buf: &mut BytesMut) {
    if let Err(e) = codec.encode(frame, buf) {
        debug!("dropping unencodable frame: {e}");
    }
}
