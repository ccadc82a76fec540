//! Bidirectional byte copy with half-close and traffic accounting

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

/// Copy `a → b` and `b → a` concurrently until both directions end.
///
/// When one direction hits EOF or an error, the destination of that
/// direction is shut down for writing; the other direction keeps running.
/// Returns the bytes copied `(a → b, b → a)`.
pub async fn link_streams<A, B>(a: A, b: B, buf_size: usize) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    tokio::join!(
        pipe(a_read, b_write, buf_size),
        pipe(b_read, a_write, buf_size)
    )
}

async fn pipe<S, D>(mut src: ReadHalf<S>, mut dst: WriteHalf<D>, buf_size: usize) -> u64
where
    S: AsyncRead,
    D: AsyncWrite,
{
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut copied = 0u64;

    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                trace!("link read ended: {e}");
                break;
            }
        };
        if let Err(e) = dst.write_all(&buf[..n]).await {
            trace!("link write ended: {e}");
            break;
        }
        copied += n as u64;
    }

    let _ = dst.shutdown().await;
    copied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_copies_both_ways_and_counts() {
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);

        let link = tokio::spawn(link_streams(a, b, 64));

        let upstream = vec![7u8; 10_000];
        let downstream = vec![9u8; 4_321];

        let up = upstream.clone();
        let writer_a = tokio::spawn(async move {
            a_peer.write_all(&up).await.unwrap();
            a_peer.shutdown().await.unwrap();
            let mut got = Vec::new();
            a_peer.read_to_end(&mut got).await.unwrap();
            got
        });

        let down = downstream.clone();
        let writer_b = tokio::spawn(async move {
            let mut got = Vec::new();
            b_peer.read_to_end(&mut got).await.unwrap();
            b_peer.write_all(&down).await.unwrap();
            b_peer.shutdown().await.unwrap();
            got
        });

        assert_eq!(writer_b.await.unwrap(), upstream);
        assert_eq!(writer_a.await.unwrap(), downstream);
        assert_eq!(link.await.unwrap(), (10_000, 4_321));
    }
}
