//! Public-facing listener of one tunnel

use crate::muxer::{MuxerError, VhostListener};
use burrow_core::transport::{socket_tuning, BoxedStream};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Either a dedicated TCP port or a subdomain slot on the shared HTTP muxer
#[derive(Debug)]
pub enum TunnelListener {
    Tcp(TcpListener),
    Vhost(VhostListener),
}

impl TunnelListener {
    pub async fn bind_tcp(addr: &str) -> io::Result<Self> {
        Ok(Self::Tcp(TcpListener::bind(addr).await?))
    }

    /// Address callers connect to. Vhost tunnels share the muxer's address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr(),
            Self::Vhost(listener) => Ok(listener.local_addr()),
        }
    }

    pub async fn accept(&self) -> io::Result<(BoxedStream, Option<SocketAddr>)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer_addr) = listener.accept().await?;
                socket_tuning::tune_silent(&stream);
                Ok((Box::pin(stream), Some(peer_addr)))
            }
            Self::Vhost(listener) => match listener.accept().await {
                Ok(stream) => {
                    let peer_addr = stream.peer_addr().ok();
                    Ok((Box::pin(stream), peer_addr))
                }
                Err(MuxerError::Io(e)) => Err(e),
                Err(MuxerError::Closed) => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    MuxerError::Closed,
                )),
            },
        }
    }
}
