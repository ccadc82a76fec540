//! Socket options for long-lived control and tunnel connections
//!
//! - `TCP_NODELAY`: control messages and forwarded requests are small
//! - TCP keepalive: notice half-open peers without application traffic

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub fn tune(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Best effort; tuning failures never fail a connection
pub fn tune_silent(stream: &TcpStream) {
    if let Err(e) = tune(stream) {
        tracing::debug!(error = %e, "socket tuning failed");
    }
}
