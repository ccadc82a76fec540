use crate::pump::{MessagePump, PumpError};
use crate::transport::{deadline, socket_tuning};
use burrow_common::config::ControlServerConfig;
use burrow_common::Result;
use burrow_protocol::{
    read_to, write_message, HandshakeRequest, HandshakeResponse, Message, StatusCode,
};
use kanal::{bounded_async, AsyncReceiver, AsyncSender};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Handshake admission policy.
///
/// Implementations decide whether an agent may connect and remember that it
/// did; [`release`](Validator::release) undoes that when the accepted
/// handshake could not be completed.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, request: &HandshakeRequest) -> impl Future<Output = StatusCode> + Send;

    fn release(&self, _request: &HandshakeRequest) {}
}

/// A validated agent control connection
#[derive(Debug)]
pub struct AgentConn {
    pump: MessagePump,
    pub id: String,
    pub client_hash: String,
    pub version: String,
    pub device: String,
}

impl AgentConn {
    /// Key of the agent in duplicate-login filters
    pub fn key(&self) -> String {
        format!("{}:{}", self.id, self.client_hash)
    }

    pub fn pump(&self) -> &MessagePump {
        &self.pump
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.pump.peer_addr()
    }

    pub async fn send(&self, message: impl Into<Message>) -> std::result::Result<(), PumpError> {
        self.pump.send(message).await
    }

    pub async fn recv(&self) -> std::result::Result<Message, PumpError> {
        self.pump.recv().await
    }

    pub fn close(&self) {
        self.pump.close();
    }
}

/// Broker-side control server
pub struct ControlServer<V: Validator> {
    listener: TcpListener,
    local_addr: SocketAddr,
    validator: Arc<V>,
    config: ControlServerConfig,
    clients: AsyncSender<AgentConn>,
    shutdown: CancellationToken,
}

impl<V: Validator> ControlServer<V> {
    /// Bind the listener. Validated agents arrive on the returned queue.
    pub async fn bind(
        addr: &str,
        validator: V,
        config: ControlServerConfig,
    ) -> Result<(Self, AsyncReceiver<AgentConn>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (clients, accepted) = bounded_async(config.queue_capacity.max(1));

        Ok((
            Self {
                listener,
                local_addr,
                validator: Arc::new(validator),
                config,
                clients,
                shutdown: CancellationToken::new(),
            },
            accepted,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn validator(&self) -> &Arc<V> {
        &self.validator
    }

    /// Stop accepting. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Accept loop; returns once closed or when accepting fails.
    pub async fn run(&self) -> Result<()> {
        info!(addr = %self.local_addr, "Control server listening");

        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    socket_tuning::tune_silent(&stream);
                    tokio::spawn(handshake(
                        stream,
                        peer_addr,
                        Arc::clone(&self.validator),
                        self.config,
                        self.clients.clone(),
                        self.shutdown.clone(),
                    ));
                }
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    error!("Control accept failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }
}

impl<V: Validator> Drop for ControlServer<V> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handshake<V: Validator>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    validator: Arc<V>,
    config: ControlServerConfig,
    clients: AsyncSender<AgentConn>,
    shutdown: CancellationToken,
) {
    let timeouts = config.timeouts;

    let request: HandshakeRequest = match deadline(timeouts.read, read_to(&mut stream)).await {
        Ok(request) => request,
        Err(e) => {
            debug!(peer_addr = %peer_addr, "bad handshake: {e}");
            return;
        }
    };

    let status = validator.validate(&request).await;
    let written = deadline(
        timeouts.write,
        write_message(&mut stream, &HandshakeResponse { status }.into()),
    )
    .await;

    if let Err(e) = written {
        debug!(peer_addr = %peer_addr, "handshake response failed: {e}");
        if status.is_ok() {
            validator.release(&request);
        }
        return;
    }
    if !status.is_ok() {
        info!(agent = %request.id, peer_addr = %peer_addr, %status, "Agent rejected");
        return;
    }

    let conn = AgentConn {
        pump: MessagePump::start(stream, &config.pump).with_peer_addr(Some(peer_addr)),
        id: request.id.clone(),
        client_hash: request.client_hash.clone(),
        version: request.version.clone(),
        device: request.device.clone(),
    };

    let delivered = tokio::select! {
        () = shutdown.cancelled() => false,
        sent = clients.send(conn) => sent.is_ok(),
    };
    if !delivered {
        validator.release(&request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_protocol::{read_message, PingRequest};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct OnlyOnce {
        seen: Mutex<Vec<String>>,
        released: Mutex<Vec<String>>,
    }

    impl Validator for OnlyOnce {
        async fn validate(&self, request: &HandshakeRequest) -> StatusCode {
            let mut seen = self.seen.lock().unwrap();
            if seen.contains(&request.id) {
                return StatusCode::DuplicateAgent;
            }
            seen.push(request.id.clone());
            StatusCode::Ok
        }

        fn release(&self, request: &HandshakeRequest) {
            self.released.lock().unwrap().push(request.id.clone());
        }
    }

    fn request(id: &str) -> Message {
        HandshakeRequest {
            id: id.into(),
            client_hash: "h".into(),
            version: "0.1.1".into(),
            device: "linux/x86_64".into(),
        }
        .into()
    }

    async fn start() -> (Arc<ControlServer<OnlyOnce>>, AsyncReceiver<AgentConn>) {
        let (server, accepted) =
            ControlServer::bind("127.0.0.1:0", OnlyOnce::default(), ControlServerConfig::default())
                .await
                .unwrap();
        let server = Arc::new(server);
        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });
        (server, accepted)
    }

    #[tokio::test]
    async fn test_validated_agent_is_queued() {
        let (server, accepted) = start().await;

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        write_message(&mut stream, &request("agent-1")).await.unwrap();
        let response: HandshakeResponse = read_to(&mut stream).await.unwrap();
        assert!(response.status.is_ok());

        let conn = accepted.recv().await.unwrap();
        assert_eq!(conn.key(), "agent-1:h");
        assert_eq!(conn.device, "linux/x86_64");

        write_message(&mut stream, &PingRequest.into()).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Message::PingRequest(PingRequest));
        server.close();
    }

    #[tokio::test]
    async fn test_rejected_agent_is_closed() {
        let (server, accepted) = start().await;

        let mut first = TcpStream::connect(server.local_addr()).await.unwrap();
        write_message(&mut first, &request("agent-1")).await.unwrap();
        let _: HandshakeResponse = read_to(&mut first).await.unwrap();
        let _conn = accepted.recv().await.unwrap();

        let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
        write_message(&mut second, &request("agent-1")).await.unwrap();
        let response: HandshakeResponse = read_to(&mut second).await.unwrap();
        assert_eq!(response.status, StatusCode::DuplicateAgent);

        // Connection is dropped after a rejection
        assert!(read_message(&mut second).await.is_err());
        assert!(
            tokio::time::timeout(Duration::from_millis(100), accepted.recv())
                .await
                .is_err()
        );
    }
}
