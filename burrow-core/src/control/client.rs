use crate::delay::DelayTimer;
use crate::pump::{MessagePump, PumpError};
use crate::reconnect::Retrier;
use crate::transport::{self, deadline};
use burrow_common::config::ControlClientConfig;
use burrow_common::{Result, TunnelError};
use burrow_protocol::{
    read_to, write_message, CloseTunnelRequest, CloseTunnelResponse, HandshakeRequest,
    HandshakeResponse, Message, NewTunnelRequest, NewTunnelResponse, PingRequest,
    ShutdownRequest,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Callbacks for messages the broker sends to an agent.
///
/// Tunnel requests run on their own task; their responses are queued on the
/// connection that carried the request.
pub trait ClientHandler: Send + Sync + 'static {
    /// A control connection was established or re-established
    fn on_connected(&self) {}

    /// The control connection failed; a reconnect follows
    fn on_disconnected(&self, _error: &PumpError) {}

    /// Heartbeat round trip exceeded the recent average by `delay`
    fn on_ping_response(&self, _delay: Duration) {}

    fn on_new_tunnel(
        &self,
        request: NewTunnelRequest,
    ) -> impl Future<Output = NewTunnelResponse> + Send;

    fn on_close_tunnel(
        &self,
        request: CloseTunnelRequest,
    ) -> impl Future<Output = CloseTunnelResponse> + Send;

    /// Returning true stops [`ControlClient::run`]
    fn on_shutdown(&self, _request: &ShutdownRequest) -> bool {
        true
    }

    fn on_unknown(&self, message: Message) {
        warn!(kind = %message.kind(), "Received unknown message");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Handshaking,
    Connected,
    Reconnecting,
    Terminated,
}

enum Flow {
    Continue,
    Stop,
}

/// Agent-side control client
pub struct ControlClient<H: ClientHandler> {
    config: ControlClientConfig,
    handler: Arc<H>,
    retrier: Retrier,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    state: watch::Sender<ClientState>,
}

impl<H: ClientHandler> ControlClient<H> {
    pub fn new(config: ControlClientConfig, handler: H) -> Self {
        let retrier = Retrier::new(config.retry);
        Self {
            config,
            handler: Arc::new(handler),
            retrier,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            state: watch::Sender::new(ClientState::Idle),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    /// Signal [`run`](Self::run) to stop. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Close, then wait up to `grace` for in-flight tunnel requests.
    ///
    /// Returns false if the grace period expired first.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.close();
        self.tasks.close();
        tokio::time::timeout(grace, self.tasks.wait()).await.is_ok()
    }

    /// Dial the broker and complete the handshake.
    pub async fn connect_and_handshake(&self) -> Result<MessagePump> {
        let config = &self.config;
        self.set_state(ClientState::Handshaking);

        let mut stream = transport::connect(&config.server_addr, config.timeouts.connect).await?;
        let peer_addr = stream.peer_addr().ok();

        let request = HandshakeRequest {
            id: config.id.clone(),
            client_hash: config.client_hash.clone(),
            version: config.version.clone(),
            device: config.device.clone(),
        };
        deadline(
            config.timeouts.write,
            write_message(&mut stream, &request.into()),
        )
        .await?;

        let response: HandshakeResponse =
            deadline(config.timeouts.read, read_to(&mut stream)).await?;
        response.status.check()?;

        debug!(server = %config.server_addr, "control handshake complete");
        Ok(MessagePump::start(stream, &config.pump).with_peer_addr(peer_addr))
    }

    /// Redial through the retrier until connected, out of attempts or closed.
    async fn reconnect(&self) -> Result<MessagePump> {
        let attempts = self.retrier.run(move |attempt| async move {
            if self.shutdown.is_cancelled() {
                return Err(TunnelError::Canceled);
            }
            if attempt > 1 {
                info!(attempt, server = %self.config.server_addr, "Reconnecting");
            }
            self.connect_and_handshake().await
        });

        tokio::select! {
            () = self.shutdown.cancelled() => Err(TunnelError::Canceled),
            result = attempts => result,
        }
    }

    /// Connect and serve the control connection until closed, told to shut
    /// down, or reconnecting runs out of attempts.
    ///
    /// The first connect is a single attempt, so a rejected handshake or an
    /// unreachable broker fails immediately. Closing returns `Ok`; exhausted
    /// reconnects return the last error.
    pub async fn run(&self) -> Result<()> {
        let result = match self.serve().await {
            Err(TunnelError::Canceled) => Ok(()),
            other => other,
        };
        self.set_state(ClientState::Terminated);
        result
    }

    async fn serve(&self) -> Result<()> {
        let mut pump = tokio::select! {
            () = self.shutdown.cancelled() => return Err(TunnelError::Canceled),
            connected = self.connect_and_handshake() => connected?,
        };
        self.on_connected();

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut delay_timer = DelayTimer::new(self.config.delay_window);
        let mut ping_sent: Option<Instant> = None;

        loop {
            let received = tokio::select! {
                () = self.shutdown.cancelled() => {
                    pump.close();
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    match pump.try_send(PingRequest) {
                        Ok(true) => {
                            ping_sent.get_or_insert_with(Instant::now);
                        }
                        Ok(false) => debug!("outbound queue full, skipping heartbeat"),
                        Err(_) => {}
                    }
                    continue;
                }
                received = pump.recv() => received,
            };

            match received {
                Ok(Message::PingResponse(_)) => {
                    if let Some(sent) = ping_sent.take() {
                        let delay = delay_timer.observe(sent.elapsed());
                        self.handler.on_ping_response(delay);
                    }
                }
                Ok(message) => {
                    if let Flow::Stop = self.dispatch(&pump, message) {
                        info!("Shutdown requested by broker");
                        pump.close();
                        return Ok(());
                    }
                }
                Err(err) if err.is_transient() => {
                    debug!("transient control error: {err}");
                }
                Err(err) => {
                    warn!(error = %err, "Control connection lost");
                    pump.close();
                    self.handler.on_disconnected(&err);
                    self.set_state(ClientState::Reconnecting);
                    ping_sent = None;

                    pump = self.reconnect().await?;
                    self.on_connected();
                }
            }
        }
    }

    fn on_connected(&self) {
        info!(server = %self.config.server_addr, "Connected to broker");
        self.handler.on_connected();
        self.set_state(ClientState::Connected);
    }

    fn dispatch(&self, pump: &MessagePump, message: Message) -> Flow {
        match message {
            Message::NewTunnelRequest(request) => {
                let handler = Arc::clone(&self.handler);
                let out = pump.sender();
                self.tasks.spawn(async move {
                    let response = handler.on_new_tunnel(request).await;
                    let _ = out.send(response.into()).await;
                });
            }
            Message::CloseTunnelRequest(request) => {
                let handler = Arc::clone(&self.handler);
                let out = pump.sender();
                self.tasks.spawn(async move {
                    let response = handler.on_close_tunnel(request).await;
                    let _ = out.send(response.into()).await;
                });
            }
            Message::ShutdownRequest(request) => {
                if self.handler.on_shutdown(&request) {
                    return Flow::Stop;
                }
            }
            other => self.handler.on_unknown(other),
        }
        Flow::Continue
    }
}
