//! Client connection controller: owns one outbound connection to the
//! gateway, republishes received envelopes to local subscribers, and runs
//! the bounded-retry reconnection cycle with its own heartbeat.
//!
//! All `ReconnectMachine` mutations happen on one actor task, so two
//! reconnect attempts can never overlap. Dropping the [`ChatClient`] (or
//! calling [`ChatClient::shutdown`]) ends the actor, which cancels any
//! pending heartbeat or retry timer with it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::OptionFuture;
use futures_util::{SinkExt, StreamExt};
use palaver_models::{AckPayload, DeliveryState, Envelope, EnvelopeKind, HelloPayload};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::delivery::DeliveryTracker;
use crate::error::ClientError;
use crate::reconnect::{Directive, MachineEvent, ReconnectMachine};

type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Gateway endpoint, e.g. `ws://host:8080/gateway`.
    pub url: String,
    pub token: String,
    pub device_id: String,
    /// Ping cadence used until the gateway's greeting advertises its own.
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub ack_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            device_id: device_id.into(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            ack_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// An envelope received from the gateway.
    Envelope(Envelope),
    /// A tracked message changed delivery state.
    Delivery {
        message_id: Uuid,
        state: DeliveryState,
    },
    /// The reconnect budget is exhausted; a manual connect() is required.
    ReconnectExhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

enum Command {
    Connect,
    Disconnect,
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
}

/// Handle to the controller actor. Cloneable streams out, commands in.
pub struct ChatClient {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<ClientEvent>,
    status_rx: watch::Receiver<ConnectionStatus>,
    tracker: Arc<Mutex<DeliveryTracker>>,
    task: tokio::task::JoinHandle<()>,
}

impl ChatClient {
    pub fn spawn(config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(256);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let tracker = Arc::new(Mutex::new(DeliveryTracker::new(config.ack_timeout)));
        let machine = ReconnectMachine::new(config.max_reconnect_attempts, config.retry_delay);
        let actor = Controller {
            config,
            cmd_rx,
            events: events_tx.clone(),
            status: status_tx,
            machine,
            tracker: tracker.clone(),
        };
        let task = tokio::spawn(actor.run());
        Self {
            cmd_tx,
            events_tx,
            status_rx,
            tracker,
            task,
        }
    }

    /// Subscribe to received envelopes and delivery/terminal events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    /// Connection-status stream.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn delivery_state(&self, message_id: Uuid) -> Option<DeliveryState> {
        self.tracker.lock().expect("tracker lock").state(message_id)
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.cmd_tx
            .send(Command::Connect)
            .await
            .map_err(|_| ClientError::ControllerGone)
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.cmd_tx
            .send(Command::Disconnect)
            .await
            .map_err(|_| ClientError::ControllerGone)
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { envelope, reply })
            .await
            .map_err(|_| ClientError::ControllerGone)?;
        response.await.map_err(|_| ClientError::ControllerGone)?
    }

    /// Tear down the actor. Any pending reconnect or heartbeat timer dies
    /// with it.
    pub async fn shutdown(self) {
        drop(self.cmd_tx);
        let _ = self.task.await;
    }
}

struct Controller {
    config: ClientConfig,
    cmd_rx: mpsc::Receiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    status: watch::Sender<ConnectionStatus>,
    machine: ReconnectMachine,
    tracker: Arc<Mutex<DeliveryTracker>>,
}

enum Step {
    Cmd(Option<Command>),
    RetryFired,
    Ws(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Heartbeat,
    Sweep,
}

impl Controller {
    async fn run(mut self) {
        let mut transport: Option<Transport> = None;
        let mut retry_at: Option<Instant> = None;
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(self.config.ack_timeout.max(Duration::from_millis(50)) / 2);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let connected = transport.is_some();
            let step = {
                let ws_next: OptionFuture<_> = transport.as_mut().map(|ws| ws.next()).into();
                let retry: OptionFuture<_> = retry_at.map(tokio::time::sleep_until).into();
                tokio::select! {
                    cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                    Some(()) = retry => Step::RetryFired,
                    Some(item) = ws_next => Step::Ws(item),
                    _ = heartbeat.tick(), if connected => Step::Heartbeat,
                    _ = sweep.tick() => Step::Sweep,
                }
            };

            match step {
                Step::Cmd(None) => break,
                Step::Cmd(Some(Command::Connect)) => {
                    match self.machine.handle(MachineEvent::ConnectRequested) {
                        Ok(Directive::StartConnect) => {
                            retry_at = None;
                            self.attempt_connect(&mut transport, &mut retry_at, &mut heartbeat)
                                .await;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            // Already connecting or connected; one attempt
                            // in flight at most.
                            tracing::debug!(error = %err, "connect request ignored");
                        }
                    }
                }
                Step::Cmd(Some(Command::Disconnect)) => {
                    // Clear the reconnect flag before the transport sees
                    // the close, so the close never re-triggers a connect.
                    let _ = self.machine.handle(MachineEvent::DisconnectRequested);
                    retry_at = None;
                    if let Some(mut ws) = transport.take() {
                        let _ = ws.close(None).await;
                    }
                    self.set_status(ConnectionStatus::Disconnected);
                }
                Step::Cmd(Some(Command::Send { envelope, reply })) => {
                    let result = self.send_envelope(&mut transport, envelope).await;
                    let transport_died = matches!(result, Err(ClientError::Transport(_)));
                    let _ = reply.send(result);
                    if transport_died {
                        transport = None;
                        self.on_transport_down(&mut retry_at);
                    }
                }
                Step::RetryFired => {
                    retry_at = None;
                    if let Ok(Directive::StartConnect) =
                        self.machine.handle(MachineEvent::RetryTimerFired)
                    {
                        self.attempt_connect(&mut transport, &mut retry_at, &mut heartbeat)
                            .await;
                    }
                }
                Step::Ws(Some(Ok(Message::Text(text)))) => {
                    // The gateway's greeting overrides the configured ping
                    // cadence for the rest of the connection.
                    if let Some(cadence) = self.on_text(text.as_str()) {
                        heartbeat = tokio::time::interval(cadence);
                        heartbeat
                            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    }
                }
                Step::Ws(Some(Ok(Message::Close(_))) | None) => {
                    tracing::info!("gateway closed the connection");
                    transport = None;
                    self.on_transport_down(&mut retry_at);
                }
                Step::Ws(Some(Ok(_))) => {}
                Step::Ws(Some(Err(err))) => {
                    tracing::info!(error = %err, "transport error");
                    transport = None;
                    self.on_transport_down(&mut retry_at);
                }
                Step::Heartbeat => {
                    if let Some(ws) = transport.as_mut() {
                        let ping = Envelope::ping(0);
                        if write_envelope(ws, &ping).await.is_err() {
                            transport = None;
                            self.on_transport_down(&mut retry_at);
                        }
                    }
                }
                Step::Sweep => {
                    let failed = self.tracker.lock().expect("tracker lock").sweep();
                    for message_id in failed {
                        self.emit(ClientEvent::Delivery {
                            message_id,
                            state: DeliveryState::Failed,
                        });
                    }
                }
            }
        }

        // Shutdown: close whatever is open; pending timers die with the
        // actor.
        if let Some(mut ws) = transport.take() {
            let _ = ws.close(None).await;
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn attempt_connect(
        &mut self,
        transport: &mut Option<Transport>,
        retry_at: &mut Option<Instant>,
        heartbeat: &mut tokio::time::Interval,
    ) {
        self.set_status(ConnectionStatus::Connecting);
        let url = format!(
            "{}?token={}&device={}",
            self.config.url, self.config.token, self.config.device_id
        );
        let attempt = tokio::time::timeout(self.config.connect_timeout, connect_async(url)).await;
        match attempt {
            Ok(Ok((ws, _response))) => {
                let _ = self.machine.handle(MachineEvent::ConnectSucceeded);
                *transport = Some(ws);
                heartbeat.reset();
                self.set_status(ConnectionStatus::Connected);
                tracing::info!("gateway connection established");
            }
            Ok(Err(err)) => {
                tracing::info!(
                    error = %err,
                    attempt = self.machine.attempt_count() + 1,
                    "connect attempt failed"
                );
                self.on_connect_failure(retry_at);
            }
            Err(_) => {
                tracing::info!(
                    attempt = self.machine.attempt_count() + 1,
                    "connect attempt timed out"
                );
                self.on_connect_failure(retry_at);
            }
        }
    }

    fn on_connect_failure(&mut self, retry_at: &mut Option<Instant>) {
        match self.machine.handle(MachineEvent::ConnectFailed) {
            Ok(directive) => self.apply_failure_directive(directive, retry_at),
            Err(err) => tracing::error!(error = %err, "reconnect machine out of sync"),
        }
    }

    fn on_transport_down(&mut self, retry_at: &mut Option<Instant>) {
        self.set_status(ConnectionStatus::Disconnected);
        match self.machine.handle(MachineEvent::TransportClosed) {
            Ok(directive) => self.apply_failure_directive(directive, retry_at),
            Err(err) => {
                // An explicit disconnect already settled the machine.
                tracing::debug!(error = %err, "transport close after settle");
            }
        }
    }

    fn apply_failure_directive(&mut self, directive: Directive, retry_at: &mut Option<Instant>) {
        match directive {
            Directive::RetryAfter(delay) => {
                self.set_status(ConnectionStatus::Disconnected);
                *retry_at = Some(Instant::now() + delay);
            }
            Directive::EmitTerminalDisconnect => {
                self.set_status(ConnectionStatus::Disconnected);
                tracing::warn!(
                    attempts = self.machine.attempt_count(),
                    "reconnect budget exhausted"
                );
                self.emit(ClientEvent::ReconnectExhausted);
            }
            Directive::Settle => self.set_status(ConnectionStatus::Disconnected),
            Directive::StartConnect => {
                // Failure handling never starts a connect directly.
                tracing::error!("unexpected directive after failure");
            }
        }
    }

    async fn send_envelope(
        &mut self,
        transport: &mut Option<Transport>,
        envelope: Envelope,
    ) -> Result<(), ClientError> {
        let Some(ws) = transport.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        let message_id = (envelope.kind == EnvelopeKind::ChatMessage)
            .then(|| envelope.message_id())
            .flatten();
        if let Some(id) = message_id {
            // Optimistic `sending`; a duplicate of an in-flight message is
            // refused so a retry never double-sends silently.
            if !self.tracker.lock().expect("tracker lock").track(id) {
                tracing::debug!(message_id = %id, "duplicate send refused");
                return Ok(());
            }
            self.emit(ClientEvent::Delivery {
                message_id: id,
                state: DeliveryState::Sending,
            });
        }
        match write_envelope(ws, &envelope).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(id) = message_id {
                    if self.tracker.lock().expect("tracker lock").fail(id) {
                        self.emit(ClientEvent::Delivery {
                            message_id: id,
                            state: DeliveryState::Failed,
                        });
                    }
                }
                Err(err)
            }
        }
    }

    /// Handle one text frame. Returns the gateway's advertised heartbeat
    /// cadence when the frame was a handshake greeting.
    fn on_text(&mut self, text: &str) -> Option<Duration> {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable envelope from gateway");
                return None;
            }
        };
        match envelope.kind {
            EnvelopeKind::Pong => {}
            EnvelopeKind::Hello => {
                if let Ok(hello) = serde_json::from_value::<HelloPayload>(envelope.payload.clone())
                {
                    tracing::info!(
                        session_id = %hello.session_id,
                        heartbeat_interval_ms = hello.heartbeat_interval_ms,
                        "gateway greeting received"
                    );
                    if hello.heartbeat_interval_ms > 0 {
                        return Some(Duration::from_millis(hello.heartbeat_interval_ms));
                    }
                }
            }
            EnvelopeKind::Ack => {
                if let Ok(ack) = serde_json::from_value::<AckPayload>(envelope.payload.clone()) {
                    let advanced = self
                        .tracker
                        .lock()
                        .expect("tracker lock")
                        .advance(ack.message_id, ack.state);
                    if let Some(state) = advanced {
                        self.emit(ClientEvent::Delivery {
                            message_id: ack.message_id,
                            state,
                        });
                    }
                }
            }
            EnvelopeKind::ReadReceipt => {
                if let Some(message_id) = envelope.message_id() {
                    let advanced = self
                        .tracker
                        .lock()
                        .expect("tracker lock")
                        .advance(message_id, DeliveryState::Read);
                    if let Some(state) = advanced {
                        self.emit(ClientEvent::Delivery { message_id, state });
                    }
                }
                self.emit(ClientEvent::Envelope(envelope));
            }
            _ => self.emit(ClientEvent::Envelope(envelope)),
        }
        None
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }
}

async fn write_envelope(ws: &mut Transport, envelope: &Envelope) -> Result<(), ClientError> {
    let payload = serde_json::to_string(envelope)?;
    ws.send(Message::Text(payload.into()))
        .await
        .map_err(ClientError::from)
}
