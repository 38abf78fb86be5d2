//! Real-time coherence channel.
//!
//! A single background task owns the connection. [`ChannelHandle`] sends it
//! commands over an mpsc queue; events fan out through a broadcast channel and
//! the current [`ChannelState`] is published through a watch channel.
//!
//! Lifecycle: `Disconnected -> Connecting -> Authenticating -> Authenticated`.
//! Any close or transport error goes back to `Connecting` after an exponential
//! backoff (`base * 2^(attempt - 1)`). The attempt counter only resets after
//! `auth_success`. Once `max_reconnect_attempts` reconnects have failed in a
//! row the task emits [`ChannelEvent::GaveUp`] and stays disconnected until
//! the next explicit `connect`.

use crate::core::protocol::{
    decode_inbound, CoherenceAlertPayload, CoherenceUpdatePayload, Decoded, InboundMessage,
    OutboundMessage,
};
use crate::domain::ports::{Connection, Connector};
use crate::utils::error::{PortalError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticating,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    Authenticated,
    AuthFailed { message: String },
    CoherenceUpdate(CoherenceUpdatePayload),
    CoherenceAlert(CoherenceAlertPayload),
    ClientConnected { client_id: String },
    ClientDisconnected { client_id: String },
    Pong,
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: no further reconnects until `connect` is called again.
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub event_buffer: usize,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// `base * 2^(attempt - 1)`, attempt starts at 1
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

#[derive(Debug)]
enum Command {
    Connect { token: String },
    Disconnect,
    Send(OutboundMessage),
}

/// Cloneable handle to the channel task
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Receiver<ChannelState>,
}

impl ChannelHandle {
    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| PortalError::ChannelError {
                message: "channel task has stopped".to_string(),
            })
    }

    pub fn connect(&self, token: impl Into<String>) -> Result<()> {
        self.command(Command::Connect {
            token: token.into(),
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    pub fn ping(&self) -> Result<()> {
        self.command(Command::Send(OutboundMessage::Ping))
    }

    pub fn subscribe_client(&self, client_id: impl Into<String>) -> Result<()> {
        self.command(Command::Send(OutboundMessage::SubscribeClient {
            client_id: client_id.into(),
        }))
    }

    pub fn unsubscribe_client(&self, client_id: impl Into<String>) -> Result<()> {
        self.command(Command::Send(OutboundMessage::UnsubscribeClient {
            client_id: client_id.into(),
        }))
    }

    pub fn subscribe_all_clients(&self) -> Result<()> {
        self.command(Command::Send(OutboundMessage::SubscribeAllClients))
    }

    pub fn send_coherence_update(&self, payload: CoherenceUpdatePayload) -> Result<()> {
        self.command(Command::Send(OutboundMessage::CoherenceUpdate { payload }))
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Wait until the channel reaches `target`
    pub async fn wait_for(&self, target: ChannelState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| PortalError::ChannelError {
                message: "channel task has stopped".to_string(),
            })
    }
}

pub struct CoherenceChannel;

impl CoherenceChannel {
    /// 啟動背景任務；必須在 tokio runtime 內呼叫
    pub fn spawn(config: ChannelConfig, connector: Arc<dyn Connector>) -> ChannelHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

        let worker = ChannelWorker {
            config,
            connector,
            commands: command_rx,
            events: event_tx.clone(),
            state: state_tx,
        };
        tokio::spawn(worker.run());

        ChannelHandle {
            commands: command_tx,
            events: event_tx,
            state: state_rx,
        }
    }
}

/// Why a session (connect/reconnect cycle) ended
enum SessionExit {
    Stopped,
    Shutdown,
}

/// Why a single open connection ended
enum ConnectionExit {
    Closed { authenticated: bool },
    Disconnected,
    AuthFailed,
    Shutdown,
}

/// Outcome of waiting out a backoff delay
enum BackoffExit {
    Elapsed,
    Reconnect(String),
    Disconnected,
    Shutdown,
}

struct ChannelWorker {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
}

impl ChannelWorker {
    async fn run(mut self) {
        while let Some(token) = self.wait_for_connect().await {
            if let SessionExit::Shutdown = self.session(token).await {
                break;
            }
        }
        tracing::debug!("Coherence channel task stopped");
    }

    fn current_state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ChannelState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!("Channel state {:?} -> {:?}", previous, next);
            self.emit(ChannelEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // 沒有訂閱者時送出失敗是正常的
        let _ = self.events.send(event);
    }

    fn drop_unauthenticated(&self, message: &OutboundMessage) {
        tracing::debug!(
            "Dropping {:?} while {:?}: not authenticated",
            message,
            self.current_state()
        );
    }

    async fn wait_for_connect(&mut self) -> Option<String> {
        loop {
            match self.commands.recv().await? {
                Command::Connect { token } => return Some(token),
                Command::Disconnect => tracing::debug!("Disconnect ignored: already disconnected"),
                Command::Send(message) => self.drop_unauthenticated(&message),
            }
        }
    }

    async fn session(&mut self, mut token: String) -> SessionExit {
        let mut failed_attempts: u32 = 0;

        loop {
            self.set_state(ChannelState::Connecting);
            tracing::info!("🔌 Connecting to {}", self.config.url);

            let connector = Arc::clone(&self.connector);
            let url = self.config.url.clone();
            let connect = connector.connect(&url);
            tokio::pin!(connect);

            let result = loop {
                tokio::select! {
                    result = &mut connect => break result,
                    command = self.commands.recv() => match command {
                        None => return SessionExit::Shutdown,
                        Some(Command::Disconnect) => {
                            tracing::info!("Disconnect requested while connecting");
                            self.set_state(ChannelState::Disconnected);
                            return SessionExit::Stopped;
                        }
                        Some(Command::Connect { token: next }) => {
                            tracing::debug!("Already connecting; token updated");
                            token = next;
                        }
                        Some(Command::Send(message)) => self.drop_unauthenticated(&message),
                    },
                }
            };

            match result {
                Ok(mut connection) => {
                    tracing::info!("✅ Channel connection opened");
                    match self.drive_connection(connection.as_mut(), &token).await {
                        ConnectionExit::Closed { authenticated } => {
                            // 只有完成認證的連線才重置重試次數
                            if authenticated {
                                failed_attempts = 0;
                            }
                        }
                        ConnectionExit::Disconnected | ConnectionExit::AuthFailed => {
                            return SessionExit::Stopped
                        }
                        ConnectionExit::Shutdown => return SessionExit::Shutdown,
                    }
                }
                Err(e) => {
                    tracing::warn!("Channel connection failed: {}", e);
                }
            }

            self.set_state(ChannelState::Disconnected);

            if failed_attempts >= self.config.max_reconnect_attempts {
                tracing::error!(
                    "❌ Giving up after {} reconnect attempts",
                    failed_attempts
                );
                self.emit(ChannelEvent::GaveUp {
                    attempts: failed_attempts,
                });
                return SessionExit::Stopped;
            }

            failed_attempts += 1;
            let delay = self.config.backoff_delay(failed_attempts);
            tracing::info!(
                "🔄 Reconnecting in {:?} (attempt {}/{})",
                delay,
                failed_attempts,
                self.config.max_reconnect_attempts
            );
            self.emit(ChannelEvent::Reconnecting {
                attempt: failed_attempts,
                delay,
            });

            match self.wait_backoff(delay).await {
                BackoffExit::Elapsed => {}
                BackoffExit::Reconnect(next) => {
                    token = next;
                    failed_attempts = 0;
                }
                BackoffExit::Disconnected => return SessionExit::Stopped,
                BackoffExit::Shutdown => return SessionExit::Shutdown,
            }
        }
    }

    async fn wait_backoff(&mut self, delay: Duration) -> BackoffExit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return BackoffExit::Elapsed,
                command = self.commands.recv() => match command {
                    None => return BackoffExit::Shutdown,
                    Some(Command::Disconnect) => {
                        tracing::info!("Disconnect requested; pending reconnect cancelled");
                        return BackoffExit::Disconnected;
                    }
                    Some(Command::Connect { token }) => return BackoffExit::Reconnect(token),
                    Some(Command::Send(message)) => self.drop_unauthenticated(&message),
                },
            }
        }
    }

    async fn drive_connection(
        &mut self,
        connection: &mut dyn Connection,
        token: &str,
    ) -> ConnectionExit {
        let auth = OutboundMessage::Auth {
            token: token.to_string(),
        };
        if let Err(e) = send(connection, &auth).await {
            tracing::warn!("Failed to send auth frame: {}", e);
            return ConnectionExit::Closed {
                authenticated: false,
            };
        }
        self.set_state(ChannelState::Authenticating);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = connection.next_text() => match frame {
                    None => {
                        tracing::info!("Channel connection closed by server");
                        return self.closed();
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Channel transport error: {}", e);
                        return self.closed();
                    }
                    Some(Ok(text)) => {
                        if let Some(exit) = self.handle_frame(connection, &text).await {
                            return exit;
                        }
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = send(connection, &OutboundMessage::Ping).await {
                        tracing::warn!("Heartbeat failed: {}", e);
                        return self.closed();
                    }
                }
                command = self.commands.recv() => match command {
                    None => {
                        close_quietly(connection).await;
                        return ConnectionExit::Shutdown;
                    }
                    Some(Command::Disconnect) => {
                        tracing::info!("🔌 Disconnecting coherence channel");
                        close_quietly(connection).await;
                        self.set_state(ChannelState::Disconnected);
                        return ConnectionExit::Disconnected;
                    }
                    Some(Command::Connect { .. }) => {
                        tracing::debug!("Connect ignored: connection already open");
                    }
                    Some(Command::Send(message)) => {
                        if self.current_state() != ChannelState::Authenticated
                            && !message.allowed_before_auth()
                        {
                            self.drop_unauthenticated(&message);
                        } else if let Err(e) = send(connection, &message).await {
                            tracing::warn!("Send failed: {}", e);
                            return self.closed();
                        }
                    }
                },
            }
        }
    }

    fn closed(&self) -> ConnectionExit {
        ConnectionExit::Closed {
            authenticated: self.current_state() == ChannelState::Authenticated,
        }
    }

    async fn handle_frame(
        &mut self,
        connection: &mut dyn Connection,
        text: &str,
    ) -> Option<ConnectionExit> {
        let message = match decode_inbound(text) {
            Ok(Decoded::Message(message)) => message,
            Ok(Decoded::Unknown(kind)) => {
                tracing::warn!("Ignoring unrecognised message kind '{}'", kind);
                return None;
            }
            Err(e) => {
                tracing::warn!("Ignoring malformed frame: {}", e);
                return None;
            }
        };

        match message {
            InboundMessage::AuthSuccess => {
                tracing::info!("🔐 Channel authenticated");
                self.set_state(ChannelState::Authenticated);
                self.emit(ChannelEvent::Authenticated);
            }
            InboundMessage::AuthError { message } => {
                tracing::error!("❌ Channel authentication rejected: {}", message);
                self.emit(ChannelEvent::AuthFailed { message });
                close_quietly(connection).await;
                self.set_state(ChannelState::Disconnected);
                return Some(ConnectionExit::AuthFailed);
            }
            InboundMessage::CoherenceUpdate { payload } => {
                tracing::debug!("Coherence update for {}", payload.client_id);
                self.emit(ChannelEvent::CoherenceUpdate(payload));
            }
            InboundMessage::CoherenceAlert { payload } => {
                tracing::info!(
                    "⚠️ Coherence alert for {}: {}",
                    payload.client_id,
                    payload.message
                );
                self.emit(ChannelEvent::CoherenceAlert(payload));
            }
            InboundMessage::ClientConnected { client_id } => {
                self.emit(ChannelEvent::ClientConnected { client_id });
            }
            InboundMessage::ClientDisconnected { client_id } => {
                self.emit(ChannelEvent::ClientDisconnected { client_id });
            }
            InboundMessage::Pong => {
                tracing::trace!("pong");
                self.emit(ChannelEvent::Pong);
            }
        }
        None
    }
}

async fn send(connection: &mut dyn Connection, message: &OutboundMessage) -> Result<()> {
    connection.send_text(message.encode()?).await
}

async fn close_quietly(connection: &mut dyn Connection) {
    if let Err(e) = connection.close().await {
        tracing::debug!("Error while closing channel connection: {}", e);
    }
}
