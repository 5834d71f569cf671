//! Transport session with a tokio mpsc command / broadcast event pattern.
//!
//! The connection lives in a dedicated task. Callers drive it through a
//! cloneable [`TransportSession`] handle and observe it through
//! [`TransportSession::subscribe`]; dropping a receiver unsubscribes.
//!
//! Failure policy: when an attempt fails or an open link drops, the session
//! schedules exactly one reconnect after `reconnect_delay`. If that attempt
//! fails too, the session reports [`ConnectionState::Offline`] and waits for
//! an explicit `connect`. An acknowledged connection resets the count. A
//! socket that opens but is not acknowledged within `ack_timeout` fails the
//! same way.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tasker_shared::constants::{
    ACK_TIMEOUT_MS, CHANNEL_CAPACITY, MAX_AUTO_RECONNECTS, RECONNECT_DELAY_MS,
};
use tasker_shared::protocol::{InboundEvent, OutboundEvent};
use tasker_shared::{ConnectionState, UserId};

use crate::error::{NetError, Result};
use crate::transport::{Connector, Link};

// ---------------------------------------------------------------------------
// Command / event types
// ---------------------------------------------------------------------------

/// Commands sent *into* the session task.
#[derive(Debug)]
enum SessionCommand {
    Connect(UserId),
    Disconnect,
    Send {
        event: OutboundEvent,
        reply: oneshot::Sender<Result<()>>,
    },
    GetState(oneshot::Sender<ConnectionState>),
    Shutdown,
}

/// Events published *from* the session task to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Inbound(InboundEvent),
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait before the automatic reconnect.
    pub reconnect_delay: Duration,
    /// Consecutive failures that still trigger an automatic reconnect.
    pub max_auto_reconnects: u32,
    /// Wait for `connection_ack` after the socket opens.
    pub ack_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
            max_auto_reconnects: MAX_AUTO_RECONNECTS,
            ack_timeout: Duration::from_millis(ACK_TIMEOUT_MS),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running transport session.
#[derive(Debug, Clone)]
pub struct TransportSession {
    cmd_tx: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<TransportEvent>,
}

impl TransportSession {
    /// Spawn the session task. It starts disconnected.
    pub fn spawn<C: Connector>(connector: C, config: SessionConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (attempt_tx, attempt_rx) = mpsc::channel(8);
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);

        let actor = SessionActor {
            connector: Arc::new(connector),
            config,
            events: events.clone(),
            attempt_tx,
            identity: None,
            link: None,
            state: ConnectionState::Disconnected,
            generation: 0,
            failures: 0,
            reconnect_at: None,
            ack_deadline: None,
        };
        tokio::spawn(actor.run(cmd_rx, attempt_rx));

        Self { cmd_tx, events }
    }

    /// Connect as `identity`. A no-op while a connection for the same
    /// identity is being established or is up.
    pub async fn connect(&self, identity: UserId) -> Result<()> {
        self.command(SessionCommand::Connect(identity)).await
    }

    /// Close the connection and forget retry state.
    pub async fn disconnect(&self) -> Result<()> {
        self.command(SessionCommand::Disconnect).await
    }

    /// Queue an outbound event on the current link.
    pub async fn send(&self, event: OutboundEvent) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Send { event, reply }).await?;
        rx.await.map_err(|_| NetError::ChannelClosed("session"))?
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::GetState(reply)).await?;
        rx.await.map_err(|_| NetError::ChannelClosed("session"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Stop the session task. The handle is unusable afterwards.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
    }

    async fn command(&self, cmd: SessionCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| NetError::ChannelClosed("session"))
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct AttemptOutcome {
    generation: u64,
    result: Result<Link>,
}

struct SessionActor<C> {
    connector: Arc<C>,
    config: SessionConfig,
    events: broadcast::Sender<TransportEvent>,
    attempt_tx: mpsc::Sender<AttemptOutcome>,
    identity: Option<UserId>,
    link: Option<Link>,
    state: ConnectionState,
    /// Bumped on every attempt and teardown; results from older attempts are dropped.
    generation: u64,
    /// Consecutive failures since the last acknowledged connection.
    failures: u32,
    reconnect_at: Option<Instant>,
    ack_deadline: Option<Instant>,
}

impl<C: Connector> SessionActor<C> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut attempt_rx: mpsc::Receiver<AttemptOutcome>,
    ) {
        debug!("Transport session task started");

        loop {
            let reconnect_at = self.reconnect_at;
            let ack_deadline = self.ack_deadline;

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },

                Some(outcome) = attempt_rx.recv() => self.on_attempt(outcome),

                frame = next_frame(&mut self.link) => match frame {
                    Some(text) => self.on_frame(&text),
                    None => self.on_failure("connection closed"),
                },

                _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)),
                    if reconnect_at.is_some() =>
                {
                    self.reconnect_at = None;
                    info!("Attempting automatic reconnect");
                    self.start_attempt();
                }

                _ = tokio::time::sleep_until(ack_deadline.unwrap_or_else(Instant::now)),
                    if ack_deadline.is_some() =>
                {
                    self.ack_deadline = None;
                    self.on_failure("connection_ack not received");
                }
            }
        }

        self.teardown();
        self.set_state(ConnectionState::Disconnected);
        debug!("Transport session task stopped");
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Connect(identity) => {
                if self.identity.as_ref() == Some(&identity) && self.state.is_active() {
                    debug!(user = %identity, state = ?self.state, "Connect ignored, already in progress");
                    return;
                }
                if self.identity.is_some() {
                    self.teardown();
                }
                info!(user = %identity, "Connecting");
                self.identity = Some(identity);
                self.start_attempt();
            }

            SessionCommand::Disconnect => {
                info!("Disconnecting");
                self.teardown();
                self.set_state(ConnectionState::Disconnected);
            }

            SessionCommand::Send { event, reply } => {
                let result = self.send_frame(&event);
                if let Err(ref e) = result {
                    debug!(event = event.name(), error = %e, "Outbound event not sent");
                }
                let _ = reply.send(result);
            }

            SessionCommand::GetState(reply) => {
                let _ = reply.send(self.state);
            }

            SessionCommand::Shutdown => {}
        }
    }

    fn send_frame(&self, event: &OutboundEvent) -> Result<()> {
        let link = match (&self.link, self.state) {
            (Some(link), ConnectionState::AwaitingAck | ConnectionState::Connected) => link,
            _ => return Err(NetError::NotConnected),
        };
        let frame = event.to_frame()?;
        link.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => NetError::ChannelClosed("link"),
        })
    }

    fn start_attempt(&mut self) {
        let Some(identity) = self.identity.clone() else {
            return;
        };

        self.generation += 1;
        self.link = None;
        self.ack_deadline = None;
        self.set_state(ConnectionState::Connecting);

        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let attempt_tx = self.attempt_tx.clone();
        tokio::spawn(async move {
            let result = connector.open(&identity).await;
            let _ = attempt_tx.send(AttemptOutcome { generation, result }).await;
        });
    }

    fn on_attempt(&mut self, outcome: AttemptOutcome) {
        if outcome.generation != self.generation {
            debug!(generation = outcome.generation, "Discarding stale connection attempt");
            return;
        }
        match outcome.result {
            Ok(link) => {
                debug!("Socket open, awaiting acknowledgment");
                self.link = Some(link);
                self.ack_deadline = Some(Instant::now() + self.config.ack_timeout);
                self.set_state(ConnectionState::AwaitingAck);
            }
            Err(e) => self.on_failure(&e.to_string()),
        }
    }

    fn on_frame(&mut self, text: &str) {
        match InboundEvent::from_frame(text) {
            Ok(InboundEvent::ConnectionAck(ack)) => {
                info!(user = ?ack.user_id, "Connection acknowledged");
                self.ack_deadline = None;
                self.failures = 0;
                self.set_state(ConnectionState::Connected);
            }
            Ok(event) => {
                debug!(event = event.name(), "Inbound event");
                self.emit(TransportEvent::Inbound(event));
            }
            Err(e) => {
                warn!(error = %e, "Dropping invalid inbound frame");
            }
        }
    }

    fn on_failure(&mut self, reason: &str) {
        self.link = None;
        self.ack_deadline = None;

        if self.identity.is_none() {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        self.failures += 1;
        if self.failures <= self.config.max_auto_reconnects {
            warn!(
                reason,
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "Connection lost, scheduling reconnect"
            );
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
            self.set_state(ConnectionState::Reconnecting);
        } else {
            warn!(reason, failures = self.failures, "Reconnect failed, session offline");
            self.set_state(ConnectionState::Offline);
        }
    }

    /// Drop the link and forget identity and retry state. In-flight
    /// attempts become stale.
    fn teardown(&mut self) {
        self.generation += 1;
        self.link = None;
        self.reconnect_at = None;
        self.ack_deadline = None;
        self.failures = 0;
        self.identity = None;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Connection state changed");
            self.state = state;
            self.emit(TransportEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn next_frame(link: &mut Option<Link>) -> Option<String> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}
