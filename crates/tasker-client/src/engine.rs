//! Sync engine.
//!
//! A single task owns [`SyncState`] and serializes every input through one
//! `tokio::select!`: user commands from [`EngineHandle`], transport events,
//! REST completions and a maintenance tick. REST calls run in spawned tasks
//! and report back as [`Completion`] messages, so realtime events keep
//! flowing while a fetch is outstanding.
//!
//! The engine never connects or disconnects the transport; it only sends on
//! it and listens to it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use tasker_net::{NetError, RestApi, TransportEvent, TransportSession};
use tasker_shared::constants::CHANNEL_CAPACITY;
use tasker_shared::protocol::{InboundEvent, OutboundEvent};
use tasker_shared::rest::{ConversationSnapshot, NotificationPage};
use tasker_shared::{ConnectionState, ConversationId, MessageId, NotificationId, UserId};
use tasker_store::{Conversation, InboundOutcome, IngestOutcome, Notification, PageRequest, ToastId};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{emit_event, UiEvent};
use crate::state::{EngineView, SyncState};

const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(500);

/// Engine tuning derived from [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub page_size: u32,
    pub toast_duration: chrono::Duration,
    pub typing_ttl: chrono::Duration,
    pub pending_timeout: chrono::Duration,
    pub maintenance_interval: Duration,
}

impl From<&ClientConfig> for EngineSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            page_size: config.page_size,
            toast_duration: to_chrono(config.toast_duration),
            typing_ttl: to_chrono(config.typing_ttl),
            pending_timeout: to_chrono(config.pending_timeout),
            maintenance_interval: MAINTENANCE_INTERVAL,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 1_000))
}

// ---------------------------------------------------------------------------
// Command / completion types
// ---------------------------------------------------------------------------

/// Commands sent *into* the engine task.
enum EngineCommand {
    Select {
        id: ConversationId,
        reply: oneshot::Sender<Result<()>>,
    },
    Deselect,
    SendMessage {
        conversation_id: ConversationId,
        text: String,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    SendImage {
        conversation_id: ConversationId,
        image_url: String,
        image_type: Option<String>,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    SetTyping {
        conversation_id: ConversationId,
        is_typing: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    RefreshConversations,
    RefreshNotifications {
        reply: oneshot::Sender<Result<bool>>,
    },
    FetchNextNotifications {
        reply: oneshot::Sender<Result<bool>>,
    },
    MarkNotificationRead {
        id: NotificationId,
        reply: oneshot::Sender<bool>,
    },
    TapToast {
        id: ToastId,
        reply: oneshot::Sender<Option<String>>,
    },
    DismissToast(ToastId),
    View(oneshot::Sender<EngineView>),
    Conversation {
        id: ConversationId,
        reply: oneshot::Sender<Option<Conversation>>,
    },
    Notifications(oneshot::Sender<Vec<Notification>>),
    Shutdown,
}

/// Results of spawned REST calls.
enum Completion {
    Conversations(tasker_net::Result<Vec<ConversationSnapshot>>),
    NotificationPage {
        request: PageRequest,
        result: tasker_net::Result<NotificationPage>,
    },
    MarkRead {
        id: NotificationId,
        result: tasker_net::Result<()>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
    ui: broadcast::Sender<UiEvent>,
}

impl EngineHandle {
    /// Open a conversation. Unread messages are marked read and one receipt
    /// is sent.
    pub async fn select_conversation(&self, id: ConversationId) -> Result<()> {
        self.request(|reply| EngineCommand::Select { id, reply }).await?
    }

    pub async fn deselect(&self) -> Result<()> {
        self.command(EngineCommand::Deselect).await
    }

    /// Send a text message. Returns the pending id of the optimistic copy.
    /// If the transport refuses the frame the message is marked failed.
    pub async fn send_message(&self, conversation_id: ConversationId, text: impl Into<String>) -> Result<MessageId> {
        let text = text.into();
        self.request(|reply| EngineCommand::SendMessage {
            conversation_id,
            text,
            reply,
        })
        .await?
    }

    pub async fn send_image(
        &self,
        conversation_id: ConversationId,
        image_url: impl Into<String>,
        image_type: Option<String>,
    ) -> Result<MessageId> {
        let image_url = image_url.into();
        self.request(|reply| EngineCommand::SendImage {
            conversation_id,
            image_url,
            image_type,
            reply,
        })
        .await?
    }

    pub async fn set_typing(&self, conversation_id: ConversationId, is_typing: bool) -> Result<()> {
        self.request(|reply| EngineCommand::SetTyping {
            conversation_id,
            is_typing,
            reply,
        })
        .await?
    }

    /// Refetch the conversation list. Concurrent requests are coalesced.
    pub async fn refresh_conversations(&self) -> Result<()> {
        self.command(EngineCommand::RefreshConversations).await
    }

    /// Reload the notification feed from page 1. Resolves once the page is
    /// applied.
    pub async fn refresh_notifications(&self) -> Result<()> {
        self.request(|reply| EngineCommand::RefreshNotifications { reply })
            .await??;
        Ok(())
    }

    /// Load the next notification page. `Ok(false)` when everything is
    /// already loaded.
    pub async fn fetch_next_notifications(&self) -> Result<bool> {
        self.request(|reply| EngineCommand::FetchNextNotifications { reply })
            .await?
    }

    pub async fn mark_notification_read(&self, id: NotificationId) -> Result<bool> {
        self.request(|reply| EngineCommand::MarkNotificationRead { id, reply })
            .await
    }

    /// Dismiss a toast and get its navigation link.
    pub async fn tap_toast(&self, id: ToastId) -> Result<Option<String>> {
        self.request(|reply| EngineCommand::TapToast { id, reply }).await
    }

    pub async fn dismiss_toast(&self, id: ToastId) -> Result<()> {
        self.command(EngineCommand::DismissToast(id)).await
    }

    pub async fn view(&self) -> Result<EngineView> {
        self.request(EngineCommand::View).await
    }

    pub async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        self.request(|reply| EngineCommand::Conversation { id, reply })
            .await
    }

    pub async fn notifications(&self) -> Result<Vec<Notification>> {
        self.request(EngineCommand::Notifications).await
    }

    /// Change notifications for the UI. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown).await;
    }

    async fn command(&self, cmd: EngineCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ClientError::EngineStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.command(make(reply)).await?;
        rx.await.map_err(|_| ClientError::EngineStopped)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    state: SyncState,
    api: Arc<dyn RestApi>,
    transport: TransportSession,
    settings: EngineSettings,
    ui: broadcast::Sender<UiEvent>,
    completion_tx: mpsc::Sender<Completion>,
    conversations_in_flight: bool,
    /// A refresh was requested while one was in flight.
    conversations_stale: bool,
    page_reply: Option<oneshot::Sender<Result<bool>>>,
}

impl SyncEngine {
    /// Spawn the engine task for `self_id`.
    ///
    /// The transport subscription is taken before this returns, so nothing
    /// the transport emits after a subsequent `connect` is missed. The
    /// initial conversation and notification loads start immediately.
    pub fn spawn(
        self_id: UserId,
        api: Arc<dyn RestApi>,
        transport: TransportSession,
        settings: EngineSettings,
    ) -> EngineHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (completion_tx, completion_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ui, _) = broadcast::channel(CHANNEL_CAPACITY);
        let transport_rx = transport.subscribe();

        let engine = SyncEngine {
            state: SyncState::new(self_id, settings.page_size, settings.toast_duration),
            api,
            transport,
            settings,
            ui: ui.clone(),
            completion_tx,
            conversations_in_flight: false,
            conversations_stale: false,
            page_reply: None,
        };
        tokio::spawn(engine.run(cmd_rx, completion_rx, transport_rx));

        EngineHandle { cmd_tx, ui }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut completion_rx: mpsc::Receiver<Completion>,
        mut transport_rx: broadcast::Receiver<TransportEvent>,
    ) {
        info!(user = %self.state.conversations.self_id(), "Sync engine started");

        self.request_conversations();
        self.start_page_fetch(1, None);

        let mut ticker = tokio::time::interval(self.settings.maintenance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut transport_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },

                Some(completion) = completion_rx.recv() => self.on_completion(completion).await,

                event = transport_rx.recv(), if transport_open => match event {
                    Ok(event) => self.on_transport(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Engine fell behind transport events, resyncing");
                        self.request_conversations();
                    }
                    Err(RecvError::Closed) => {
                        warn!("Transport session gone");
                        transport_open = false;
                    }
                },

                _ = ticker.tick() => self.maintain(),
            }
        }

        info!("Sync engine stopped");
    }

    fn emit(&self, event: UiEvent) {
        emit_event(&self.ui, event);
    }

    async fn send_outbound(&self, event: OutboundEvent) -> tasker_net::Result<()> {
        let name = event.name();
        let result = self.transport.send(event).await;
        if let Err(ref e) = result {
            warn!(event = name, error = %e, "Outbound event not sent");
        }
        result
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Select { id, reply } => {
                let result = match self.state.conversations.select_conversation(&id) {
                    Ok(receipt) => {
                        if let Some(receipt) = receipt {
                            let _ = self.send_outbound(receipt).await;
                        }
                        self.emit(UiEvent::ConversationUpdated { conversation_id: id });
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }

            EngineCommand::Deselect => self.state.conversations.deselect(),

            EngineCommand::SendMessage {
                conversation_id,
                text,
                reply,
            } => {
                let pending = self.state.conversations.send_message(&conversation_id, &text);
                let _ = reply.send(self.dispatch_send(conversation_id, pending).await);
            }

            EngineCommand::SendImage {
                conversation_id,
                image_url,
                image_type,
                reply,
            } => {
                let pending = self
                    .state
                    .conversations
                    .send_image(&conversation_id, &image_url, image_type);
                let _ = reply.send(self.dispatch_send(conversation_id, pending).await);
            }

            EngineCommand::SetTyping {
                conversation_id,
                is_typing,
                reply,
            } => {
                let result = match self.state.conversations.set_typing(&conversation_id, is_typing) {
                    Ok(event) => self.send_outbound(event).await.map_err(ClientError::from),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }

            EngineCommand::RefreshConversations => self.request_conversations(),

            EngineCommand::RefreshNotifications { reply } => self.start_page_fetch(1, Some(reply)),

            EngineCommand::FetchNextNotifications { reply } => {
                match self.state.notifications.begin_next_page() {
                    Ok(Some(request)) => {
                        self.page_reply = Some(reply);
                        self.spawn_page_fetch(request);
                    }
                    Ok(None) => {
                        let _ = reply.send(Ok(false));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }

            EngineCommand::MarkNotificationRead { id, reply } => {
                let changed = self.state.notifications.mark_read(&id);
                if changed {
                    self.emit(UiEvent::NotificationsChanged {
                        unread: self.state.notifications.unread_count(),
                    });
                    let api = Arc::clone(&self.api);
                    let tx = self.completion_tx.clone();
                    tokio::spawn(async move {
                        let result = api.mark_notification_read(&id).await;
                        let _ = tx.send(Completion::MarkRead { id, result }).await;
                    });
                }
                let _ = reply.send(changed);
            }

            EngineCommand::TapToast { id, reply } => {
                let shown = self.state.notifications.toasts().iter().any(|t| t.id == id);
                let link = self.state.notifications.tap_toast(id);
                if shown {
                    self.emit(UiEvent::ToastDismissed { id });
                }
                let _ = reply.send(link);
            }

            EngineCommand::DismissToast(id) => {
                if self.state.notifications.dismiss_toast(id) {
                    self.emit(UiEvent::ToastDismissed { id });
                }
            }

            EngineCommand::View(reply) => {
                let _ = reply.send(self.state.view());
            }

            EngineCommand::Conversation { id, reply } => {
                let _ = reply.send(self.state.conversations.get(&id).cloned());
            }

            EngineCommand::Notifications(reply) => {
                let _ = reply.send(self.state.notifications.notifications().to_vec());
            }

            EngineCommand::Shutdown => {}
        }
    }

    /// Hand an optimistic send to the transport. A refused frame fails the
    /// pending message right away instead of waiting for the timeout.
    async fn dispatch_send(
        &mut self,
        conversation_id: ConversationId,
        pending: tasker_store::Result<(MessageId, OutboundEvent)>,
    ) -> Result<MessageId> {
        let (id, event) = pending?;
        self.emit(UiEvent::ConversationsChanged);
        if self.send_outbound(event).await.is_err() {
            self.state.conversations.fail_pending(&conversation_id, &id);
            self.emit(UiEvent::ConversationUpdated { conversation_id });
        }
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // REST
    // -----------------------------------------------------------------------

    fn request_conversations(&mut self) {
        if self.conversations_in_flight {
            self.conversations_stale = true;
            return;
        }
        self.conversations_in_flight = true;
        self.state.conversations.begin_load();

        let api = Arc::clone(&self.api);
        let tx = self.completion_tx.clone();
        let self_id = self.state.conversations.self_id().clone();
        tokio::spawn(async move {
            let result = api.fetch_conversations(&self_id).await;
            let _ = tx.send(Completion::Conversations(result)).await;
        });
    }

    fn start_page_fetch(&mut self, page: u32, reply: Option<oneshot::Sender<Result<bool>>>) {
        let page_size = self.state.notifications.page_size();
        match self.state.notifications.begin_fetch(page, page_size) {
            Ok(request) => {
                self.page_reply = reply;
                self.spawn_page_fetch(request);
            }
            Err(e) => match reply {
                Some(reply) => {
                    let _ = reply.send(Err(e.into()));
                }
                None => debug!(error = %e, "Notification fetch skipped"),
            },
        }
    }

    fn spawn_page_fetch(&self, request: PageRequest) {
        let api = Arc::clone(&self.api);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_notifications(request.page, request.per_page).await;
            let _ = tx.send(Completion::NotificationPage { request, result }).await;
        });
    }

    async fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Conversations(result) => {
                self.conversations_in_flight = false;
                match result {
                    Ok(snapshots) => {
                        let receipts = self.state.conversations.apply_snapshot(snapshots);
                        for receipt in receipts {
                            let _ = self.send_outbound(receipt).await;
                        }
                        // Chat activity seen so far is now in the list, unless
                        // another refresh was queued after it.
                        if !self.conversations_stale {
                            self.state.notifications.clear_chat_signals();
                        }
                        self.emit(UiEvent::ConversationsChanged);
                    }
                    Err(e) => {
                        self.state.conversations.fail_load(&e);
                        self.emit(UiEvent::LoadFailed {
                            resource: "conversations",
                            error: e.to_string(),
                        });
                    }
                }
                if self.conversations_stale {
                    self.conversations_stale = false;
                    self.request_conversations();
                }
            }

            Completion::NotificationPage { request, result } => {
                let error = result.as_ref().err().map(NetError::to_string);
                let outcome = self.state.notifications.complete_fetch(request, result);
                match error {
                    None => self.emit(UiEvent::NotificationsChanged {
                        unread: self.state.notifications.unread_count(),
                    }),
                    Some(error) => self.emit(UiEvent::LoadFailed {
                        resource: "notifications",
                        error,
                    }),
                }
                if let Some(reply) = self.page_reply.take() {
                    let _ = reply.send(outcome.map(|()| true).map_err(ClientError::from));
                }
            }

            Completion::MarkRead { id, result } => {
                self.state.notifications.confirm_read_result(&id, &result);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => {
                let previous = self.state.connection;
                self.state.connection = state;
                self.emit(UiEvent::ConnectionChanged { state });

                match state {
                    // A new link starts with no presence knowledge.
                    ConnectionState::AwaitingAck => self.state.presence.clear(),
                    _ if state.is_connected() && !previous.is_connected() => {
                        // Deltas may have been missed while the link was down.
                        self.request_conversations();
                    }
                    _ => {}
                }
            }
            TransportEvent::Inbound(event) => self.on_inbound(event).await,
        }
    }

    async fn on_inbound(&mut self, event: InboundEvent) {
        let now = Utc::now();
        match event {
            InboundEvent::ConnectionAck(_) => {}

            InboundEvent::ReceiveMessage(message) => {
                let conversation_id = message.conversation_id.clone();
                let message_id = message.message_id.clone();
                let sender = message.sender_id.clone();

                match self.state.conversations.apply_inbound_message(message) {
                    InboundOutcome::Duplicate => {}
                    InboundOutcome::Reconciled => {
                        self.emit(UiEvent::ConversationUpdated { conversation_id });
                    }
                    InboundOutcome::Appended {
                        read_receipt,
                        new_conversation,
                    } => {
                        if let Some(receipt) = read_receipt {
                            let _ = self.send_outbound(receipt).await;
                        }
                        if new_conversation {
                            // Pull counterpart details and the task link.
                            self.request_conversations();
                        }
                        self.emit(UiEvent::MessageReceived {
                            conversation_id,
                            message_id,
                            sender,
                        });
                        self.emit(UiEvent::ConversationsChanged);
                    }
                }
            }

            InboundEvent::MessageSent(ack) => {
                let conversation_id = ack.conversation_id.clone();
                if self.state.conversations.apply_send_ack(ack) {
                    self.emit(UiEvent::ConversationUpdated { conversation_id });
                }
            }

            InboundEvent::MessageStatusUpdate(update) => {
                if self.state.conversations.apply_status_update(
                    &update.message_id,
                    &update.conversation_id,
                    update.status,
                ) {
                    self.emit(UiEvent::ConversationUpdated {
                        conversation_id: update.conversation_id,
                    });
                }
            }

            InboundEvent::TypingIndicator(typing) => {
                if self.state.conversations.apply_typing(
                    &typing.conversation_id,
                    &typing.user_id,
                    typing.is_typing,
                    now,
                ) {
                    self.emit(UiEvent::TypingChanged {
                        conversation_id: typing.conversation_id,
                        typing: typing.is_typing,
                    });
                }
            }

            InboundEvent::UserConnected(peer) => {
                self.state.presence.on_connected(peer.user_id.clone());
                self.emit(UiEvent::PresenceChanged {
                    user_id: peer.user_id,
                    online: true,
                });
            }

            InboundEvent::UserDisconnected(peer) => {
                self.state.presence.on_disconnected(peer.user_id.clone(), now);
                self.emit(UiEvent::PresenceChanged {
                    user_id: peer.user_id,
                    online: false,
                });
            }

            InboundEvent::NewNotification(notification) => {
                match self.state.notifications.ingest_realtime_event(notification, now) {
                    IngestOutcome::RefreshConversations => self.request_conversations(),
                    IngestOutcome::Toast(id) => {
                        if let Some(toast) = self.state.notifications.toasts().iter().find(|t| t.id == id) {
                            self.emit(UiEvent::ToastRaised(toast.clone()));
                        }
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    fn maintain(&mut self) {
        let now = Utc::now();

        for conversation_id in self
            .state
            .conversations
            .expire_typing(now, self.settings.typing_ttl)
        {
            self.emit(UiEvent::TypingChanged {
                conversation_id,
                typing: false,
            });
        }

        for (conversation_id, _) in self
            .state
            .conversations
            .expire_pending(now, self.settings.pending_timeout)
        {
            self.emit(UiEvent::ConversationUpdated { conversation_id });
        }

        for id in self.state.notifications.expire_toasts(now) {
            self.emit(UiEvent::ToastDismissed { id });
        }
    }
}
