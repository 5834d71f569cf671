use serde::Serialize;
use tokio::sync::broadcast;

use tasker_shared::{ConnectionState, ConversationId, ServerMessageId, UserId};
use tasker_store::{Toast, ToastId};

/// Change notifications published by the engine for the UI layer.
///
/// Payloads are deliberately small: a consumer re-reads what it needs
/// through the engine handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum UiEvent {
    ConnectionChanged {
        state: ConnectionState,
    },
    /// The conversation list was reloaded or reordered.
    ConversationsChanged,
    ConversationUpdated {
        conversation_id: ConversationId,
    },
    MessageReceived {
        conversation_id: ConversationId,
        message_id: ServerMessageId,
        sender: UserId,
    },
    TypingChanged {
        conversation_id: ConversationId,
        typing: bool,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    NotificationsChanged {
        unread: usize,
    },
    ToastRaised(Toast),
    ToastDismissed {
        id: ToastId,
    },
    /// A read path failed. The previous data is still served.
    LoadFailed {
        resource: &'static str,
        error: String,
    },
}

impl UiEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UiEvent::ConnectionChanged { .. } => "connection-changed",
            UiEvent::ConversationsChanged => "conversations-changed",
            UiEvent::ConversationUpdated { .. } => "conversation-updated",
            UiEvent::MessageReceived { .. } => "message-received",
            UiEvent::TypingChanged { .. } => "typing-changed",
            UiEvent::PresenceChanged { .. } => "presence-changed",
            UiEvent::NotificationsChanged { .. } => "notifications-changed",
            UiEvent::ToastRaised(_) => "toast-raised",
            UiEvent::ToastDismissed { .. } => "toast-dismissed",
            UiEvent::LoadFailed { .. } => "load-failed",
        }
    }
}

pub fn emit_event(tx: &broadcast::Sender<UiEvent>, event: UiEvent) {
    let name = event.name();
    if tx.send(event).is_err() {
        tracing::trace!(event = name, "No UI subscribers");
    }
}
