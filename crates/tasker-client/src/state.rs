//! State owned by the sync engine.
//!
//! [`SyncState`] lives inside the engine task and is never shared; readers
//! get an [`EngineView`], a plain owned copy of what a screen needs.

use chrono::{DateTime, Utc};
use serde::Serialize;

use tasker_net::PresenceTracker;
use tasker_shared::rest::{Participant, TaskSummary};
use tasker_shared::{ConnectionState, ConversationId, UserId};
use tasker_store::{ConversationStore, LoadState, NotificationAggregator, Toast};

/// Everything the engine owns.
pub struct SyncState {
    pub connection: ConnectionState,
    pub conversations: ConversationStore,
    pub notifications: NotificationAggregator,
    pub presence: PresenceTracker,
}

impl SyncState {
    pub fn new(self_id: UserId, page_size: u32, toast_duration: chrono::Duration) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            conversations: ConversationStore::new(self_id),
            notifications: NotificationAggregator::new(page_size, toast_duration),
            presence: PresenceTracker::new(),
        }
    }

    pub fn view(&self) -> EngineView {
        let conversations = self
            .conversations
            .conversations()
            .iter()
            .map(|c| ConversationSummary {
                id: c.id.clone(),
                online: self.presence.is_online(c.counterpart_id()),
                last_seen: self.presence.last_seen(c.counterpart_id()),
                counterpart: c.counterpart.clone(),
                preview: c.last_message_preview.clone(),
                last_message_time: c.last_message_time,
                unread: c.unread,
                typing: c.typing,
                archived: c.archived,
                task: c.task.clone(),
            })
            .collect();

        EngineView {
            connection: self.connection,
            conversations,
            active: self.conversations.active().cloned(),
            unread_conversations: self.conversations.unread_count(),
            conversations_load: self.conversations.load_state().clone(),
            notifications_unread: self.notifications.unread_count(),
            notifications_loaded: self.notifications.notifications().len(),
            has_more_notifications: self.notifications.has_more(),
            notifications_load: self.notifications.load_state().clone(),
            toasts: self.notifications.toasts().to_vec(),
            chat_signals: self.notifications.chat_signals(),
        }
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub counterpart: Participant,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub preview: String,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread: bool,
    pub typing: bool,
    pub archived: bool,
    pub task: Option<TaskSummary>,
}

/// Read model handed out by [`crate::EngineHandle::view`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineView {
    pub connection: ConnectionState,
    /// Most recent first.
    pub conversations: Vec<ConversationSummary>,
    pub active: Option<ConversationId>,
    pub unread_conversations: usize,
    pub conversations_load: LoadState,
    pub notifications_unread: usize,
    pub notifications_loaded: usize,
    pub has_more_notifications: bool,
    pub notifications_load: LoadState,
    pub toasts: Vec<Toast>,
    /// Chat notifications not yet covered by a completed list refresh.
    pub chat_signals: u64,
}

impl EngineView {
    pub fn conversation(&self, id: &ConversationId) -> Option<&ConversationSummary> {
        self.conversations.iter().find(|c| c.id == *id)
    }
}
