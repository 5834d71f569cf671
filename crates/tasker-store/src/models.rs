use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tasker_net::NetError;
use tasker_shared::constants::IMAGE_PREVIEW;
use tasker_shared::rest::{ConversationSnapshot, MessageSnapshot, Participant, TaskSummary};
use tasker_shared::{ConversationId, MessageId, MessageStatus, ServerMessageId, UserId};

pub use tasker_shared::rest::{NotificationRecord as Notification, SenderDescriptor};
pub use tasker_shared::NotificationId;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub text: Option<String>,
    pub image: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    /// Build from a REST snapshot entry.
    ///
    /// The status falls back to what can be inferred from `is_read` and
    /// direction when the server omits it. A missing timestamp sorts the
    /// message to the start of the conversation.
    pub fn from_snapshot(snapshot: MessageSnapshot, self_id: &UserId) -> Self {
        let status = snapshot.status.unwrap_or_else(|| {
            if snapshot.is_read == Some(true) {
                MessageStatus::Read
            } else if snapshot.sender_id == *self_id {
                MessageStatus::Sent
            } else {
                MessageStatus::Delivered
            }
        });
        Self {
            id: MessageId::Confirmed(snapshot.id),
            sender_id: snapshot.sender_id,
            text: snapshot.message,
            image: snapshot.image,
            sent_at: snapshot.time.unwrap_or_default(),
            status,
        }
    }

    pub fn is_from(&self, user: &UserId) -> bool {
        self.sender_id == *user
    }

    /// One-line summary used for the conversation list.
    pub fn preview(&self) -> String {
        match (&self.text, &self.image) {
            (Some(text), _) if !text.trim().is_empty() => text.clone(),
            (_, Some(_)) => IMAGE_PREVIEW.to_string(),
            _ => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// A two-party conversation with its denormalized list fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub self_id: UserId,
    pub counterpart: Participant,
    /// Ordered by `sent_at`; ties keep arrival order.
    pub messages: Vec<Message>,
    pub last_message_preview: String,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_message_id: Option<MessageId>,
    pub unread: bool,
    pub typing: bool,
    pub typing_since: Option<DateTime<Utc>>,
    pub archived: bool,
    pub task: Option<TaskSummary>,
    /// Status updates for server ids not stored yet, merged per id.
    #[serde(skip)]
    pub(crate) early_statuses: HashMap<ServerMessageId, MessageStatus>,
}

impl Conversation {
    pub fn new(id: ConversationId, self_id: UserId, counterpart: Participant) -> Self {
        Self {
            id,
            self_id,
            counterpart,
            messages: Vec::new(),
            last_message_preview: String::new(),
            last_message_time: None,
            last_message_id: None,
            unread: false,
            typing: false,
            typing_since: None,
            archived: false,
            task: None,
            early_statuses: HashMap::new(),
        }
    }

    pub fn from_snapshot(snapshot: ConversationSnapshot, self_id: &UserId) -> Self {
        let messages: Vec<Message> = snapshot
            .messages
            .into_iter()
            .map(|m| Message::from_snapshot(m, self_id))
            .collect();

        // Older payloads leave out `recipient`; the first inbound sender is
        // the counterpart then.
        let counterpart = snapshot.recipient.unwrap_or_else(|| Participant {
            id: messages
                .iter()
                .find(|m| !m.is_from(self_id))
                .map(|m| m.sender_id.clone())
                .unwrap_or_default(),
            ..Participant::default()
        });

        let mut conversation = Self::new(snapshot.id, self_id.clone(), counterpart);
        conversation.archived = snapshot.archived;
        conversation.task = snapshot.task;
        for message in messages {
            conversation.insert(message);
        }
        conversation.refresh();
        conversation
    }

    pub fn counterpart_id(&self) -> &UserId {
        &self.counterpart.id
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == *id)
    }

    pub(crate) fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == *id)
    }

    pub(crate) fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == *id)
    }

    /// The most recent message not sent by self.
    pub fn latest_inbound(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| !m.is_from(&self.self_id))
    }

    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.id.is_pending()).count()
    }

    /// Insert keeping `sent_at` order. Returns false if the id is already
    /// present.
    pub(crate) fn insert(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.sent_at <= message.sent_at);
        self.messages.insert(at, message);
        self.settle_early_status(at);
        true
    }

    /// Hold a status for a server id that is not stored yet.
    pub(crate) fn buffer_status(&mut self, id: ServerMessageId, status: MessageStatus) {
        self.early_statuses
            .entry(id)
            .and_modify(|held| *held = held.merge(status))
            .or_insert(status);
    }

    /// Fold a held status into the message at `pos` once its server id is
    /// known.
    pub(crate) fn settle_early_status(&mut self, pos: usize) {
        let Some(message) = self.messages.get_mut(pos) else {
            return;
        };
        let Some(id) = message.id.server_id() else {
            return;
        };
        if let Some(held) = self.early_statuses.remove(id) {
            message.status = message.status.merge(held);
        }
    }

    /// Mark every inbound message read. Returns the server id of the latest
    /// inbound message, which is what the read receipt refers to.
    pub(crate) fn mark_inbound_read(&mut self) -> Option<tasker_shared::ServerMessageId> {
        let self_id = self.self_id.clone();
        for message in self.messages.iter_mut().filter(|m| !m.is_from(&self_id)) {
            message.status = message.status.merge(MessageStatus::Read);
        }
        self.latest_inbound().and_then(|m| m.id.server_id().cloned())
    }

    /// Recompute the denormalized fields from `messages`.
    pub(crate) fn refresh(&mut self) {
        match self.messages.last() {
            Some(last) => {
                self.last_message_preview = last.preview();
                self.last_message_time = Some(last.sent_at);
                self.last_message_id = Some(last.id.clone());
            }
            None => {
                self.last_message_preview.clear();
                self.last_message_time = None;
                self.last_message_id = None;
            }
        }
        self.unread = self
            .latest_inbound()
            .map_or(false, |m| m.status != MessageStatus::Read);
    }

    /// Fold a newer snapshot of the same conversation into this one.
    ///
    /// Messages are unioned by id with a monotonic status merge. Local
    /// pending messages and the typing flag are left alone.
    pub(crate) fn merge_snapshot(&mut self, incoming: Conversation) {
        if !incoming.counterpart.id.is_empty() {
            self.counterpart = incoming.counterpart;
        }
        self.archived = incoming.archived;
        if incoming.task.is_some() {
            self.task = incoming.task;
        }
        for message in incoming.messages {
            match self.message_mut(&message.id) {
                Some(existing) => existing.status = existing.status.merge(message.status),
                None => {
                    self.insert(message);
                }
            }
        }
        self.refresh();
    }
}

// ---------------------------------------------------------------------------
// Toasts
// ---------------------------------------------------------------------------

/// Local handle for a transient toast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToastId(pub u64);

/// An ephemeral notification shown on top of the UI. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toast {
    pub id: ToastId,
    pub notification_id: Option<NotificationId>,
    pub message: String,
    pub sender: SenderDescriptor,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Toast {
    /// Where tapping the toast should navigate.
    pub fn link(&self) -> Option<&str> {
        self.sender.link.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Load state
// ---------------------------------------------------------------------------

/// State of a REST-backed read path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Ready,
    /// The last fetch failed. Previously loaded data is still served.
    Failed { error: String, retryable: bool },
}

impl LoadState {
    pub fn failed(err: &NetError) -> Self {
        LoadState::Failed {
            error: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}
