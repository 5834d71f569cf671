//! REST payloads.
//!
//! Every optional field defaults to an empty value so that partially filled
//! server responses still decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageStatus, NotificationId, ServerMessageId, UserId};

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// The other side of a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "image")]
    pub avatar: Option<String>,
}

/// Task a conversation was opened about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// A message as embedded in a conversation snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub id: ServerMessageId,
    #[serde(alias = "sender")]
    pub sender_id: UserId,
    #[serde(default, alias = "text")]
    pub message: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, alias = "created_at")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub is_read: Option<bool>,
}

/// One entry of `GET /conversations/{selfId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub id: ConversationId,
    #[serde(default)]
    pub recipient: Option<Participant>,
    #[serde(default)]
    pub messages: Vec<MessageSnapshot>,
    #[serde(default)]
    pub task: Option<TaskSummary>,
    #[serde(default)]
    pub archived: bool,
}

/// The conversation list either comes bare or wrapped in an object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConversationList {
    Bare(Vec<ConversationSnapshot>),
    Wrapped {
        conversations: Vec<ConversationSnapshot>,
    },
}

impl ConversationList {
    pub fn into_vec(self) -> Vec<ConversationSnapshot> {
        match self {
            ConversationList::Bare(list) => list,
            ConversationList::Wrapped { conversations } => conversations,
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Where a notification originated. Unknown categories are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationSource {
    Chat,
    Task,
    Bid,
    Payment,
    Review,
    #[default]
    System,
    Other(String),
}

impl NotificationSource {
    pub fn is_chat(&self) -> bool {
        *self == NotificationSource::Chat
    }
}

impl From<String> for NotificationSource {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "chat" | "message" => NotificationSource::Chat,
            "task" => NotificationSource::Task,
            "bid" | "offer" => NotificationSource::Bid,
            "payment" => NotificationSource::Payment,
            "review" => NotificationSource::Review,
            "system" | "" => NotificationSource::System,
            _ => NotificationSource::Other(s),
        }
    }
}

impl From<NotificationSource> for String {
    fn from(source: NotificationSource) -> Self {
        match source {
            NotificationSource::Chat => "chat".to_string(),
            NotificationSource::Task => "task".to_string(),
            NotificationSource::Bid => "bid".to_string(),
            NotificationSource::Payment => "payment".to_string(),
            NotificationSource::Review => "review".to_string(),
            NotificationSource::System => "system".to_string(),
            NotificationSource::Other(s) => s,
        }
    }
}

/// Who or what a notification is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source: NotificationSource,
    #[serde(default, alias = "avatar")]
    pub image: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// One persisted notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: NotificationId,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "important")]
    pub is_important: bool,
    #[serde(default, alias = "read")]
    pub is_read: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sender: SenderDescriptor,
}

/// `GET /user/notifications?page=&per_page=`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPage {
    #[serde(default)]
    pub notifications: Vec<NotificationRecord>,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
    #[serde(default)]
    pub pages: u32,
}
