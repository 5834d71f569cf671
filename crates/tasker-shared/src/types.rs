use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Server ids show up as JSON numbers on some endpoints and as strings on
/// others; both normalize to the string form.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s,
            RawId::Signed(n) => n.to_string(),
            RawId::Unsigned(n) => n.to_string(),
        }
    }
}

macro_rules! wire_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<u64> for $name {
            fn from(n: u64) -> Self {
                Self(n.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                RawId::deserialize(deserializer).map(|raw| Self(raw.into_string()))
            }
        }
    };
}

wire_id!(
    /// An authenticated user (self or a counterpart).
    UserId
);
wire_id!(
    /// A two-party conversation.
    ConversationId
);
wire_id!(
    /// A persisted notification in the feed.
    NotificationId
);
wire_id!(
    /// A message id assigned by the server.
    ServerMessageId
);

impl Ord for ServerMessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ServerMessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Two-phase message identity.
///
/// A message sent from this client starts out `Pending` with a random
/// placeholder and becomes `Confirmed` once the server acknowledges it.
/// Messages received from the server are `Confirmed` from the start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "phase", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    Pending(Uuid),
    Confirmed(ServerMessageId),
}

impl MessageId {
    pub fn new_pending() -> Self {
        MessageId::Pending(Uuid::new_v4())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageId::Pending(_))
    }

    pub fn server_id(&self) -> Option<&ServerMessageId> {
        match self {
            MessageId::Confirmed(id) => Some(id),
            MessageId::Pending(_) => None,
        }
    }

    pub fn pending_id(&self) -> Option<Uuid> {
        match self {
            MessageId::Pending(id) => Some(*id),
            MessageId::Confirmed(_) => None,
        }
    }
}

// Pending ids sort after every confirmed id: they were created locally after
// everything the server has already numbered.
impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (MessageId::Confirmed(a), MessageId::Confirmed(b)) => a.cmp(b),
            (MessageId::Confirmed(_), MessageId::Pending(_)) => Ordering::Less,
            (MessageId::Pending(_), MessageId::Confirmed(_)) => Ordering::Greater,
            (MessageId::Pending(a), MessageId::Pending(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Pending(id) => write!(f, "pending:{id}"),
            MessageId::Confirmed(id) => write!(f, "{id}"),
        }
    }
}

impl From<ServerMessageId> for MessageId {
    fn from(id: ServerMessageId) -> Self {
        MessageId::Confirmed(id)
    }
}

/// Delivery status of a message.
///
/// `Sending -> Sent -> Delivered -> Read`, with `Failed` and `Rejected`
/// reachable from any non-terminal state. `Read`, `Failed` and `Rejected`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[serde(alias = "pending")]
    Sending,
    Sent,
    Delivered,
    #[serde(alias = "seen")]
    Read,
    #[serde(alias = "error")]
    Failed,
    Rejected,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed | MessageStatus::Rejected => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Read | MessageStatus::Failed | MessageStatus::Rejected
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, MessageStatus::Failed | MessageStatus::Rejected)
    }

    /// Monotonic merge: the result never moves backwards, whatever order the
    /// two statuses arrived in.
    pub fn merge(self, incoming: MessageStatus) -> MessageStatus {
        if self.is_terminal() {
            return self;
        }
        if incoming.is_failure() || incoming.rank() > self.rank() {
            incoming
        } else {
            self
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
            MessageStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Lifecycle of the realtime connection as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket is open but the server has not acknowledged the identity yet.
    AwaitingAck,
    Connected,
    /// Waiting out the delay before the single automatic reconnect.
    Reconnecting,
    /// Reconnect exhausted; nothing further happens until `connect` is called.
    Offline,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Whether a connection attempt is underway or established.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::AwaitingAck
                | ConnectionState::Connected
                | ConnectionState::Reconnecting
        )
    }
}
