//! Realtime wire protocol.
//!
//! Frames are JSON text of the form `{"event": "<name>", "data": {...}}`.
//! Both directions are closed enums, and inbound frames are validated here
//! before anything downstream sees them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::rest::{NotificationSource, SenderDescriptor};
use crate::types::{ConversationId, MessageStatus, NotificationId, ServerMessageId, UserId};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Events this client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    SendMessage(OutgoingMessage),
    Typing(TypingSignal),
    MessageStatus(StatusReceipt),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
    /// Echoed back in `message_sent` so the ack can be matched exactly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub receiver_id: UserId,
    pub is_typing: bool,
}

/// Read receipt (or any other status acknowledgment) for a received message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReceipt {
    pub conversation_id: ConversationId,
    pub message_id: ServerMessageId,
    pub status: MessageStatus,
}

impl OutboundEvent {
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn read_receipt(conversation_id: ConversationId, message_id: ServerMessageId) -> Self {
        OutboundEvent::MessageStatus(StatusReceipt {
            conversation_id,
            message_id,
            status: MessageStatus::Read,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::SendMessage(_) => "send_message",
            OutboundEvent::Typing(_) => "typing",
            OutboundEvent::MessageStatus(_) => "message_status",
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Events the server pushes to this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    /// The server accepted the identity carried on connect.
    ConnectionAck(ConnectionAck),
    ReceiveMessage(ReceivedMessage),
    /// Confirms or rejects an optimistic send.
    MessageSent(SendAck),
    MessageStatusUpdate(StatusUpdate),
    TypingIndicator(TypingIndicator),
    UserConnected(PeerPresence),
    UserDisconnected(PeerPresence),
    NewNotification(RealtimeNotification),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionAck {
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub conversation_id: ConversationId,
    pub message_id: ServerMessageId,
    pub sender_id: UserId,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub client_message_id: Option<Uuid>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendAck {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub message_id: Option<ServerMessageId>,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub client_message_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub conversation_id: ConversationId,
    pub message_id: ServerMessageId,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPresence {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeNotification {
    #[serde(default)]
    pub notification_id: Option<NotificationId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub user_data: SenderDescriptor,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub source: NotificationSource,
}

impl InboundEvent {
    /// Decode and validate one text frame.
    ///
    /// A frame without a `data` member is treated as carrying an empty
    /// object, which is how the server sends `connection_ack`.
    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        let mut value: serde_json::Value = serde_json::from_str(frame)?;
        if let Some(obj) = value.as_object_mut() {
            obj.entry("data")
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
        }
        let event: InboundEvent = serde_json::from_value(value)?;
        event.validate()?;
        Ok(event)
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            InboundEvent::ConnectionAck(_) => Ok(()),
            InboundEvent::ReceiveMessage(m) => {
                require(m.conversation_id.is_empty(), "receive_message.conversation_id")?;
                require(m.message_id.is_empty(), "receive_message.message_id")?;
                require(m.sender_id.is_empty(), "receive_message.sender_id")
            }
            InboundEvent::MessageSent(ack) => {
                require(ack.conversation_id.is_empty(), "message_sent.conversation_id")?;
                if ack.success && ack.message_id.as_ref().map_or(true, |id| id.is_empty()) {
                    return Err(ProtocolError::Invalid(
                        "message_sent.message_id missing on success".to_string(),
                    ));
                }
                Ok(())
            }
            InboundEvent::MessageStatusUpdate(u) => {
                require(u.conversation_id.is_empty(), "message_status_update.conversation_id")?;
                require(u.message_id.is_empty(), "message_status_update.message_id")
            }
            InboundEvent::TypingIndicator(t) => {
                require(t.conversation_id.is_empty(), "typing_indicator.conversation_id")?;
                require(t.user_id.is_empty(), "typing_indicator.user_id")
            }
            InboundEvent::UserConnected(p) | InboundEvent::UserDisconnected(p) => {
                require(p.user_id.is_empty(), "user_id")
            }
            InboundEvent::NewNotification(_) => Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::ConnectionAck(_) => "connection_ack",
            InboundEvent::ReceiveMessage(_) => "receive_message",
            InboundEvent::MessageSent(_) => "message_sent",
            InboundEvent::MessageStatusUpdate(_) => "message_status_update",
            InboundEvent::TypingIndicator(_) => "typing_indicator",
            InboundEvent::UserConnected(_) => "user_connected",
            InboundEvent::UserDisconnected(_) => "user_disconnected",
            InboundEvent::NewNotification(_) => "new_notification",
        }
    }
}

fn require(missing: bool, field: &str) -> Result<(), ProtocolError> {
    if missing {
        Err(ProtocolError::Invalid(format!("{field} is empty")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_receive_message() {
        let frame = r#"{"event":"receive_message","data":{
            "conversation_id": 5, "message_id": 42, "sender_id": 9,
            "message": "hello", "time": "2024-05-01T10:00:00Z"}}"#;
        match InboundEvent::from_frame(frame).unwrap() {
            InboundEvent::ReceiveMessage(m) => {
                assert_eq!(m.conversation_id, ConversationId::from("5"));
                assert_eq!(m.message_id, ServerMessageId::from(42));
                assert_eq!(m.message.as_deref(), Some("hello"));
                assert!(m.image.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_ack_without_data() {
        let event = InboundEvent::from_frame(r#"{"event":"connection_ack"}"#).unwrap();
        assert_eq!(event, InboundEvent::ConnectionAck(ConnectionAck::default()));
    }

    #[test]
    fn test_message_sent_defaults_to_success() {
        let frame = r#"{"event":"message_sent","data":{"conversation_id":"c1","message_id":42,"status":"sent"}}"#;
        match InboundEvent::from_frame(frame).unwrap() {
            InboundEvent::MessageSent(ack) => {
                assert!(ack.success);
                assert_eq!(ack.status, Some(MessageStatus::Sent));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_event_and_empty_ids() {
        assert!(InboundEvent::from_frame(r#"{"event":"bogus","data":{}}"#).is_err());
        assert!(InboundEvent::from_frame("not json").is_err());
        let empty = r#"{"event":"user_connected","data":{"user_id":""}}"#;
        assert!(matches!(
            InboundEvent::from_frame(empty),
            Err(ProtocolError::Invalid(_))
        ));
        let no_id = r#"{"event":"message_sent","data":{"conversation_id":"c1","success":true}}"#;
        assert!(InboundEvent::from_frame(no_id).is_err());
    }

    #[test]
    fn test_outbound_frame_shape() {
        let event = OutboundEvent::read_receipt(ConversationId::from("c1"), ServerMessageId::from(7));
        let value: serde_json::Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(value["event"], "message_status");
        assert_eq!(value["data"]["message_id"], "7");
        assert_eq!(value["data"]["status"], "read");
    }

    #[test]
    fn test_outgoing_message_omits_empty_fields() {
        let event = OutboundEvent::SendMessage(OutgoingMessage {
            conversation_id: ConversationId::from("c1"),
            receiver_id: UserId::from("u2"),
            message: Some("hi".to_string()),
            image_url: None,
            image_type: None,
            client_message_id: None,
        });
        let value: serde_json::Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(value["event"], "send_message");
        assert!(value["data"].get("image_url").is_none());
    }
}
