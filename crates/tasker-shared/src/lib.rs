//! Types shared by every layer of the Tasker sync core: identifiers, the
//! realtime wire protocol, REST payloads and protocol constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod rest;
pub mod types;

pub use error::ProtocolError;
pub use types::{
    ConnectionState, ConversationId, MessageId, MessageStatus, NotificationId, ServerMessageId,
    UserId,
};
