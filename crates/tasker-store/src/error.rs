use thiserror::Error;

use tasker_net::NetError;
use tasker_shared::ConversationId;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No conversation with this id is loaded.
    #[error("Unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    /// The server archived the conversation; sending is disabled.
    #[error("Conversation {0} is archived")]
    Archived(ConversationId),

    /// Text message without any visible content.
    #[error("Message is empty")]
    EmptyMessage,

    /// A notification page fetch is already outstanding.
    #[error("Notification page {page} is still loading")]
    FetchInFlight { page: u32 },

    /// REST collaborator failure.
    #[error(transparent)]
    Net(#[from] NetError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
