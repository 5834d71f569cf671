use thiserror::Error;

use tasker_shared::ProtocolError;

/// Errors produced by the transport and REST layers.
#[derive(Error, Debug)]
pub enum NetError {
    /// The socket could not be opened.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Opening the socket took longer than allowed.
    #[error("Connection attempt timed out")]
    Timeout,

    /// No acknowledged link is available for sending.
    #[error("Not connected")]
    NotConnected,

    /// The session actor or a link pump has gone away.
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Outbound queue of the current link is full.
    #[error("Outbound queue full")]
    QueueFull,

    /// Network-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx HTTP response.
    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    /// Response body did not match the expected shape.
    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Invalid base URL in configuration.
    #[error("Invalid URL: {0}")]
    Url(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl NetError {
    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetError::Status { status, .. } => *status >= 500 || *status == 429,
            NetError::Decode(_) | NetError::Url(_) | NetError::Protocol(_) => false,
            _ => true,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;
