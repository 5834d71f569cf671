use thiserror::Error;

use tasker_net::NetError;
use tasker_store::StoreError;

/// Errors surfaced to users of the sync core.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Net(#[from] NetError),

    /// The engine task has stopped; the handle is stale.
    #[error("Sync engine is not running")]
    EngineStopped,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
