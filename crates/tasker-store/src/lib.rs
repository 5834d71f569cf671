//! # tasker-store
//!
//! In-memory state for the Tasker sync core.
//!
//! [`ConversationStore`] reconciles REST snapshots with realtime deltas and
//! optimistic local sends. [`NotificationAggregator`] keeps the paginated
//! notification feed and the transient toasts. Both are plain synchronous
//! state machines: they return the outbound events a mutation produced and
//! leave I/O to their owner. The `async` helpers on each are thin wrappers
//! that fetch through a [`tasker_net::RestApi`] and apply the result.

pub mod conversations;
pub mod models;
pub mod notifications;

mod error;

pub use conversations::{ConversationStore, InboundOutcome};
pub use error::{Result, StoreError};
pub use models::*;
pub use notifications::{IngestOutcome, NotificationAggregator, PageRequest};
