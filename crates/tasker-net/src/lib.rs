// Realtime transport, REST collaborator and presence tracking.

pub mod error;
pub mod presence;
pub mod rest;
pub mod session;
pub mod transport;

pub use error::{NetError, Result};
pub use presence::{PresenceRecord, PresenceTracker};
pub use rest::{HttpRestClient, RestApi};
pub use session::{SessionConfig, TransportEvent, TransportSession};
pub use transport::{Connector, Link, RemoteEnd, WsConnector};
