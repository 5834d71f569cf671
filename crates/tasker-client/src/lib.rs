//! # tasker-client
//!
//! Client-side realtime sync core for the Tasker marketplace.
//!
//! A [`Client`] is created on login and dropped on logout. It owns the
//! transport session for the signed-in identity and the [`SyncEngine`]
//! task that keeps conversations, notifications and presence in sync.

pub mod config;
pub mod engine;
pub mod events;
pub mod state;

mod error;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use tasker_net::{Connector, HttpRestClient, RestApi, TransportSession, WsConnector};
use tasker_shared::{ConnectionState, UserId};

pub use crate::config::ClientConfig;
pub use crate::engine::{EngineHandle, EngineSettings, SyncEngine};
pub use crate::error::{ClientError, Result};
pub use crate::events::UiEvent;
pub use crate::state::{ConversationSummary, EngineView};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("tasker_client=debug,tasker_net=debug,tasker_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Session of one authenticated user.
pub struct Client {
    identity: UserId,
    transport: TransportSession,
    engine: EngineHandle,
}

impl Client {
    /// Wire up the engine and connect the transport as `identity`.
    pub async fn start<C: Connector>(
        config: &ClientConfig,
        identity: UserId,
        api: Arc<dyn RestApi>,
        connector: C,
    ) -> Result<Self> {
        let transport = TransportSession::spawn(connector, config.session_config());
        let engine = SyncEngine::spawn(
            identity.clone(),
            api,
            transport.clone(),
            EngineSettings::from(config),
        );
        transport.connect(identity.clone()).await?;

        info!(user = %identity, "Client started");
        Ok(Self {
            identity,
            transport,
            engine,
        })
    }

    /// Production wiring: REST over HTTPS with `token`, websocket transport.
    pub async fn login(config: &ClientConfig, identity: UserId, token: &str) -> Result<Self> {
        let api = HttpRestClient::new(&config.api_url, token, config.request_timeout)?;
        let connector = WsConnector::new(&config.socket_url, config.request_timeout)?;
        Self::start(config, identity, Arc::new(api), connector).await
    }

    pub fn identity(&self) -> &UserId {
        &self.identity
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub async fn connection_state(&self) -> Result<ConnectionState> {
        Ok(self.transport.state().await?)
    }

    /// Connect again after the session went offline.
    pub async fn reconnect(&self) -> Result<()> {
        Ok(self.transport.connect(self.identity.clone()).await?)
    }

    /// Tear everything down. Used on logout.
    pub async fn shutdown(self) {
        info!(user = %self.identity, "Client shutting down");
        self.engine.shutdown().await;
        let _ = self.transport.disconnect().await;
        self.transport.shutdown().await;
    }
}
