//! Socket links.
//!
//! A [`Link`] is one open bidirectional text channel. The session never
//! touches the socket directly: a [`Connector`] opens the socket and spawns
//! pump tasks that bridge it onto a pair of tokio channels. Dropping the
//! link closes the socket, so a fresh link never inherits listeners from a
//! previous one.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use tasker_shared::constants::{CHANNEL_CAPACITY, IDENTITY_QUERY_PARAM};
use tasker_shared::UserId;

use crate::error::{NetError, Result};

/// One open connection, seen from the client side.
#[derive(Debug)]
pub struct Link {
    /// Text frames to write to the socket.
    pub outbound: mpsc::Sender<String>,
    /// Text frames read from the socket. Yields `None` once the socket closes.
    pub inbound: mpsc::Receiver<String>,
}

/// The far end of an in-memory link.
#[derive(Debug)]
pub struct RemoteEnd {
    /// Push frames to the client.
    pub to_client: mpsc::Sender<String>,
    /// Frames written by the client.
    pub from_client: mpsc::Receiver<String>,
}

impl Link {
    /// Create a link backed by plain channels instead of a socket.
    pub fn in_memory(capacity: usize) -> (Link, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            Link {
                outbound: out_tx,
                inbound: in_rx,
            },
            RemoteEnd {
                to_client: in_tx,
                from_client: out_rx,
            },
        )
    }
}

/// Opens links scoped to an identity.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, identity: &UserId) -> Result<Link>;
}

/// Websocket connector. The identity travels as a query parameter.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| NetError::Url(format!("{url}: {e}")))?;
        Ok(Self {
            url,
            connect_timeout,
        })
    }

    fn url_for(&self, identity: &UserId) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair(IDENTITY_QUERY_PARAM, identity.as_str());
        url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, identity: &UserId) -> Result<Link> {
        let url = self.url_for(identity);
        debug!(url = %self.url, user = %identity, "Opening socket");

        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(|e| NetError::Connect(e.to_string()))?;

        let (mut sink, mut reader) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        // Writer: ends when the link (and with it `out_tx`) is dropped.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    warn!(error = %e, "Socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: ends on close, on error, or when the link is dropped.
        tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(frame = ?frame, "Socket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Socket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
