//! Headless sync client.
//!
//! Logs in with `TASKER_USER_ID` / `TASKER_TOKEN`, then prints every UI
//! event as a JSON line until interrupted.

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use tasker_client::{init_tracing, Client, ClientConfig};
use tasker_shared::UserId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let user = std::env::var("TASKER_USER_ID").context("TASKER_USER_ID is not set")?;
    let token = std::env::var("TASKER_TOKEN").context("TASKER_TOKEN is not set")?;

    let client = Client::login(&config, UserId::from(user), &token)
        .await
        .context("Failed to start client")?;
    let mut events = client.engine().subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped UI events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
