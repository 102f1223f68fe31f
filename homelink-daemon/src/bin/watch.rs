//! homelink-watch: follow the bridge from the command line.
//!
//! Connects as an observer, reconnects on failure and logs every snapshot
//! with the recent sensor history.
//!
//! Usage: `homelink-watch [CONFIG]`.

use anyhow::{Context, Result};
use log::{info, warn};
use std::path::PathBuf;

use homelink_core::Metric;
use homelink_sync::client::{ClientEvent, ReconnectingClient};
use homelink_sync::config::BridgeConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1).map(PathBuf::from).or_else(BridgeConfig::discover);
    let config = match &path {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    let mut client = ReconnectingClient::connect_ws(&config.client);
    let mut events = client
        .take_event_rx()
        .context("client event receiver already taken")?;
    info!("Watching {}", config.client.url);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Connected) => info!("Connected to {}", config.client.url),
                Some(ClientEvent::Disconnected) => warn!("Disconnected from {}", config.client.url),
                Some(ClientEvent::ReconnectScheduled { attempt, delay }) => {
                    info!("Reconnect attempt {attempt} in {}ms", delay.as_millis());
                }
                Some(ClientEvent::Snapshot(tree)) => {
                    info!("State: {}", serde_json::to_string(&tree)?);
                    let history = client.history().await;
                    for metric in Metric::ALL {
                        info!("  {:<11} {:?}", metric.name(), history.values(metric));
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.dispose().await;
    Ok(())
}
