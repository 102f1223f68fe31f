//! homelinkd: the home state bridge.
//!
//! Runs the hub over an in-memory state store, the WebSocket server for
//! observers and sensor producers, and the HTTP control API.
//!
//! Usage: `homelinkd [CONFIG]`. Without an argument, `homelink.toml` and
//! `config/homelink.toml` are tried before falling back to defaults.

use anyhow::{Context, Result};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use homelink_sync::config::BridgeConfig;
use homelink_sync::control;
use homelink_sync::hub::Hub;
use homelink_sync::server::SyncServer;
use homelink_sync::store::{DynStore, MemoryStore};

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
    match &path {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    let store: DynStore = Arc::new(MemoryStore::new());
    let hub = Arc::new(Hub::new(store, config.hub_config()));
    if hub.ensure_layout().await? {
        info!("Seeded default state layout");
    }

    let http_listener = TcpListener::bind(&config.server.http_addr)
        .await
        .with_context(|| format!("binding control API address {}", config.server.http_addr))?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let control = tokio::spawn(control::serve_with_shutdown(
        http_listener,
        hub.clone(),
        async move {
            let _ = stop_rx.await;
        },
    ));

    let server = SyncServer::new(config.server.clone(), hub.clone());
    tokio::select! {
        result = server.run() => {
            result.with_context(|| format!("sync server on {} stopped", server.ws_addr()))?;
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    hub.shutdown().await;
    let _ = stop_tx.send(());
    control.await?.context("control API stopped")?;
    Ok(())
}
