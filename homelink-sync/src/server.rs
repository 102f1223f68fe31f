//! WebSocket server: one task per observer.
//!
//! ```text
//! peer ──frames──► handle_connection ──route_inbound──► Hub
//!   ▲                     │
//!   └──── snapshots ◄──── Connection (outbox)
//! ```
//!
//! Every connection task multiplexes three sources: inbound frames, the
//! outbound snapshot queue and a heartbeat timer. A peer that has been silent
//! for two heartbeat periods is disconnected.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{Connection, ConnectionId};
use crate::error::BridgeError;
use crate::hub::Hub;

/// Server configuration (`[server]` in the config file).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket listen address
    #[serde(alias = "bind_addr")]
    pub ws_addr: String,
    /// Control API listen address
    #[serde(alias = "control_addr")]
    pub http_addr: String,
    /// Ping period; peers silent for two periods are dropped
    pub heartbeat_interval_secs: u64,
    /// Frames buffered per connection
    pub outbound_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: "127.0.0.1:5000".to_string(),
            http_addr: "127.0.0.1:5001".to_string(),
            heartbeat_interval_secs: 30,
            outbound_queue_capacity: 64,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// The realtime sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<Hub>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, hub: Arc<Hub>) -> Self {
        Self { config, hub }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn ws_addr(&self) -> &str {
        &self.config.ws_addr
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BridgeError> {
        let listener = TcpListener::bind(&self.config.ws_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BridgeError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let heartbeat = self.config.heartbeat_interval();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                match Self::handle_connection(stream, addr, hub, heartbeat).await {
                    Ok(()) => {}
                    Err(e) if e.is_disconnect() => log::info!("Connection from {addr} ended: {e}"),
                    Err(e) => log::error!("Connection error from {addr}: {e}"),
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Hub>,
        heartbeat: Duration,
    ) -> Result<(), BridgeError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut connection = hub.register_connection().await?;
        let id = connection.id();
        log::info!("WebSocket connection {id} established from {addr}");

        let result =
            Self::pump(&mut connection, &mut ws_sender, &mut ws_receiver, &hub, heartbeat).await;

        hub.deregister_connection(id).await;
        if let Err(e) = ws_sender.close().await {
            log::debug!("Closing socket for {id}: {e}");
        }
        result
    }

    async fn pump<S, R>(
        connection: &mut Connection,
        ws_sender: &mut S,
        ws_receiver: &mut R,
        hub: &Hub,
        heartbeat: Duration,
    ) -> Result<(), BridgeError>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let id = connection.id();
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            connection.touch();
                            Self::route(hub, id, text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            connection.touch();
                            match std::str::from_utf8(&data) {
                                Ok(text) => Self::route(hub, id, text).await,
                                Err(_) => log::warn!("Dropping non-UTF-8 frame from {id}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            connection.touch();
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => connection.touch(),
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {id} closed by peer");
                            return Ok(());
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            let e = BridgeError::from(e);
                            if e.is_disconnect() {
                                log::debug!("Peer {id} went away: {e}");
                            } else {
                                log::error!("WebSocket error on {id}: {e}");
                            }
                            return Err(e);
                        }
                    }
                }

                frame = connection.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                        None => {
                            log::info!("Connection {id} closed by hub");
                            return Ok(());
                        }
                    }
                }

                _ = ticker.tick() => {
                    let idle = connection.idle_for();
                    if idle > heartbeat * 2 {
                        log::info!("Connection {id} silent for {}s, closing", idle.as_secs());
                        return Err(BridgeError::TransportClosed);
                    }
                    ws_sender.send(Message::Ping(Default::default())).await?;
                }
            }
        }
    }

    async fn route(hub: &Hub, id: ConnectionId, text: &str) {
        match hub.route_inbound(id, text).await {
            Ok(outcome) => log::trace!("Inbound from {id}: {outcome:?}"),
            // The hub has already logged the rejection.
            Err(e) => log::debug!("Inbound from {id} failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use crate::store::MemoryStore;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.ws_addr, "127.0.0.1:5000");
        assert_eq!(config.http_addr, "127.0.0.1:5001");
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.outbound_queue_capacity, 64);
    }

    #[test]
    fn test_heartbeat_interval_never_zero() {
        let config = ServerConfig {
            heartbeat_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_server_creation() {
        let hub = Arc::new(Hub::new(Arc::new(MemoryStore::new()), HubConfig::default()));
        let config = ServerConfig {
            ws_addr: "0.0.0.0:8080".to_string(),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config, hub);
        assert_eq!(server.ws_addr(), "0.0.0.0:8080");
    }
}
