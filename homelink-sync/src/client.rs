//! Reconnecting observer client.
//!
//! ```text
//!            connect ok                    close / error
//! Connecting ──────────► Connected ─────────────────────► Disconnected
//!     ▲  │ connect failed                                     │
//!     │  └────────────────────────────────────────────────────┤
//!     └───────────── backoff.next_delay() elapsed ◄───────────┘
//! ```
//!
//! One driver task owns the transport, the reconnect timer and the backoff
//! policy, so there is never more than one timer outstanding. Every snapshot
//! replaces the local mirror wholesale; sensor readings that change are also
//! appended to a bounded history.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use homelink_core::sensor::epoch_millis;
use homelink_core::{HistoryBuffer, StateTree, HISTORY_CAPACITY};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::backoff::{BackoffConfig, BackoffPolicy};
use crate::protocol::{decode_snapshot, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Transport open
    Connected,
    /// Transport lost or connect attempt failed
    Disconnected,
    /// A snapshot replaced the mirror
    Snapshot(StateTree),
    /// Reconnect timer armed
    ReconnectScheduled { attempt: u32, delay: Duration },
}

/// Inbound text frames from one open transport.
pub type InboundStream = BoxStream<'static, Result<String, ProtocolError>>;

/// Opens transports to the hub.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<InboundStream, ProtocolError>;
}

/// WebSocket connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<InboundStream, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;

        // Reading also flushes the pongs tungstenite queues for server pings.
        let frames = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => Some(
                    String::from_utf8(data.to_vec())
                        .map_err(|e| ProtocolError::Malformed(e.to_string())),
                ),
                Ok(Message::Close(_)) => Some(Err(ProtocolError::ConnectionClosed)),
                Ok(_) => None,
                Err(e) => Some(Err(ProtocolError::Transport(e.to_string()))),
            }
        });
        Ok(frames.boxed())
    }
}

/// Local mirror of the hub's document plus the derived history.
#[derive(Debug, Clone)]
pub struct SyncState {
    tree: Option<StateTree>,
    history: HistoryBuffer,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl SyncState {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            tree: None,
            history: HistoryBuffer::new(history_capacity),
        }
    }

    /// Replace the mirror. History grows only when the sensor reading
    /// differs from the previous snapshot's. Returns the samples appended.
    pub fn apply(&mut self, tree: StateTree, received_at: u64) -> usize {
        let changed = self
            .tree
            .as_ref()
            .map_or(true, |prev| tree.sensors.reading_differs(&prev.sensors));
        let appended = if changed {
            self.history.record(&tree.sensors, received_at)
        } else {
            0
        };
        self.tree = Some(tree);
        appended
    }

    pub fn tree(&self) -> Option<&StateTree> {
        self.tree.as_ref()
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }
}

fn default_url() -> String {
    "ws://127.0.0.1:5000".to_string()
}

/// Client configuration (`[client]` in the config file).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub history_capacity: usize,
    pub event_capacity: usize,
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            history_capacity: HISTORY_CAPACITY,
            event_capacity: 256,
            backoff: BackoffConfig::default(),
        }
    }
}

struct ClientShared {
    state: RwLock<ConnectionState>,
    sync: RwLock<SyncState>,
    connect_attempts: AtomicU64,
    snapshots_applied: AtomicU64,
    malformed_messages: AtomicU64,
}

/// Observer that stays connected until disposed.
pub struct ReconnectingClient {
    shared: Arc<ClientShared>,
    cancel: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl ReconnectingClient {
    /// Spawn the driver task and start connecting immediately.
    pub fn start(
        connector: impl Connector,
        backoff: Box<dyn BackoffPolicy>,
        history_capacity: usize,
        event_capacity: usize,
    ) -> Self {
        let shared = Arc::new(ClientShared {
            state: RwLock::new(ConnectionState::Disconnected),
            sync: RwLock::new(SyncState::new(history_capacity)),
            connect_attempts: AtomicU64::new(0),
            snapshots_applied: AtomicU64::new(0),
            malformed_messages: AtomicU64::new(0),
        });
        let (cancel, cancel_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel(event_capacity.max(1));

        let driver = Driver {
            connector,
            backoff,
            shared: shared.clone(),
            events: event_tx,
            cancel: cancel_rx,
        };

        Self {
            shared,
            cancel,
            driver: Some(tokio::spawn(driver.run())),
            event_rx: Some(event_rx),
        }
    }

    /// WebSocket client built from configuration.
    pub fn connect_ws(config: &ClientConfig) -> Self {
        Self::start(
            WsConnector::new(&config.url),
            config.backoff.build(),
            config.history_capacity,
            config.event_capacity,
        )
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Latest mirrored document, if any snapshot has arrived.
    pub async fn tree(&self) -> Option<StateTree> {
        self.shared.sync.read().await.tree().cloned()
    }

    pub async fn history(&self) -> HistoryBuffer {
        self.shared.sync.read().await.history().clone()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn snapshots_applied(&self) -> u64 {
        self.shared.snapshots_applied.load(Ordering::Relaxed)
    }

    pub fn malformed_messages(&self) -> u64 {
        self.shared.malformed_messages.load(Ordering::Relaxed)
    }

    /// Close the transport, cancel any pending reconnect and wait for the
    /// driver to stop.
    pub async fn dispose(mut self) {
        self.cancel.send_replace(true);
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                log::error!("Client driver ended abnormally: {e}");
            }
        }
    }
}

impl Drop for ReconnectingClient {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

struct Driver<C> {
    connector: C,
    backoff: Box<dyn BackoffPolicy>,
    shared: Arc<ClientShared>,
    events: mpsc::Sender<ClientEvent>,
    cancel: watch::Receiver<bool>,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            if *self.cancel.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting).await;
            self.shared.connect_attempts.fetch_add(1, Ordering::Relaxed);
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.changed() => break,
                result = self.connector.connect() => result,
            };

            match attempt {
                Ok(stream) => {
                    failures = 0;
                    self.backoff.reset();
                    self.set_state(ConnectionState::Connected).await;
                    self.emit(ClientEvent::Connected);
                    log::info!("Connected to hub");

                    if !self.read(stream).await {
                        break;
                    }
                    log::warn!("Connection to hub lost");
                }
                Err(e) => log::warn!("Connect attempt failed: {e}"),
            }

            self.set_state(ConnectionState::Disconnected).await;
            self.emit(ClientEvent::Disconnected);

            failures = failures.saturating_add(1);
            let delay = self.backoff.next_delay();
            log::info!("Reconnecting in {}ms (attempt {failures})", delay.as_millis());
            self.emit(ClientEvent::ReconnectScheduled {
                attempt: failures,
                delay,
            });

            tokio::select! {
                biased;
                _ = self.cancel.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        log::info!("Client stopped");
    }

    /// Consume one transport. Returns `false` if the client was disposed.
    async fn read(&mut self, mut stream: InboundStream) -> bool {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.changed() => return false,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(text)) => self.apply(&text).await,
                Some(Err(ProtocolError::Malformed(reason))) => {
                    self.shared.malformed_messages.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Dropping undecodable frame: {reason}");
                }
                Some(Err(e)) => {
                    log::debug!("Transport ended: {e}");
                    return true;
                }
                None => return true,
            }
        }
    }

    async fn apply(&mut self, text: &str) {
        let tree = match decode_snapshot(text) {
            Ok(tree) => tree,
            Err(e) => {
                self.shared.malformed_messages.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping malformed snapshot: {e}");
                return;
            }
        };

        let appended = self
            .shared
            .sync
            .write()
            .await
            .apply(tree.clone(), epoch_millis());
        self.shared.snapshots_applied.fetch_add(1, Ordering::Relaxed);
        log::debug!("Applied snapshot ({appended} history samples)");
        self.emit(ClientEvent::Snapshot(tree));
    }

    async fn set_state(&mut self, state: ConnectionState) {
        *self.shared.state.write().await = state;
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::trace!("Client event dropped: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ConstantBackoff;
    use futures_util::stream;
    use homelink_core::history::Metric;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    enum Step {
        Fail,
        /// Open, deliver frames, then close
        Serve(Vec<String>),
        /// Open, deliver frames, then stay open
        Hold(Vec<String>),
    }

    #[derive(Clone)]
    struct ScriptedConnector {
        script: Arc<Mutex<VecDeque<Step>>>,
        attempts: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedConnector {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                script: Arc::new(Mutex::new(steps.into())),
                attempts: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<InboundStream, ProtocolError> {
            self.attempts.lock().unwrap().push(Instant::now());
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Fail);
            match step {
                Step::Fail => Err(ProtocolError::Transport("connection refused".into())),
                Step::Serve(frames) => Ok(stream::iter(frames.into_iter().map(Ok)).boxed()),
                Step::Hold(frames) => Ok(stream::iter(frames.into_iter().map(Ok))
                    .chain(stream::pending())
                    .boxed()),
            }
        }
    }

    fn snapshot(fan: bool, temperature: f64, timestamp: u64) -> String {
        json!({
            "fan": fan,
            "leds": [null, false, false, false, false],
            "sensors": {"temperature": temperature, "humidity": 50.0, "timestamp": timestamp}
        })
        .to_string()
    }

    fn client(connector: ScriptedConnector) -> ReconnectingClient {
        ReconnectingClient::start(
            connector,
            Box::new(ConstantBackoff::new(Duration::from_secs(3))),
            HISTORY_CAPACITY,
            64,
        )
    }

    async fn wait_for(
        rx: &mut mpsc::Receiver<ClientEvent>,
        mut pred: impl FnMut(&ClientEvent) -> bool,
    ) -> Vec<ClientEvent> {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.expect("event channel closed");
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[test]
    fn test_sync_state_replaces_mirror_and_dedupes_history() {
        let mut state = SyncState::default();
        let first = decode_snapshot(&snapshot(false, 20.0, 1)).unwrap();
        assert_eq!(state.apply(first, 100), 2);

        // Device change only; reading unchanged.
        let second = decode_snapshot(&snapshot(true, 20.0, 1)).unwrap();
        assert_eq!(state.apply(second, 200), 0);
        assert_eq!(state.tree().unwrap().switch("fan"), Some(true));

        let third = decode_snapshot(&snapshot(true, 21.0, 2)).unwrap();
        assert_eq!(state.apply(third, 300), 2);
        assert_eq!(state.history().values(Metric::Temperature), vec![20.0, 21.0]);
        assert_eq!(state.history().latest(Metric::Temperature).unwrap().timestamp, 2);
    }

    #[test]
    fn test_sync_state_history_is_bounded() {
        let mut state = SyncState::default();
        for i in 0..15u64 {
            let tree = decode_snapshot(&snapshot(false, i as f64, i + 1)).unwrap();
            state.apply(tree, 0);
        }
        let expected: Vec<f64> = (5..15).map(|i| i as f64).collect();
        assert_eq!(state.history().values(Metric::Temperature), expected);
        assert_eq!(state.history().len(Metric::Humidity), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_at_configured_interval() {
        let connector = ScriptedConnector::new(vec![
            Step::Serve(vec![snapshot(false, 20.0, 1)]),
            Step::Fail,
            Step::Fail,
            Step::Hold(vec![snapshot(true, 20.0, 1)]),
        ]);
        let mut client = client(connector.clone());
        let mut rx = client.take_event_rx().unwrap();

        let mut connected = 0;
        let events = wait_for(&mut rx, |e| {
            if *e == ClientEvent::Connected {
                connected += 1;
            }
            connected == 2
        })
        .await;

        let scheduled: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::ReconnectScheduled { attempt, delay } => Some((*attempt, *delay)),
                _ => None,
            })
            .collect();
        assert_eq!(
            scheduled,
            vec![
                (1, Duration::from_secs(3)),
                (2, Duration::from_secs(3)),
                (3, Duration::from_secs(3)),
            ]
        );

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(3));
        }

        assert_eq!(client.connection_state().await, ConnectionState::Connected);
        assert_eq!(client.connect_attempts(), 4);
        client.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_pending_reconnect() {
        let connector = ScriptedConnector::new(vec![Step::Fail]);
        let mut client = client(connector.clone());
        let mut rx = client.take_event_rx().unwrap();

        wait_for(&mut rx, |e| matches!(e, ClientEvent::ReconnectScheduled { .. })).await;
        client.dispose().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_closes_open_transport() {
        let connector = ScriptedConnector::new(vec![Step::Hold(vec![])]);
        let mut client = client(connector.clone());
        let mut rx = client.take_event_rx().unwrap();

        wait_for(&mut rx, |e| *e == ClientEvent::Connected).await;
        client.dispose().await;

        // Driver is gone: no disconnect handling, no reconnect.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts().len(), 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_driver() {
        let connector = ScriptedConnector::new(vec![Step::Fail]);
        let mut client = client(connector.clone());
        let mut rx = client.take_event_rx().unwrap();
        wait_for(&mut rx, |e| matches!(e, ClientEvent::ReconnectScheduled { .. })).await;

        drop(client);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshots_replace_mirror_and_skip_garbage() {
        let connector = ScriptedConnector::new(vec![Step::Hold(vec![
            snapshot(false, 20.0, 1),
            "{not json".to_string(),
            "[1, 2, 3]".to_string(),
            snapshot(true, 22.5, 2),
        ])]);
        let mut client = client(connector);
        let mut rx = client.take_event_rx().unwrap();

        let mut snapshots = 0;
        wait_for(&mut rx, |e| {
            if matches!(e, ClientEvent::Snapshot(_)) {
                snapshots += 1;
            }
            snapshots == 2
        })
        .await;

        let tree = client.tree().await.unwrap();
        assert_eq!(tree.switch("fan"), Some(true));
        assert_eq!(tree.sensors.temperature, Some(22.5));
        assert_eq!(client.history().await.values(Metric::Temperature), vec![20.0, 22.5]);
        assert_eq!(client.snapshots_applied(), 2);
        assert_eq!(client.malformed_messages(), 2);
        assert_eq!(client.connection_state().await, ConnectionState::Connected);
        client.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_connect() {
        let connector = ScriptedConnector::new(vec![
            Step::Fail,
            Step::Fail,
            Step::Serve(vec![]),
            Step::Hold(vec![]),
        ]);
        let backoff = crate::backoff::ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
        );
        let mut client = ReconnectingClient::start(connector.clone(), Box::new(backoff), 10, 64);
        let mut rx = client.take_event_rx().unwrap();

        let mut connected = 0;
        let events = wait_for(&mut rx, |e| {
            if *e == ClientEvent::Connected {
                connected += 1;
            }
            connected == 2
        })
        .await;
        let delays: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::ReconnectScheduled { delay, .. } => Some(delay.as_secs()),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![1, 2, 1]);
        client.dispose().await;
    }
}
