//! Per-observer connection state.
//!
//! Each registered observer is split in two halves:
//!
//! - [`Connection`] is handed to the transport. It drains the outbound queue
//!   and records liveness.
//! - [`ConnectionRecord`] stays in the registry. It owns the store
//!   subscription, the forwarding task and the sending side of the queue.
//!
//! Closing a record flags the outbox first, so nothing queued before the
//! close is delivered afterwards.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::store::ReleaseHandle;

/// Connection identity.
pub type ConnectionId = Uuid;

/// Last time a peer was heard from.
#[derive(Debug)]
pub struct Liveness {
    epoch: Instant,
    last_seen_ms: AtomicU64,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    /// Record activity from the peer.
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the peer was last heard from.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

#[derive(Debug, Default)]
pub(crate) struct OutboxShared {
    closed: AtomicBool,
    wake: Notify,
}

impl OutboxShared {
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Receiving side of a connection's bounded outbound queue.
pub struct Outbox {
    rx: mpsc::Receiver<Arc<str>>,
    shared: Arc<OutboxShared>,
}

impl Outbox {
    /// Next frame to write, `None` once the connection has been closed.
    ///
    /// Frames still queued at close time are discarded.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        if self.shared.is_closed() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shared.wake.notified() => None,
            frame = self.rx.recv() => frame.filter(|_| !self.shared.is_closed()),
        }
    }
}

/// Transport-facing half of a registered observer.
pub struct Connection {
    id: ConnectionId,
    outbox: Outbox,
    liveness: Arc<Liveness>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next outbound snapshot frame.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.outbox.recv().await
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.liveness.touch();
    }

    pub fn idle_for(&self) -> Duration {
        self.liveness.idle_for()
    }

    /// Whether the hub has closed this connection.
    pub fn is_closed(&self) -> bool {
        self.outbox.shared.is_closed()
    }
}

/// Registry-side half of a registered observer.
pub(crate) struct ConnectionRecord {
    id: ConnectionId,
    sender: mpsc::Sender<Arc<str>>,
    outbox: Arc<OutboxShared>,
    liveness: Arc<Liveness>,
    release: Option<ReleaseHandle>,
    forwarder: Option<JoinHandle<()>>,
    opened_at: Instant,
}

impl ConnectionRecord {
    /// Create both halves around a queue of `capacity` frames.
    pub(crate) fn open(id: ConnectionId, capacity: usize) -> (Self, Connection) {
        let (sender, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(OutboxShared::default());
        let liveness = Arc::new(Liveness::new());
        let record = Self {
            id,
            sender,
            outbox: shared.clone(),
            liveness: liveness.clone(),
            release: None,
            forwarder: None,
            opened_at: Instant::now(),
        };
        let connection = Connection {
            id,
            outbox: Outbox { rx, shared },
            liveness,
        };
        (record, connection)
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Arc<str>> {
        &self.sender
    }

    pub(crate) fn attach(&mut self, release: ReleaseHandle, forwarder: JoinHandle<()>) {
        self.release = Some(release);
        self.forwarder = Some(forwarder);
    }

    /// Stop delivery, release the subscription and stop forwarding.
    pub(crate) fn close(mut self) {
        self.outbox.close();
        if let Some(release) = self.release.take() {
            release.release();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        log::debug!("Closed connection {}", self.id);
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            idle_ms: self.liveness.idle_for().as_millis() as u64,
            open_ms: self.opened_at.elapsed().as_millis() as u64,
            queued: self.sender.max_capacity() - self.sender.capacity(),
        }
    }
}

/// Point-in-time view of one live connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub idle_ms: u64,
    pub open_ms: u64,
    pub queued: usize,
}
