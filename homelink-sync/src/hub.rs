//! The hub: one authoritative store, many observers.
//!
//! ```text
//!   mutation / ingestion ──► Hub ──write──► StateStore
//!                                              │
//!                         subscription (root)  │ one per connection
//!                                              ▼
//!                 Forwarder ──try_send──► bounded outbox ──► transport
//! ```
//!
//! The hub keeps no copy of the document. Every accepted write reaches
//! every observer, the writer included, through its store subscription, in
//! store order. An observer that cannot keep up is disconnected rather than
//! served a gapped stream.

use homelink_core::schema::SENSORS;
use homelink_core::{MutationRequest, Schema, SensorReading, SensorRecord, ServerClock, StatePath};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionId, ConnectionInfo, ConnectionRecord};
use crate::error::BridgeError;
use crate::protocol::{encode_snapshot, InboundMessage, ProtocolError};
use crate::registry::ConnectionRegistry;
use crate::store::{ChangeStream, DynStore, StoreError, Versioned};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Writable schema mutations are validated against
    pub schema: Schema,
    /// Frames buffered per connection before it is dropped as too slow
    pub outbound_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            schema: Schema::default(),
            outbound_queue_capacity: 64,
        }
    }
}

/// Counters for monitoring the hub.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HubStats {
    pub connections_total: u64,
    pub connections_active: usize,
    pub mutations_accepted: u64,
    pub mutations_rejected: u64,
    pub sensor_ingests: u64,
    pub snapshots_queued: u64,
    pub duplicates_skipped: u64,
    pub overflow_disconnects: u64,
    pub inbound_ignored: u64,
    pub inbound_malformed: u64,
}

/// Lock-free counters behind [`HubStats`].
#[derive(Default)]
struct AtomicHubStats {
    connections_total: AtomicU64,
    mutations_accepted: AtomicU64,
    mutations_rejected: AtomicU64,
    sensor_ingests: AtomicU64,
    snapshots_queued: AtomicU64,
    duplicates_skipped: AtomicU64,
    overflow_disconnects: AtomicU64,
    inbound_ignored: AtomicU64,
    inbound_malformed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Result of an accepted mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationAck {
    pub path: StatePath,
    pub value: Value,
    pub revision: u64,
}

/// What the hub did with an inbound transport message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    Ingested(SensorRecord),
    Applied(MutationAck),
    Ignored(String),
}

/// Central coordinator between the store and connected observers.
pub struct Hub {
    store: DynStore,
    config: HubConfig,
    clock: ServerClock,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<AtomicHubStats>,
    /// Keeps store order equal to timestamp order for ingested readings
    ingest_lock: Mutex<()>,
}

impl Hub {
    pub fn new(store: DynStore, config: HubConfig) -> Self {
        Self::with_clock(store, config, ServerClock::new())
    }

    /// Hub with an explicit timestamp clock.
    pub fn with_clock(store: DynStore, config: HubConfig, clock: ServerClock) -> Self {
        Self {
            store,
            config,
            clock,
            registry: Arc::new(ConnectionRegistry::new()),
            stats: Arc::new(AtomicHubStats::default()),
            ingest_lock: Mutex::new(()),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.config.schema
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    /// Validate a mutation and apply it as exactly one store write.
    ///
    /// Observers learn about the change through their subscriptions, never
    /// from this call.
    pub async fn accept_mutation(&self, req: &MutationRequest) -> Result<MutationAck, BridgeError> {
        let write = match self.config.schema.resolve(req) {
            Ok(write) => write,
            Err(e) => {
                bump(&self.stats.mutations_rejected);
                log::warn!("Rejected mutation: {e}");
                return Err(e.into());
            }
        };

        let revision = self
            .store
            .write(&write.path, write.value.clone())
            .await
            .map_err(|e| {
                log::error!("Write to '{}' failed: {e}", write.path);
                BridgeError::from(e)
            })?;

        bump(&self.stats.mutations_accepted);
        log::debug!("Applied '{}' = {} at revision {revision}", write.path, write.value);
        Ok(MutationAck {
            path: write.path,
            value: write.value,
            revision,
        })
    }

    /// Register a new observer.
    ///
    /// The root subscription is taken before the snapshot is read, so no
    /// write can fall between the two; notifications at or below the
    /// snapshot's revision are skipped by the forwarder.
    pub async fn register_connection(&self) -> Result<Connection, BridgeError> {
        let root = StatePath::root();
        let subscription = self.store.subscribe(&root).await?;
        let initial = match self.store.read(&root).await {
            Ok(versioned) => versioned,
            Err(StoreError::NotFound(_)) => Versioned {
                revision: 0,
                value: Arc::new(Value::Null),
            },
            Err(e) => return Err(e.into()),
        };
        let frame = encode_document(&initial.value)?;

        let id = Uuid::new_v4();
        let (mut record, connection) =
            ConnectionRecord::open(id, self.config.outbound_queue_capacity);
        if record.sender().try_send(frame).is_ok() {
            bump(&self.stats.snapshots_queued);
        }

        let (changes, release) = subscription.into_parts();
        let forwarder = Forwarder {
            id,
            sender: record.sender().clone(),
            delivered: initial.revision,
            registry: Arc::downgrade(&self.registry),
            stats: self.stats.clone(),
        };
        self.registry
            .insert_with(id, move || {
                record.attach(release, tokio::spawn(forwarder.run(changes)));
                record
            })
            .await;

        bump(&self.stats.connections_total);
        log::info!("Registered connection {id} at revision {}", initial.revision);
        Ok(connection)
    }

    /// Remove an observer. Idempotent; nothing is delivered afterwards.
    pub async fn deregister_connection(&self, id: ConnectionId) -> bool {
        let removed = self.registry.evict(&id).await;
        if removed {
            log::info!("Deregistered connection {id}");
        }
        removed
    }

    /// Stamp a reading and store it as the whole `sensors` subtree.
    pub async fn ingest_sensor(&self, reading: SensorReading) -> Result<SensorRecord, BridgeError> {
        reading.validate()?;

        let _order = self.ingest_lock.lock().await;
        let timestamp = self.clock.stamp().map_err(|e| {
            log::error!("Cannot stamp reading: {e}");
            BridgeError::from(e)
        })?;
        let record = reading.stamp(timestamp);
        let value = serde_json::to_value(record)
            .map_err(|e| BridgeError::MalformedMessage(e.to_string()))?;
        self.store
            .write(&StatePath::root().child(SENSORS), value)
            .await
            .map_err(|e| {
                log::error!("Sensor write failed: {e}");
                BridgeError::from(e)
            })?;

        bump(&self.stats.sensor_ingests);
        log::debug!(
            "Ingested reading t={} h={} at {}",
            record.temperature,
            record.humidity,
            record.timestamp
        );
        Ok(record)
    }

    /// Current document; an empty store reads as `{}`.
    pub async fn snapshot(&self) -> Result<Arc<Value>, BridgeError> {
        match self.store.read(&StatePath::root()).await {
            Ok(versioned) => Ok(versioned.value),
            Err(StoreError::NotFound(_)) => Ok(Arc::new(Value::Object(Map::new()))),
            Err(e) => Err(e.into()),
        }
    }

    /// Seed top-level entries of the default document that the store lacks,
    /// and make future sensor timestamps exceed any already persisted.
    ///
    /// Returns whether anything was written.
    pub async fn ensure_layout(&self) -> Result<bool, BridgeError> {
        let current = self.snapshot().await?;
        if let Some(ts) = current.pointer("/sensors/timestamp").and_then(Value::as_u64) {
            self.clock.observe(ts);
        }

        let Value::Object(defaults) = self.config.schema.default_tree().to_value() else {
            return Ok(false);
        };
        let mut seeded = false;
        for (key, value) in defaults {
            if current.get(&key).is_some_and(|v| !v.is_null()) {
                continue;
            }
            self.store.write(&StatePath::root().child(&key), value).await?;
            log::info!("Seeded missing '{key}'");
            seeded = true;
        }
        Ok(seeded)
    }

    /// Dispatch one inbound transport message by its `type` tag.
    pub async fn route_inbound(&self, from: ConnectionId, text: &str) -> Result<InboundOutcome, BridgeError> {
        let message = InboundMessage::parse(text, &self.config.schema).map_err(|e| {
            bump(&self.stats.inbound_malformed);
            log::warn!("Malformed message from {from}: {e}");
            BridgeError::from(e)
        })?;

        match message {
            InboundMessage::Sensor(reading) => {
                self.ingest_sensor(reading).await.map(InboundOutcome::Ingested)
            }
            InboundMessage::Mutation(req) => {
                self.accept_mutation(&req).await.map(InboundOutcome::Applied)
            }
            InboundMessage::Unrecognized(tag) => {
                bump(&self.stats.inbound_ignored);
                log::warn!("Ignoring message with type '{tag}' from {from}");
                Ok(InboundOutcome::Ignored(tag))
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    pub async fn is_registered(&self, id: &ConnectionId) -> bool {
        self.registry.contains(id).await
    }

    /// Live connections.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.infos().await
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> HubStats {
        let s = &self.stats;
        HubStats {
            connections_total: s.connections_total.load(Ordering::Relaxed),
            connections_active: self.registry.len().await,
            mutations_accepted: s.mutations_accepted.load(Ordering::Relaxed),
            mutations_rejected: s.mutations_rejected.load(Ordering::Relaxed),
            sensor_ingests: s.sensor_ingests.load(Ordering::Relaxed),
            snapshots_queued: s.snapshots_queued.load(Ordering::Relaxed),
            duplicates_skipped: s.duplicates_skipped.load(Ordering::Relaxed),
            overflow_disconnects: s.overflow_disconnects.load(Ordering::Relaxed),
            inbound_ignored: s.inbound_ignored.load(Ordering::Relaxed),
            inbound_malformed: s.inbound_malformed.load(Ordering::Relaxed),
        }
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        let closed = self.registry.clear().await;
        log::info!("Hub shut down, closed {closed} connections");
    }
}

/// Serialize a document for the wire; a deleted root goes out as `{}`.
fn encode_document(value: &Value) -> Result<Arc<str>, ProtocolError> {
    if value.is_null() {
        encode_snapshot(&Value::Object(Map::new()))
    } else {
        encode_snapshot(value)
    }
}

/// Moves store notifications for one connection into its outbox.
struct Forwarder {
    id: ConnectionId,
    sender: mpsc::Sender<Arc<str>>,
    delivered: u64,
    registry: Weak<ConnectionRegistry>,
    stats: Arc<AtomicHubStats>,
}

impl Forwarder {
    async fn run(mut self, mut changes: ChangeStream) {
        while let Some(change) = changes.recv().await {
            if change.revision <= self.delivered {
                bump(&self.stats.duplicates_skipped);
                log::trace!("Skipping revision {} for {}", change.revision, self.id);
                continue;
            }

            let frame = match encode_document(&change.value) {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Failed to encode revision {}: {e}", change.revision);
                    continue;
                }
            };

            match self.sender.try_send(frame) {
                Ok(()) => {
                    self.delivered = change.revision;
                    bump(&self.stats.snapshots_queued);
                }
                Err(TrySendError::Full(_)) => {
                    bump(&self.stats.overflow_disconnects);
                    log::warn!(
                        "Connection {} fell {} snapshots behind, disconnecting",
                        self.id,
                        self.sender.max_capacity()
                    );
                    self.evict().await;
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Outbox for {} dropped", self.id);
                    self.evict().await;
                    return;
                }
            }
        }
    }

    async fn evict(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.evict(&self.id).await;
        }
    }
}
