//! In-process reference implementation of [`StateStore`].
//!
//! Holds the document as one JSON tree behind a mutex. Notifications are
//! dispatched while the lock is held, so every subscriber observes writes in
//! the same order. Channel sends never block, so dispatch cannot stall on a
//! slow consumer.
//!
//! Write semantics follow the hosted store the bridge was built against:
//! intermediate objects are created on demand, numeric segments index into
//! existing arrays, and writing `null` deletes.

use async_trait::async_trait;
use homelink_core::StatePath;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

use super::{ReleaseHandle, StateStore, StoreError, Subscription, Versioned};

struct Subscriber {
    path: StatePath,
    tx: mpsc::UnboundedSender<Versioned>,
}

#[derive(Default)]
struct Inner {
    root: Value,
    revision: u64,
    next_subscriber: u64,
    subscribers: HashMap<u64, Subscriber>,
}

impl Inner {
    /// Notify every subscriber whose subtree overlaps the written path.
    fn dispatch(&mut self, written: &StatePath, revision: u64) {
        let root = &self.root;
        let mut cache: HashMap<StatePath, Arc<Value>> = HashMap::new();

        self.subscribers.retain(|id, sub| {
            if !sub.path.overlaps(written) {
                return true;
            }
            let value = cache
                .entry(sub.path.clone())
                .or_insert_with(|| Arc::new(value_at(root, &sub.path).cloned().unwrap_or(Value::Null)))
                .clone();
            if sub.tx.send(Versioned { revision, value }).is_err() {
                log::debug!("Dropping subscriber {id}: receiver gone");
                return false;
            }
            true
        });
    }
}

/// In-memory state store.
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store (the root reads as `NotFound`).
    pub fn new() -> Self {
        Self::with_document(Value::Null)
    }

    /// Store pre-loaded with a document.
    pub fn with_document(root: Value) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                root,
                ..Inner::default()
            })),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Simulate the backing service going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        log::info!(
            "Memory store is now {}",
            if available { "available" } else { "unavailable" }
        );
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    /// Number of successful writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Current revision.
    pub fn revision(&self) -> u64 {
        lock(&self.inner).revision
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".into()))
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn read(&self, path: &StatePath) -> Result<Versioned, StoreError> {
        self.check_available()?;
        let inner = lock(&self.inner);
        match value_at(&inner.root, path) {
            Some(value) if !value.is_null() => Ok(Versioned {
                revision: inner.revision,
                value: Arc::new(value.clone()),
            }),
            _ => Err(StoreError::NotFound(path.clone())),
        }
    }

    async fn write(&self, path: &StatePath, value: Value) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = lock(&self.inner);
        set_at(&mut inner.root, path, value);
        inner.revision += 1;
        let revision = inner.revision;
        inner.dispatch(path, revision);
        self.writes.fetch_add(1, Ordering::SeqCst);
        log::trace!("Wrote '{path}' at revision {revision}");
        Ok(revision)
    }

    async fn subscribe(&self, path: &StatePath) -> Result<Subscription, StoreError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = lock(&self.inner);
            inner.next_subscriber += 1;
            let id = inner.next_subscriber;
            inner.subscribers.insert(
                id,
                Subscriber {
                    path: path.clone(),
                    tx,
                },
            );
            id
        };

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let release = ReleaseHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).subscribers.remove(&id);
            }
        });
        Ok(Subscription::new(id, rx, release))
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn value_at<'a>(root: &'a Value, path: &StatePath) -> Option<&'a Value> {
    path.segments().iter().try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn set_at(root: &mut Value, path: &StatePath, value: Value) {
    let Some((last, parents)) = path.segments().split_last() else {
        *root = value;
        return;
    };
    if value.is_null() && value_at(root, path).is_none() {
        return;
    }
    let parent = parents
        .iter()
        .fold(root, |node, segment| child_mut(node, segment));
    assign(parent, last, value);
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn child_mut<'a>(node: &'a mut Value, segment: &str) -> &'a mut Value {
    match (node, segment.parse::<usize>()) {
        (Value::Array(items), Ok(index)) => {
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            &mut items[index]
        }
        (node, _) => ensure_object(node)
            .entry(segment.to_string())
            .or_insert(Value::Null),
    }
}

fn assign(parent: &mut Value, segment: &str, value: Value) {
    match (parent, segment.parse::<usize>()) {
        (Value::Array(items), Ok(index)) => {
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            items[index] = value;
        }
        (parent, _) if value.is_null() => {
            if let Value::Object(map) = parent {
                map.remove(segment);
            }
        }
        (parent, _) => {
            ensure_object(parent).insert(segment.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(raw: &str) -> StatePath {
        StatePath::parse(raw).unwrap()
    }

    fn layout() -> Value {
        json!({
            "fan": false,
            "leds": [null, false, false, false, false],
            "sensors": { "temperature": 0.0, "humidity": 0.0, "ldr": false }
        })
    }

    #[tokio::test]
    async fn test_read_missing_root_is_not_found() {
        let store = MemoryStore::new();
        assert_eq!(
            store.read(&StatePath::root()).await,
            Err(StoreError::NotFound(StatePath::root()))
        );
    }

    #[tokio::test]
    async fn test_write_then_read_leaf() {
        let store = MemoryStore::with_document(layout());
        let rev = store.write(&path("leds/3"), json!(true)).await.unwrap();
        assert_eq!(rev, 1);

        let slot = store.read(&path("leds/3")).await.unwrap();
        assert_eq!(*slot.value, json!(true));
        assert_eq!(slot.revision, 1);

        let leds = store.read(&path("leds")).await.unwrap();
        assert_eq!(*leds.value, json!([null, false, false, true, false]));
    }

    #[tokio::test]
    async fn test_write_creates_intermediate_objects() {
        let store = MemoryStore::new();
        store.write(&path("sensors/temperature"), json!(21.0)).await.unwrap();
        let root = store.read(&StatePath::root()).await.unwrap();
        assert_eq!(*root.value, json!({"sensors": {"temperature": 21.0}}));
    }

    #[tokio::test]
    async fn test_write_null_deletes() {
        let store = MemoryStore::with_document(layout());
        store.write(&path("fan"), Value::Null).await.unwrap();
        assert!(matches!(store.read(&path("fan")).await, Err(StoreError::NotFound(_))));
        store.write(&path("garage/door"), Value::Null).await.unwrap();
        assert!(store.read(&path("garage")).await.is_err());
    }

    #[tokio::test]
    async fn test_subscription_sees_own_and_ancestor_writes() {
        let store = MemoryStore::with_document(layout());
        let mut root_sub = store.subscribe(&StatePath::root()).await.unwrap();
        let mut sensors_sub = store.subscribe(&path("sensors")).await.unwrap();

        store.write(&path("fan"), json!(true)).await.unwrap();
        store
            .write(&path("sensors"), json!({"temperature": 24.5, "humidity": 60.0, "timestamp": 5}))
            .await
            .unwrap();

        let first = root_sub.next().await.unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(first.value["fan"], json!(true));
        let second = root_sub.next().await.unwrap();
        assert_eq!(second.revision, 2);
        assert_eq!(second.value["sensors"]["temperature"], json!(24.5));

        // The fan write does not touch the sensors subtree.
        let only = sensors_sub.next().await.unwrap();
        assert_eq!(only.revision, 2);
        assert_eq!(only.value["humidity"], json!(60.0));

        // Writing the root reaches a descendant subscriber.
        store.write(&StatePath::root(), layout()).await.unwrap();
        let reset = sensors_sub.next().await.unwrap();
        assert_eq!(reset.revision, 3);
        assert_eq!(reset.value["temperature"], json!(0.0));
    }

    #[tokio::test]
    async fn test_subscribers_share_one_order() {
        let store = Arc::new(MemoryStore::with_document(layout()));
        let mut a = store.subscribe(&StatePath::root()).await.unwrap();
        let mut b = store.subscribe(&StatePath::root()).await.unwrap();

        let writers: Vec<_> = (1..=4)
            .map(|slot| {
                let store = store.clone();
                tokio::spawn(async move {
                    for i in 0..25 {
                        store.write(&path(&format!("leds/{slot}")), json!(i % 2 == 0)).await.unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.await.unwrap();
        }

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        for _ in 0..100 {
            seen_a.push(a.next().await.unwrap());
            seen_b.push(b.next().await.unwrap());
        }
        assert_eq!(seen_a, seen_b);
        assert!(seen_a.windows(2).all(|w| w[0].revision < w[1].revision));
        let last = store.read(&StatePath::root()).await.unwrap();
        assert_eq!(seen_a.last().unwrap().value, last.value);
    }

    #[tokio::test]
    async fn test_release_unsubscribes() {
        let store = MemoryStore::with_document(layout());
        let sub = store.subscribe(&StatePath::root()).await.unwrap();
        assert_eq!(store.subscriber_count(), 1);

        let (mut changes, release) = sub.into_parts();
        release.release();
        assert_eq!(store.subscriber_count(), 0);

        store.write(&path("fan"), json!(true)).await.unwrap();
        assert!(changes.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_released() {
        let store = MemoryStore::with_document(layout());
        {
            let _sub = store.subscribe(&path("fan")).await.unwrap();
            assert_eq!(store.subscriber_count(), 1);
        }
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_rejects_operations() {
        let store = MemoryStore::with_document(layout());
        store.set_available(false);
        assert!(!store.is_available());
        assert!(matches!(
            store.write(&path("fan"), json!(true)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(store.read(&path("fan")).await, Err(StoreError::Unavailable(_))));
        assert!(store.subscribe(&path("fan")).await.is_err());
        assert_eq!(store.write_count(), 0);

        store.set_available(true);
        store.write(&path("fan"), json!(true)).await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.revision(), 1);
    }
}
