//! State store contract.
//!
//! The authoritative document lives behind [`StateStore`]; the hub never
//! keeps its own copy. The contract:
//!
//! ```text
//! read(path)      → Versioned { revision, value } | NotFound
//! write(path, v)  → revision                       | Unavailable
//! subscribe(path) → Subscription: one Versioned per write landing
//!                   under or above `path`, in store order, writer included
//! ```
//!
//! Revisions increase with every write. Delivery is at-least-once, so a
//! consumer may see the same revision twice and must treat it as a no-op.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use homelink_core::StatePath;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Store errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("no value at '{0}'")]
    NotFound(StatePath),

    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// A value together with the store revision it was observed at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub revision: u64,
    pub value: Arc<Value>,
}

/// Receiving end of a subtree subscription.
pub type ChangeStream = mpsc::UnboundedReceiver<Versioned>;

/// Unregisters a subscription exactly once, on `release` or on drop.
pub struct ReleaseHandle {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ReleaseHandle {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Unregister now.
    pub fn release(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        self.run();
    }
}

/// A live subtree subscription.
pub struct Subscription {
    id: u64,
    changes: ChangeStream,
    release: ReleaseHandle,
}

impl Subscription {
    pub fn new(id: u64, changes: ChangeStream, release: ReleaseHandle) -> Self {
        Self {
            id,
            changes,
            release,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next change, `None` once the subscription has been released.
    pub async fn next(&mut self) -> Option<Versioned> {
        self.changes.recv().await
    }

    /// Separate the change stream from its release handle so that one task
    /// can consume changes while another owns the lifetime.
    pub fn into_parts(self) -> (ChangeStream, ReleaseHandle) {
        (self.changes, self.release)
    }
}

/// Hierarchical key-value store with subtree subscriptions.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the value at `path`. Missing and `null` values are `NotFound`.
    async fn read(&self, path: &StatePath) -> Result<Versioned, StoreError>;

    /// Replace the value at `path` in one atomic step. Writing `null`
    /// deletes. Returns the revision assigned to the write.
    async fn write(&self, path: &StatePath, value: Value) -> Result<u64, StoreError>;

    /// Subscribe to every write that changes the value at `path`.
    async fn subscribe(&self, path: &StatePath) -> Result<Subscription, StoreError>;

    /// Whether the backing service is currently reachable.
    fn is_available(&self) -> bool {
        true
    }
}

/// Shared trait object used throughout the bridge.
pub type DynStore = Arc<dyn StateStore>;
