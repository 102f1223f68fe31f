//! Registry of live connections, keyed by id.
//!
//! The registry lock is never held across a store call. Eviction removes the
//! record under the lock and closes it after the lock is dropped.

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::connection::{ConnectionId, ConnectionInfo, ConnectionRecord};

#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    records: RwLock<HashMap<ConnectionId, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a record built while the write lock is held, so that a task
    /// spawned by `build` cannot evict the record before it exists.
    pub(crate) async fn insert_with(
        &self,
        id: ConnectionId,
        build: impl FnOnce() -> ConnectionRecord,
    ) {
        let mut records = self.records.write().await;
        records.insert(id, build());
    }

    /// Remove and close a connection. Returns `false` if it was already gone.
    pub(crate) async fn evict(&self, id: &ConnectionId) -> bool {
        let removed = self.records.write().await.remove(id);
        match removed {
            Some(record) => {
                record.close();
                true
            }
            None => false,
        }
    }

    /// Close every connection.
    pub(crate) async fn clear(&self) -> usize {
        let drained: Vec<_> = self.records.write().await.drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for record in drained {
            record.close();
        }
        count
    }

    pub(crate) async fn contains(&self, id: &ConnectionId) -> bool {
        self.records.read().await.contains_key(id)
    }

    pub(crate) async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub(crate) async fn infos(&self) -> Vec<ConnectionInfo> {
        self.records.read().await.values().map(ConnectionRecord::info).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_registry_insert_evict() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        let (record, mut conn) = ConnectionRecord::open(id, 4);
        registry.insert_with(id, move || record).await;

        assert!(registry.contains(&id).await);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.infos().await[0].id, id);

        assert!(registry.evict(&id).await);
        assert!(!registry.evict(&id).await);
        assert_eq!(registry.len().await, 0);
        assert_eq!(conn.recv().await, None);
    }

    #[tokio::test]
    async fn test_registry_infos_and_clear() {
        let registry = ConnectionRegistry::new();
        let mut held = Vec::new();
        for _ in 0..3 {
            let id = Uuid::new_v4();
            let (record, conn) = ConnectionRecord::open(id, 8);
            record.sender().try_send("{}".into()).unwrap();
            registry.insert_with(id, move || record).await;
            held.push(conn);
        }

        let infos = registry.infos().await;
        assert_eq!(infos.len(), 3);
        assert!(infos.iter().all(|info| info.queued == 1));

        assert_eq!(registry.clear().await, 3);
        assert_eq!(registry.len().await, 0);
        assert!(held.iter().all(|conn| conn.is_closed()));
    }
}
