// =============================================================================
// In-memory document store
// =============================================================================
//
// Ordered map keyed by document path. The runtime default when no external
// datastore is wired up, and the backing store for every test.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{guard_write_path, Store};
use crate::errors::CoreResult;

/// Thread-safe in-memory store with prefix listing.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, Value>>,
    write_count: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total mutations applied since construction.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Number of documents currently stored.
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, path: &str) -> CoreResult<Option<Value>> {
        Ok(self.docs.read().get(path).cloned())
    }

    async fn set(&self, path: &str, doc: Value) -> CoreResult<()> {
        guard_write_path(path)?;
        self.docs.write().insert(path.to_string(), doc);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, path: &str) -> CoreResult<()> {
        guard_write_path(path)?;
        self.docs.write().remove(path);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<(String, Value)>> {
        let docs = self.docs.read();
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = MemoryStore::new();
        store
            .set("users/u1/data/snapshot", json!({"equity": "1"}))
            .await
            .unwrap();
        let doc = store.get("users/u1/data/snapshot").await.unwrap().unwrap();
        assert_eq!(doc["equity"], "1");
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn list_is_prefix_bounded() {
        let store = MemoryStore::new();
        store
            .set("users/u1/shadowTradeHistory/a", json!({"n": 1}))
            .await
            .unwrap();
        store
            .set("users/u1/shadowTradeHistory/b", json!({"n": 2}))
            .await
            .unwrap();
        store
            .set("users/u1/signals/x", json!({"n": 3}))
            .await
            .unwrap();
        store
            .set("users/u2/shadowTradeHistory/c", json!({"n": 4}))
            .await
            .unwrap();

        let rows = store.list("users/u1/shadowTradeHistory/").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "users/u1/shadowTradeHistory/a");
        assert_eq!(rows[1].0, "users/u1/shadowTradeHistory/b");
    }

    #[tokio::test]
    async fn unsanctioned_write_is_refused() {
        let store = MemoryStore::new();
        let err = store
            .set("scratch/anything", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invariant");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let store = MemoryStore::new();
        store.set("users/u1/alerts/a1", json!({})).await.unwrap();
        store.delete("users/u1/alerts/a1").await.unwrap();
        assert!(store.get("users/u1/alerts/a1").await.unwrap().is_none());
    }
}
