use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use super::{Bookmark, DurableStore, StorageBackend, StoreError, StoreTxn};
use crate::models::WorkspaceId;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    version: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, Entry>,
    version: u64,
    alarm: Option<DateTime<Utc>>,
}

impl MemoryState {
    fn write(&mut self, key: &str, value: Option<Value>) -> bool {
        self.version += 1;
        match value {
            Some(value) => {
                let version = self.version;
                self.entries.insert(key.to_string(), Entry { value, version }).is_some()
            }
            None => self.entries.remove(key).is_some(),
        }
    }
}

/// Process-local store of one workspace.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Arc<AsyncMutex<MemoryState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, to exercise storage outages.
    #[cfg(test)]
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes are failing".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.entries.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.check_writable()?;
        self.state.lock().await.write(key, Some(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_writable()?;
        Ok(self.state.lock().await.write(key, None))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn list_since(&self, prefix: &str, since: Bookmark) -> Result<Vec<(String, Value)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.version > since.version())
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTxn>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTxn {
            guard,
            pending: BTreeMap::new(),
            fail_writes: self.fail_writes.clone(),
        }))
    }

    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_writable()?;
        self.state.lock().await.alarm = Some(at);
        Ok(())
    }

    async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.state.lock().await.alarm)
    }

    async fn delete_alarm(&self) -> Result<(), StoreError> {
        self.check_writable()?;
        self.state.lock().await.alarm = None;
        Ok(())
    }

    async fn bookmark(&self) -> Result<Bookmark, StoreError> {
        Ok(Bookmark::from_version(self.state.lock().await.version))
    }
}

/// Holds the store lock for its whole lifetime; writes are buffered until commit.
struct MemoryTxn {
    guard: OwnedMutexGuard<MemoryState>,
    pending: BTreeMap<String, Option<Value>>,
    fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl StoreTxn for MemoryTxn {
    async fn get(&mut self, key: &str) -> Result<Option<Value>, StoreError> {
        if let Some(pending) = self.pending.get(key) {
            return Ok(pending.clone());
        }
        Ok(self.guard.entries.get(key).map(|e| e.value.clone()))
    }

    async fn put(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.pending.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.pending.insert(key.to_string(), None);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("commit rejected".to_string()));
        }
        let MemoryTxn { mut guard, pending, .. } = *self;
        debug!("Committing {} buffered writes", pending.len());
        for (key, value) in pending {
            guard.write(&key, value);
        }
        Ok(())
    }
}

/// Keeps one [`MemoryStore`] per workspace for the lifetime of the process, so
/// a workspace's data outlives any single coordinator incarnation.
#[derive(Default)]
pub struct MemoryBackend {
    stores: Mutex<HashMap<WorkspaceId, Arc<MemoryStore>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, workspace: &WorkspaceId) -> Arc<MemoryStore> {
        let mut stores = self.stores.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        stores
            .entry(workspace.clone())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone()
    }
}

impl StorageBackend for MemoryBackend {
    fn open(&self, workspace: &WorkspaceId) -> Arc<dyn DurableStore> {
        self.store(workspace)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn basic_key_value_access() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.put("a", json!(1)).await.unwrap();
        store.put("b/1", json!("x")).await.unwrap();
        store.put("b/2", json!("y")).await.unwrap();
        store.put("c", json!(true)).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(json!(1)));
        let listed = store.list("b/").await.unwrap();
        assert_eq!(listed, vec![("b/1".to_string(), json!("x")), ("b/2".to_string(), json!("y"))]);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn bookmarks_only_move_forward_and_select_newer_writes() {
        let store = MemoryStore::new();
        store.put("log/1", json!("old")).await.unwrap();
        let mark = store.bookmark().await.unwrap();

        store.put("log/2", json!("new")).await.unwrap();
        store.put("other", json!("ignored")).await.unwrap();
        store.delete("other").await.unwrap();
        let later = store.bookmark().await.unwrap();
        assert!(later > mark);

        let newer = store.list_since("log/", mark).await.unwrap();
        assert_eq!(newer, vec![("log/2".to_string(), json!("new"))]);
        assert!(store.list_since("log/", later).await.unwrap().is_empty());
        assert_eq!(store.list_since("log/", Bookmark::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transactions_apply_atomically_on_commit() {
        let store = MemoryStore::new();
        store.put("seq", json!(1)).await.unwrap();

        let mut txn = store.begin().await.unwrap();
        let seq = txn.get("seq").await.unwrap().and_then(|v| v.as_u64()).unwrap();
        txn.put("seq", json!(seq + 1)).await.unwrap();
        txn.put("entry", json!("payload")).await.unwrap();
        assert_eq!(txn.get("seq").await.unwrap(), Some(json!(2)));
        txn.commit().await.unwrap();

        assert_eq!(store.get("seq").await.unwrap(), Some(json!(2)));
        assert_eq!(store.get("entry").await.unwrap(), Some(json!("payload")));
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        {
            let mut txn = store.begin().await.unwrap();
            txn.put("k", json!("v")).await.unwrap();
        }
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_commit_leaves_store_untouched() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.put("k", json!("v")).await.unwrap();
        store.fail_writes(true);
        assert!(txn.commit().await.is_err());
        store.fail_writes(false);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn alarm_slot_is_replaced_not_queued() {
        let store = MemoryStore::new();
        let first = Utc::now();
        let second = first + chrono::Duration::seconds(30);

        store.set_alarm(first).await.unwrap();
        store.set_alarm(second).await.unwrap();
        assert_eq!(store.get_alarm().await.unwrap(), Some(second));

        store.delete_alarm().await.unwrap();
        assert_eq!(store.get_alarm().await.unwrap(), None);
    }

    #[tokio::test]
    async fn backend_partitions_by_workspace_and_survives_reopen() {
        let backend = MemoryBackend::new();
        let a = WorkspaceId::new("a");
        let b = WorkspaceId::new("b");

        backend.open(&a).put("k", json!("from a")).await.unwrap();
        assert_eq!(backend.open(&b).get("k").await.unwrap(), None);
        assert_eq!(backend.open(&a).get("k").await.unwrap(), Some(json!("from a")));
    }
}
