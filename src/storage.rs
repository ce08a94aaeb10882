use crate::errors::{EngineError, EngineResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex as StdMutex;
use tokio::sync::RwLock;

pub const WORKSPACE_PREFIX: &str = "ws::";
pub const GROUPS_KEY: &str = "bookmarkGroups";
pub const INDEX_KEY: &str = "groupIndex";
pub const SNAPSHOT_KEY: &str = "groupSnapshot";
pub const REGISTRY_KEY: &str = "workspaceRegistry";
pub const LEGACY_WORKSPACES_KEY: &str = "workspaces";
pub const LEGACY_ACTIVE_ID_KEY: &str = "activeWorkspaceId";

pub fn scoped_key(workspace_id: &str, name: &str) -> String {
    format!("{}{}::{}", WORKSPACE_PREFIX, workspace_id, name)
}

pub fn groups_key(workspace_id: &str) -> String {
    scoped_key(workspace_id, GROUPS_KEY)
}

pub fn index_key(workspace_id: &str) -> String {
    scoped_key(workspace_id, INDEX_KEY)
}

pub fn snapshot_key(workspace_id: &str) -> String {
    scoped_key(workspace_id, SNAPSHOT_KEY)
}

/// Splits a namespaced key into `(workspace_id, name)`.
pub fn parse_scoped_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(WORKSPACE_PREFIX)?;
    let (workspace_id, name) = rest.rsplit_once("::")?;
    if workspace_id.is_empty() || name.is_empty() {
        return None;
    }
    Some((workspace_id, name))
}

/// Asynchronous key-value port. Used for both the persistent and the
/// session-scoped tier.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<Value>>;
    async fn get_many(&self, keys: &[String]) -> EngineResult<BTreeMap<String, Value>>;
    async fn get_all(&self) -> EngineResult<BTreeMap<String, Value>>;
    async fn set(&self, entries: BTreeMap<String, Value>) -> EngineResult<()>;
    async fn remove(&self, keys: &[String]) -> EngineResult<()>;
}

/// Synchronous string store used only for first-paint snapshots.
pub trait SyncStore: Send + Sync {
    fn get_item(&self, key: &str) -> EngineResult<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> EngineResult<()>;
    fn remove_item(&self, key: &str) -> EngineResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn get_many(&self, keys: &[String]) -> EngineResult<BTreeMap<String, Value>> {
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| entries.get(key).map(|value| (key.clone(), value.clone())))
            .collect())
    }

    async fn get_all(&self) -> EngineResult<BTreeMap<String, Value>> {
        Ok(self.entries.read().await.clone())
    }

    async fn set(&self, entries: BTreeMap<String, Value>) -> EngineResult<()> {
        self.entries.write().await.extend(entries);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> EngineResult<()> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySyncStore {
    items: StdMutex<HashMap<String, String>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EngineResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.items
            .lock()
            .map_err(|_| EngineError::Internal("local store mutex poisoned".to_string()))
    }
}

impl SyncStore for MemorySyncStore {
    fn get_item(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> EngineResult<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> EngineResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scoped_keys_are_derivable_and_invertible() {
        let key = index_key("ws-1");
        assert_eq!(key, "ws::ws-1::groupIndex");
        assert_eq!(parse_scoped_key(&key), Some(("ws-1", INDEX_KEY)));
        assert_eq!(parse_scoped_key(REGISTRY_KEY), None);
        assert_eq!(parse_scoped_key("ws::::groupIndex"), None);
    }

    #[tokio::test]
    async fn memory_store_supports_batch_operations() {
        let store = MemoryKvStore::new();
        store
            .set(BTreeMap::from([
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!({"x": true})),
            ]))
            .await
            .expect("set");

        let many = store
            .get_many(&["a".to_string(), "missing".to_string()])
            .await
            .expect("get many");
        assert_eq!(many.len(), 1);

        store.remove(&["a".to_string()]).await.expect("remove");
        assert_eq!(store.get("a").await.expect("get"), None);
        assert_eq!(store.len().await, 1);
    }

    #[test]
    fn memory_sync_store_roundtrips_strings() {
        let store = MemorySyncStore::new();
        store.set_item("k", "v").expect("set");
        assert_eq!(store.get_item("k").expect("get").as_deref(), Some("v"));
        store.remove_item("k").expect("remove");
        assert_eq!(store.get_item("k").expect("get"), None);
    }
}
