use crate::errors::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::groups::GroupRepository;
use crate::models::{BookmarkGroup, GroupIndex, GroupIndexEntry, GroupSnapshot, CACHE_SCHEMA_VERSION};
use crate::storage::{index_key, parse_scoped_key, snapshot_key, KvStore, SyncStore, INDEX_KEY};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

trait CachePayload: DeserializeOwned {
    fn version(&self) -> u32;
    fn workspace_id(&self) -> &str;
}

impl CachePayload for GroupIndex {
    fn version(&self) -> u32 {
        self.version
    }

    fn workspace_id(&self) -> &str {
        &self.workspace_id
    }
}

impl CachePayload for GroupSnapshot {
    fn version(&self) -> u32 {
        self.version
    }

    fn workspace_id(&self) -> &str {
        &self.workspace_id
    }
}

fn decode_payload<T: CachePayload>(value: Value, workspace_id: &str) -> Option<T> {
    let payload = match serde_json::from_value::<T>(value) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::debug!(workspace_id = %workspace_id, error = %error, "discarding malformed cache payload");
            return None;
        }
    };
    if payload.version() != CACHE_SCHEMA_VERSION || payload.workspace_id() != workspace_id {
        tracing::debug!(
            workspace_id = %workspace_id,
            version = payload.version(),
            "discarding cache payload with mismatched schema"
        );
        return None;
    }
    Some(payload)
}

/// Owns every cache tier. Callers never write cache keys directly.
///
/// Cache faults are logged and swallowed; only the authoritative
/// repository reports errors.
pub struct CacheManager {
    persistent: Arc<dyn KvStore>,
    session: Arc<dyn KvStore>,
    local: Arc<dyn SyncStore>,
    repository: GroupRepository,
    bus: EventBus,
}

impl CacheManager {
    pub fn new(
        persistent: Arc<dyn KvStore>,
        session: Arc<dyn KvStore>,
        local: Arc<dyn SyncStore>,
        repository: GroupRepository,
        bus: EventBus,
    ) -> Self {
        Self {
            persistent,
            session,
            local,
            repository,
            bus,
        }
    }

    pub fn repository(&self) -> &GroupRepository {
        &self.repository
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn require_local(&self) -> EngineResult<()> {
        if self.repository.supports_local_copy() {
            Ok(())
        } else {
            Err(EngineError::Unsupported(
                "local storage adapter is unavailable for this workspace backend".to_string(),
            ))
        }
    }

    pub fn read_local_snapshot(&self, workspace_id: &str) -> Option<GroupSnapshot> {
        let raw = match self.local.get_item(&snapshot_key(workspace_id)) {
            Ok(raw) => raw?,
            Err(error) => {
                tracing::warn!(workspace_id = %workspace_id, error = %error, "local snapshot read failed");
                return None;
            }
        };
        let value = match serde_json::from_str::<Value>(&raw) {
            Ok(value) => value,
            Err(error) => {
                tracing::debug!(workspace_id = %workspace_id, error = %error, "local snapshot is not valid JSON");
                return None;
            }
        };
        decode_payload(value, workspace_id)
    }

    /// Session index first, then the persistent index, then an index derived
    /// from whichever snapshot is available.
    pub async fn read_index(&self, workspace_id: &str) -> Option<Vec<GroupIndexEntry>> {
        let key = index_key(workspace_id);
        for store in [&self.session, &self.persistent] {
            if let Some(index) = read_tier::<GroupIndex>(store.as_ref(), &key, workspace_id).await {
                return Some(index.entries);
            }
        }

        let key = snapshot_key(workspace_id);
        for store in [&self.session, &self.persistent] {
            if let Some(snapshot) = read_tier::<GroupSnapshot>(store.as_ref(), &key, workspace_id).await {
                return Some(snapshot.groups.iter().map(GroupIndexEntry::from).collect());
            }
        }
        None
    }

    pub async fn read_snapshot(&self, workspace_id: &str) -> Option<GroupSnapshot> {
        read_tier(self.persistent.as_ref(), &snapshot_key(workspace_id), workspace_id).await
    }

    pub async fn load_groups(&self, workspace_id: &str) -> EngineResult<Vec<BookmarkGroup>> {
        self.repository.load(workspace_id).await
    }

    /// Writes the authoritative list, refreshes caches and notifies other views.
    pub async fn save_groups(&self, workspace_id: &str, groups: &[BookmarkGroup]) -> EngineResult<()> {
        self.repository.save(workspace_id, groups).await?;
        self.write_through(workspace_id, groups).await;
        self.bus.data_changed(workspace_id);
        Ok(())
    }

    /// Warms every tier from an authoritative list so the next boot is fast.
    /// An empty list clears the caches instead of persisting nothing.
    pub async fn write_through(&self, workspace_id: &str, groups: &[BookmarkGroup]) {
        if !self.persist_caches_if_non_empty(workspace_id, groups).await {
            self.clear_caches(workspace_id).await;
            return;
        }

        let snapshot = GroupSnapshot::from_groups(workspace_id, groups);
        match serde_json::to_value(&snapshot) {
            Ok(value) => {
                if let Ok(raw) = serde_json::to_string(&value) {
                    if let Err(error) = self.local.set_item(&snapshot_key(workspace_id), &raw) {
                        tracing::warn!(workspace_id = %workspace_id, error = %error, "local snapshot write failed");
                    }
                }
                let entries = BTreeMap::from([(snapshot_key(workspace_id), value)]);
                if let Err(error) = self.session.set(entries).await {
                    tracing::warn!(workspace_id = %workspace_id, error = %error, "session snapshot write failed");
                }
            }
            Err(error) => {
                tracing::warn!(workspace_id = %workspace_id, error = %error, "snapshot encode failed");
            }
        }
    }

    /// Never clears: an empty list is ignored and reported as `false`.
    pub async fn persist_caches_if_non_empty(&self, workspace_id: &str, groups: &[BookmarkGroup]) -> bool {
        if groups.is_empty() {
            return false;
        }

        let index = GroupIndex::from_groups(workspace_id, groups);
        let snapshot = GroupSnapshot::from_groups(workspace_id, groups);
        let (index_value, snapshot_value) = match (serde_json::to_value(&index), serde_json::to_value(&snapshot)) {
            (Ok(index_value), Ok(snapshot_value)) => (index_value, snapshot_value),
            (Err(error), _) | (_, Err(error)) => {
                tracing::warn!(workspace_id = %workspace_id, error = %error, "cache encode failed");
                return false;
            }
        };

        let persistent_entries = BTreeMap::from([
            (index_key(workspace_id), index_value.clone()),
            (snapshot_key(workspace_id), snapshot_value),
        ]);
        if let Err(error) = self.persistent.set(persistent_entries).await {
            tracing::warn!(workspace_id = %workspace_id, error = %error, "persistent cache write failed");
        }

        let session_entries = BTreeMap::from([(index_key(workspace_id), index_value)]);
        if let Err(error) = self.session.set(session_entries).await {
            tracing::warn!(workspace_id = %workspace_id, error = %error, "session index mirror write failed");
        }
        true
    }

    pub async fn clear_caches(&self, workspace_id: &str) {
        let keys = [index_key(workspace_id), snapshot_key(workspace_id)];
        if let Err(error) = self.persistent.remove(&keys).await {
            tracing::warn!(workspace_id = %workspace_id, error = %error, "persistent cache clear failed");
        }
        if let Err(error) = self.session.remove(&keys).await {
            tracing::warn!(workspace_id = %workspace_id, error = %error, "session cache clear failed");
        }
        if let Err(error) = self.local.remove_item(&snapshot_key(workspace_id)) {
            tracing::warn!(workspace_id = %workspace_id, error = %error, "local snapshot clear failed");
        }
    }

    /// Drops session index mirrors of every workspace except `active_workspace_id`.
    pub async fn prune_index_mirrors(&self, active_workspace_id: &str) -> usize {
        let entries = match self.session.get_all().await {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(error = %error, "session scan failed; index mirrors left in place");
                return 0;
            }
        };

        let stale = entries
            .keys()
            .filter(|key| {
                matches!(
                    parse_scoped_key(key),
                    Some((workspace_id, name)) if name == INDEX_KEY && workspace_id != active_workspace_id
                )
            })
            .cloned()
            .collect::<Vec<_>>();
        if stale.is_empty() {
            return 0;
        }

        match self.session.remove(&stale).await {
            Ok(()) => stale.len(),
            Err(error) => {
                tracing::warn!(error = %error, "session mirror prune failed");
                0
            }
        }
    }
}

async fn read_tier<T: CachePayload>(store: &dyn KvStore, key: &str, workspace_id: &str) -> Option<T> {
    match store.get(key).await {
        Ok(Some(value)) => decode_payload(value, workspace_id),
        Ok(None) => None,
        Err(error) => {
            tracing::warn!(workspace_id = %workspace_id, key = %key, error = %error, "cache tier read failed");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::Delivery;
    use crate::models::Bookmark;
    use crate::storage::{MemoryKvStore, MemorySyncStore};
    use async_trait::async_trait;
    use serde_json::json;

    pub(crate) struct FailingKvStore;

    #[async_trait]
    impl KvStore for FailingKvStore {
        async fn get(&self, _key: &str) -> EngineResult<Option<Value>> {
            Err(EngineError::Storage("disk unavailable".to_string()))
        }

        async fn get_many(&self, _keys: &[String]) -> EngineResult<BTreeMap<String, Value>> {
            Err(EngineError::Storage("disk unavailable".to_string()))
        }

        async fn get_all(&self) -> EngineResult<BTreeMap<String, Value>> {
            Err(EngineError::Storage("disk unavailable".to_string()))
        }

        async fn set(&self, _entries: BTreeMap<String, Value>) -> EngineResult<()> {
            Err(EngineError::Storage("disk unavailable".to_string()))
        }

        async fn remove(&self, _keys: &[String]) -> EngineResult<()> {
            Err(EngineError::Storage("disk unavailable".to_string()))
        }
    }

    pub(crate) struct Tiers {
        pub persistent: Arc<MemoryKvStore>,
        pub session: Arc<MemoryKvStore>,
        pub local: Arc<MemorySyncStore>,
        pub cache: CacheManager,
    }

    pub(crate) fn tiers() -> Tiers {
        let persistent = Arc::new(MemoryKvStore::new());
        let session = Arc::new(MemoryKvStore::new());
        let local = Arc::new(MemorySyncStore::new());
        let cache = CacheManager::new(
            persistent.clone(),
            session.clone(),
            local.clone(),
            GroupRepository::new(persistent.clone()),
            EventBus::new(),
        );
        Tiers {
            persistent,
            session,
            local,
            cache,
        }
    }

    pub(crate) fn sample_groups() -> Vec<BookmarkGroup> {
        vec![BookmarkGroup {
            id: "g1".to_string(),
            group_name: "Reading".to_string(),
            bookmarks: vec![Bookmark {
                id: "b1".to_string(),
                name: "Rust".to_string(),
                url: "https://www.rust-lang.org/".to_string(),
                favicon_url: None,
                created_at: None,
            }],
        }]
    }

    #[tokio::test]
    async fn persist_skips_empty_lists() {
        let tiers = tiers();
        assert!(!tiers.cache.persist_caches_if_non_empty("w", &[]).await);
        assert_eq!(tiers.persistent.len().await, 0);
        assert_eq!(tiers.session.len().await, 0);
    }

    #[tokio::test]
    async fn persist_writes_index_snapshot_and_session_mirror() {
        let tiers = tiers();
        assert!(tiers.cache.persist_caches_if_non_empty("w", &sample_groups()).await);

        assert!(tiers.persistent.get(&index_key("w")).await.expect("get").is_some());
        assert!(tiers.persistent.get(&snapshot_key("w")).await.expect("get").is_some());
        assert!(tiers.session.get(&index_key("w")).await.expect("get").is_some());

        let index = tiers.cache.read_index("w").await.expect("index");
        assert_eq!(index, vec![GroupIndexEntry { id: "g1".to_string(), group_name: "Reading".to_string() }]);
    }

    #[tokio::test]
    async fn index_is_derived_from_snapshot_when_missing() {
        let tiers = tiers();
        let snapshot = GroupSnapshot::from_groups("w", &sample_groups());
        tiers
            .persistent
            .set(BTreeMap::from([(snapshot_key("w"), serde_json::to_value(snapshot).expect("encode"))]))
            .await
            .expect("seed");

        let index = tiers.cache.read_index("w").await.expect("derived index");
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].group_name, "Reading");
    }

    #[tokio::test]
    async fn mismatched_payloads_are_ignored() {
        let tiers = tiers();
        tiers
            .session
            .set(BTreeMap::from([
                (index_key("w"), json!({"version": 99, "workspaceId": "w", "entries": [], "savedAt": "2024-01-01T00:00:00Z"})),
                (snapshot_key("w"), json!({"garbage": true})),
            ]))
            .await
            .expect("seed");
        assert!(tiers.cache.read_index("w").await.is_none());

        tiers.local.set_item(&snapshot_key("w"), "{not json").expect("seed local");
        assert!(tiers.cache.read_local_snapshot("w").is_none());
    }

    #[tokio::test]
    async fn write_through_warms_local_tier_and_empty_list_clears() {
        let tiers = tiers();
        tiers.cache.write_through("w", &sample_groups()).await;
        let snapshot = tiers.cache.read_local_snapshot("w").expect("local snapshot");
        assert_eq!(snapshot.groups, sample_groups());

        tiers.cache.write_through("w", &[]).await;
        assert!(tiers.cache.read_local_snapshot("w").is_none());
        assert!(tiers.cache.read_index("w").await.is_none());
    }

    #[tokio::test]
    async fn clear_tolerates_storage_faults() {
        let persistent: Arc<dyn KvStore> = Arc::new(FailingKvStore);
        let cache = CacheManager::new(
            persistent.clone(),
            Arc::new(FailingKvStore),
            Arc::new(MemorySyncStore::new()),
            GroupRepository::new(persistent),
            EventBus::new(),
        );
        cache.clear_caches("w").await;
        assert!(cache.persist_caches_if_non_empty("w", &sample_groups()).await);
        assert!(cache.read_index("w").await.is_none());
        assert_eq!(cache.prune_index_mirrors("w").await, 0);
    }

    #[tokio::test]
    async fn prune_keeps_only_active_mirror() {
        let tiers = tiers();
        for workspace_id in ["a", "b", "c"] {
            tiers.cache.persist_caches_if_non_empty(workspace_id, &sample_groups()).await;
        }
        let removed = tiers.cache.prune_index_mirrors("b").await;
        assert_eq!(removed, 2);
        assert!(tiers.session.get(&index_key("b")).await.expect("get").is_some());
        assert!(tiers.session.get(&index_key("a")).await.expect("get").is_none());
        assert!(tiers.persistent.get(&index_key("a")).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn save_groups_notifies_subscribers() {
        let tiers = tiers();
        let mut subscription = tiers.cache.bus().subscribe();
        tiers.cache.save_groups("w", &sample_groups()).await.expect("save");

        assert_eq!(tiers.cache.load_groups("w").await.expect("load"), sample_groups());
        match subscription.next().await {
            Delivery::Event(event) => assert_eq!(event.workspace_id(), "w"),
            _ => panic!("expected data-changed event"),
        }
    }
}
