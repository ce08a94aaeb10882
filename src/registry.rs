use crate::errors::{EngineError, EngineResult};
use crate::models::{ListWorkspacesFilter, RegistryRecord, Workspace, REGISTRY_SCHEMA_VERSION};
use crate::storage::{KvStore, LEGACY_ACTIVE_ID_KEY, LEGACY_WORKSPACES_KEY, REGISTRY_KEY};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_WORKSPACE_ID: &str = "default";
pub const DEFAULT_WORKSPACE_NAME: &str = "My Workspace";
const UNTITLED_WORKSPACE_NAME: &str = "New Workspace";

pub struct WorkspaceRegistry {
    store: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

impl WorkspaceRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> EngineResult<Option<RegistryRecord>> {
        let Some(raw) = self.store.get(REGISTRY_KEY).await? else {
            return Ok(None);
        };
        serde_json::from_value(raw)
            .map(Some)
            .map_err(|err| EngineError::Storage(format!("Corrupt workspace registry: {}", err)))
    }

    pub async fn save(&self, record: &RegistryRecord) -> EngineResult<()> {
        self.store
            .set(BTreeMap::from([(REGISTRY_KEY.to_string(), serde_json::to_value(record)?)]))
            .await
    }

    /// Seeds a default registry or migrates the legacy flat workspace map.
    pub async fn initialize(&self) -> EngineResult<RegistryRecord> {
        let _guard = self.write_lock.lock().await;
        self.current_locked().await
    }

    pub async fn ensure_default_workspace(&self) -> EngineResult<RegistryRecord> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.current_locked().await?;
        if ensure_live(&mut record, Utc::now()) {
            self.save(&record).await?;
        }
        Ok(record)
    }

    pub async fn create(&self, name: &str) -> EngineResult<Workspace> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.current_locked().await?;
        let now = Utc::now();
        let trimmed = name.trim();
        let workspace = Workspace {
            id: new_workspace_id(now),
            name: if trimmed.is_empty() {
                UNTITLED_WORKSPACE_NAME.to_string()
            } else {
                trimmed.to_string()
            },
            created_at: now,
            updated_at: now,
            archived: None,
        };
        record.items.insert(workspace.id.clone(), workspace.clone());
        record.active_id = workspace.id.clone();
        self.save(&record).await?;
        tracing::info!(workspace_id = %workspace.id, "workspace created");
        Ok(workspace)
    }

    /// Returns `None` when the trimmed name is empty (no-op).
    pub async fn rename(&self, workspace_id: &str, name: &str) -> EngineResult<Option<Workspace>> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let _guard = self.write_lock.lock().await;
        let mut record = self.current_locked().await?;
        let workspace = record
            .items
            .get_mut(workspace_id)
            .ok_or_else(|| EngineError::NotFound(format!("Workspace {} not found", workspace_id)))?;
        workspace.name = trimmed.to_string();
        workspace.updated_at = Utc::now();
        let updated = workspace.clone();
        self.save(&record).await?;
        Ok(Some(updated))
    }

    /// Returns `false` when nothing changed: the workspace was already
    /// archived or it is the only live workspace.
    pub async fn archive(&self, workspace_id: &str) -> EngineResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.current_locked().await?;
        if !record.items.contains_key(workspace_id) {
            return Err(EngineError::NotFound(format!("Workspace {} not found", workspace_id)));
        }
        if !record.is_live(workspace_id) || record.live().count() <= 1 {
            return Ok(false);
        }

        let now = Utc::now();
        if let Some(workspace) = record.items.get_mut(workspace_id) {
            workspace.archived = Some(true);
            workspace.updated_at = now;
        }

        if record.active_id == workspace_id {
            if let Some(fallback) = fallback_active_id(&record) {
                if let Some(workspace) = record.items.get_mut(&fallback) {
                    workspace.updated_at = now;
                }
                record.active_id = fallback;
            }
        }

        self.save(&record).await?;
        tracing::info!(workspace_id = %workspace_id, active_id = %record.active_id, "workspace archived");
        Ok(true)
    }

    pub async fn list(&self, filter: ListWorkspacesFilter) -> EngineResult<Vec<Workspace>> {
        let record = self.snapshot().await?;
        let mut workspaces = record
            .items
            .into_values()
            .filter(|workspace| filter.include_archived || !workspace.is_archived())
            .collect::<Vec<_>>();
        workspaces.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(workspaces)
    }

    pub async fn get(&self, workspace_id: &str) -> EngineResult<Option<Workspace>> {
        Ok(self.snapshot().await?.items.remove(workspace_id))
    }

    pub async fn get_active_id(&self) -> EngineResult<String> {
        Ok(self.snapshot().await?.active_id)
    }

    pub async fn get_active(&self) -> EngineResult<Workspace> {
        let mut record = self.snapshot().await?;
        let active_id = record.active_id.clone();
        record
            .items
            .remove(&active_id)
            .ok_or_else(|| EngineError::NotFound(format!("Active workspace {} not found", active_id)))
    }

    pub async fn set_active(&self, workspace_id: &str) -> EngineResult<Workspace> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.current_locked().await?;
        if !record.is_live(workspace_id) {
            return Err(EngineError::NotFound(format!(
                "Workspace {} not found or archived",
                workspace_id
            )));
        }
        if record.active_id != workspace_id {
            record.active_id = workspace_id.to_string();
            self.save(&record).await?;
        }
        record
            .items
            .remove(workspace_id)
            .ok_or_else(|| EngineError::NotFound(format!("Workspace {} not found", workspace_id)))
    }

    async fn snapshot(&self) -> EngineResult<RegistryRecord> {
        if let Some(record) = self.load().await? {
            return Ok(record);
        }
        let _guard = self.write_lock.lock().await;
        self.current_locked().await
    }

    /// Caller must hold `write_lock`.
    async fn current_locked(&self) -> EngineResult<RegistryRecord> {
        if let Some(record) = self.load().await? {
            return Ok(record);
        }

        let now = Utc::now();
        let legacy = self
            .store
            .get_many(&[LEGACY_WORKSPACES_KEY.to_string(), LEGACY_ACTIVE_ID_KEY.to_string()])
            .await?;

        let record = match legacy.get(LEGACY_WORKSPACES_KEY) {
            Some(raw) => {
                let active_hint = legacy.get(LEGACY_ACTIVE_ID_KEY).and_then(Value::as_str);
                let record = migrate_legacy(raw, active_hint, now);
                self.save(&record).await?;
                self.store
                    .remove(&[LEGACY_WORKSPACES_KEY.to_string(), LEGACY_ACTIVE_ID_KEY.to_string()])
                    .await?;
                tracing::info!(
                    workspaces = record.items.len(),
                    active_id = %record.active_id,
                    "migrated legacy workspace map"
                );
                record
            }
            None => {
                let record = seeded_registry(now);
                self.save(&record).await?;
                record
            }
        };
        Ok(record)
    }
}

fn default_workspace(now: DateTime<Utc>) -> Workspace {
    Workspace {
        id: DEFAULT_WORKSPACE_ID.to_string(),
        name: DEFAULT_WORKSPACE_NAME.to_string(),
        created_at: now,
        updated_at: now,
        archived: None,
    }
}

fn seeded_registry(now: DateTime<Utc>) -> RegistryRecord {
    RegistryRecord {
        version: REGISTRY_SCHEMA_VERSION,
        active_id: DEFAULT_WORKSPACE_ID.to_string(),
        items: BTreeMap::from([(DEFAULT_WORKSPACE_ID.to_string(), default_workspace(now))]),
    }
}

fn new_workspace_id(now: DateTime<Utc>) -> String {
    let short = Uuid::new_v4().simple().to_string();
    format!("ws_{}_{}", now.format("%Y%m%d%H%M%S"), &short[..8])
}

/// Prefers the default workspace, then the oldest live one.
fn fallback_active_id(record: &RegistryRecord) -> Option<String> {
    if record.is_live(DEFAULT_WORKSPACE_ID) {
        return Some(DEFAULT_WORKSPACE_ID.to_string());
    }
    record
        .live()
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
        .map(|workspace| workspace.id.clone())
}

/// Restores the "at least one live workspace, active points at a live one"
/// invariant. Returns whether the record changed.
fn ensure_live(record: &mut RegistryRecord, now: DateTime<Utc>) -> bool {
    let mut changed = false;
    if record.live().next().is_none() {
        match record.items.get_mut(DEFAULT_WORKSPACE_ID) {
            Some(workspace) => {
                workspace.archived = None;
                workspace.updated_at = now;
            }
            None => {
                record
                    .items
                    .insert(DEFAULT_WORKSPACE_ID.to_string(), default_workspace(now));
            }
        }
        changed = true;
    }
    if !record.is_live(&record.active_id) {
        if let Some(fallback) = fallback_active_id(record) {
            record.active_id = fallback;
            changed = true;
        }
    }
    changed
}

fn migrate_legacy(raw: &Value, active_hint: Option<&str>, now: DateTime<Utc>) -> RegistryRecord {
    let entries: Vec<(Option<String>, &Value)> = match raw {
        Value::Object(map) => map.iter().map(|(key, value)| (Some(key.clone()), value)).collect(),
        Value::Array(list) => list.iter().map(|value| (None, value)).collect(),
        _ => Vec::new(),
    };

    let mut items = BTreeMap::new();
    for (key, value) in entries {
        match legacy_workspace(key, value, now) {
            Some(workspace) => {
                items.insert(workspace.id.clone(), workspace);
            }
            None => tracing::warn!("skipping malformed legacy workspace entry"),
        }
    }

    let mut record = RegistryRecord {
        version: REGISTRY_SCHEMA_VERSION,
        active_id: active_hint.unwrap_or(DEFAULT_WORKSPACE_ID).to_string(),
        items,
    };
    ensure_live(&mut record, now);
    record
}

fn legacy_workspace(key: Option<String>, value: &Value, now: DateTime<Utc>) -> Option<Workspace> {
    let object = value.as_object()?;
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .or(key)
        .filter(|id| !id.trim().is_empty())?;
    let name = object
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(UNTITLED_WORKSPACE_NAME)
        .to_string();
    let created_at = object.get("createdAt").and_then(parse_timestamp).unwrap_or(now);
    let updated_at = object
        .get("updatedAt")
        .and_then(parse_timestamp)
        .unwrap_or(created_at);
    let archived = object
        .get("archived")
        .and_then(Value::as_bool)
        .filter(|archived| *archived);

    Some(Workspace {
        id,
        name,
        created_at,
        updated_at,
        archived,
    })
}

/// Accepts RFC 3339 strings and epoch milliseconds.
pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;
    use serde_json::json;

    fn registry() -> (Arc<MemoryKvStore>, WorkspaceRegistry) {
        let store = Arc::new(MemoryKvStore::new());
        let registry = WorkspaceRegistry::new(store.clone());
        (store, registry)
    }

    #[tokio::test]
    async fn initialize_seeds_default_workspace() {
        let (_store, registry) = registry();
        let record = registry.initialize().await.expect("initialize");
        assert_eq!(record.active_id, DEFAULT_WORKSPACE_ID);
        assert_eq!(record.items.len(), 1);
        assert_eq!(registry.get_active().await.expect("active").name, DEFAULT_WORKSPACE_NAME);
    }

    #[tokio::test]
    async fn initialize_migrates_legacy_map_and_removes_legacy_keys() {
        let (store, registry) = registry();
        store
            .set(BTreeMap::from([
                (
                    LEGACY_WORKSPACES_KEY.to_string(),
                    json!({
                        "alpha": {"id": "alpha", "name": " Work ", "createdAt": 1_700_000_000_000i64},
                        "beta": {"name": "Home", "createdAt": "2024-01-02T03:04:05Z"},
                        "broken": "nope"
                    }),
                ),
                (LEGACY_ACTIVE_ID_KEY.to_string(), json!("beta")),
            ]))
            .await
            .expect("seed legacy");

        let record = registry.initialize().await.expect("migrate");
        assert_eq!(record.active_id, "beta");
        assert_eq!(record.items.len(), 2);
        assert_eq!(record.items["alpha"].name, "Work");
        assert_eq!(record.items["alpha"].created_at.timestamp_millis(), 1_700_000_000_000);

        assert!(store.get(LEGACY_WORKSPACES_KEY).await.expect("get").is_none());
        assert!(store.get(LEGACY_ACTIVE_ID_KEY).await.expect("get").is_none());
        assert!(store.get(REGISTRY_KEY).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn legacy_active_pointer_to_unknown_workspace_falls_back() {
        let (store, registry) = registry();
        store
            .set(BTreeMap::from([
                (
                    LEGACY_WORKSPACES_KEY.to_string(),
                    json!({"only": {"name": "Only", "createdAt": 5}}),
                ),
                (LEGACY_ACTIVE_ID_KEY.to_string(), json!("ghost")),
            ]))
            .await
            .expect("seed legacy");
        let record = registry.initialize().await.expect("migrate");
        assert_eq!(record.active_id, "only");
    }

    #[tokio::test]
    async fn archiving_sole_live_workspace_is_a_no_op() {
        let (_store, registry) = registry();
        registry.initialize().await.expect("initialize");

        let archived = registry.archive(DEFAULT_WORKSPACE_ID).await.expect("archive");
        assert!(!archived);
        let record = registry.load().await.expect("load").expect("record");
        assert_eq!(record.items[DEFAULT_WORKSPACE_ID].archived, None);
        assert_eq!(record.active_id, DEFAULT_WORKSPACE_ID);
    }

    #[tokio::test]
    async fn archiving_active_workspace_reassigns_to_default() {
        let (_store, registry) = registry();
        registry.initialize().await.expect("initialize");
        let created = registry.create("Research").await.expect("create");
        assert_eq!(registry.get_active_id().await.expect("active"), created.id);

        assert!(registry.archive(&created.id).await.expect("archive"));
        assert_eq!(registry.get_active_id().await.expect("active"), DEFAULT_WORKSPACE_ID);

        let live = registry.list(ListWorkspacesFilter::default()).await.expect("list");
        assert_eq!(live.len(), 1);
        let all = registry
            .list(ListWorkspacesFilter { include_archived: true })
            .await
            .expect("list all");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, DEFAULT_WORKSPACE_ID);
    }

    #[tokio::test]
    async fn rename_trims_and_ignores_blank_names() {
        let (_store, registry) = registry();
        registry.initialize().await.expect("initialize");

        assert!(registry.rename(DEFAULT_WORKSPACE_ID, "   ").await.expect("rename").is_none());
        let renamed = registry
            .rename(DEFAULT_WORKSPACE_ID, "  Reading list ")
            .await
            .expect("rename")
            .expect("renamed");
        assert_eq!(renamed.name, "Reading list");
        assert!(registry.rename("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn set_active_rejects_archived_workspaces() {
        let (_store, registry) = registry();
        registry.initialize().await.expect("initialize");
        let created = registry.create("Side").await.expect("create");
        registry.set_active(DEFAULT_WORKSPACE_ID).await.expect("activate default");
        registry.archive(&created.id).await.expect("archive");

        let error = registry.set_active(&created.id).await.expect_err("archived");
        assert!(error.to_string().contains("NOT_FOUND"));
    }

    #[tokio::test]
    async fn ensure_default_workspace_revives_when_everything_is_archived() {
        let (_store, registry) = registry();
        let mut record = registry.initialize().await.expect("initialize");
        if let Some(workspace) = record.items.get_mut(DEFAULT_WORKSPACE_ID) {
            workspace.archived = Some(true);
        }
        registry.save(&record).await.expect("save");

        let record = registry.ensure_default_workspace().await.expect("ensure");
        assert!(record.is_live(DEFAULT_WORKSPACE_ID));
        assert_eq!(record.active_id, DEFAULT_WORKSPACE_ID);
    }

    #[test]
    fn parses_rfc3339_and_millis() {
        assert!(parse_timestamp(&json!("2024-05-01T00:00:00Z")).is_some());
        assert_eq!(
            parse_timestamp(&json!(1000)).map(|ts| ts.timestamp()),
            Some(1)
        );
        assert!(parse_timestamp(&json!(true)).is_none());
    }
}
