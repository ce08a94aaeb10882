use crate::errors::{EngineError, EngineResult};
use crate::models::BookmarkGroup;
use crate::storage::{groups_key, KvStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Alternate persistence path (cloud sync). Opaque to the engine.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn load(&self, user_id: &str, workspace_id: &str) -> anyhow::Result<Vec<BookmarkGroup>>;
    async fn save(&self, groups: &[BookmarkGroup], user_id: &str, workspace_id: &str) -> anyhow::Result<()>;
    async fn delete(&self, user_id: &str, workspace_id: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct RemoteBinding {
    pub backend: Arc<dyn RemoteBackend>,
    pub user_id: String,
}

/// Source of truth for a workspace's group list.
#[derive(Clone)]
pub struct GroupRepository {
    local: Arc<dyn KvStore>,
    remote: Option<RemoteBinding>,
    fallback_to_local: bool,
}

impl GroupRepository {
    pub fn new(local: Arc<dyn KvStore>) -> Self {
        Self {
            local,
            remote: None,
            fallback_to_local: true,
        }
    }

    pub fn with_remote(mut self, remote: RemoteBinding, fallback_to_local: bool) -> Self {
        self.remote = Some(remote);
        self.fallback_to_local = fallback_to_local;
        self
    }

    pub fn supports_local_copy(&self) -> bool {
        self.remote.is_none() || self.fallback_to_local
    }

    pub async fn load(&self, workspace_id: &str) -> EngineResult<Vec<BookmarkGroup>> {
        if let Some(remote) = &self.remote {
            match remote.backend.load(&remote.user_id, workspace_id).await {
                Ok(groups) => return Ok(groups),
                Err(error) if self.fallback_to_local => {
                    tracing::warn!(workspace_id = %workspace_id, error = %error, "remote load failed; using local store");
                }
                Err(error) => {
                    return Err(EngineError::Storage(format!("Remote load failed: {}", error)));
                }
            }
        }
        self.load_local(workspace_id).await
    }

    /// Explicit opt-in fallback: faults are logged and surface as an empty list.
    pub async fn load_or_empty(&self, workspace_id: &str) -> Vec<BookmarkGroup> {
        match self.load(workspace_id).await {
            Ok(groups) => groups,
            Err(error) => {
                tracing::warn!(workspace_id = %workspace_id, error = %error, "group load failed; treating as empty");
                Vec::new()
            }
        }
    }

    pub async fn save(&self, workspace_id: &str, groups: &[BookmarkGroup]) -> EngineResult<()> {
        if let Some(remote) = &self.remote {
            match remote.backend.save(groups, &remote.user_id, workspace_id).await {
                Ok(()) => return Ok(()),
                Err(error) if self.fallback_to_local => {
                    tracing::warn!(workspace_id = %workspace_id, error = %error, "remote save failed; using local store");
                }
                Err(error) => {
                    return Err(EngineError::Storage(format!("Remote save failed: {}", error)));
                }
            }
        }
        self.local
            .set(BTreeMap::from([(groups_key(workspace_id), serde_json::to_value(groups)?)]))
            .await
    }

    pub async fn delete(&self, workspace_id: &str) -> EngineResult<()> {
        if let Some(remote) = &self.remote {
            if let Err(error) = remote.backend.delete(&remote.user_id, workspace_id).await {
                if !self.fallback_to_local {
                    return Err(EngineError::Storage(format!("Remote delete failed: {}", error)));
                }
                tracing::warn!(workspace_id = %workspace_id, error = %error, "remote delete failed");
            }
        }
        self.local.remove(&[groups_key(workspace_id)]).await
    }

    async fn load_local(&self, workspace_id: &str) -> EngineResult<Vec<BookmarkGroup>> {
        let Some(raw) = self.local.get(&groups_key(workspace_id)).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_value(raw).map_err(|err| {
            EngineError::Storage(format!("Corrupt group list for workspace {}: {}", workspace_id, err))
        })
    }
}
