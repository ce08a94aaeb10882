use crate::cache::CacheManager;
use crate::errors::{EngineError, EngineResult};
use crate::events::Delivery;
use crate::merge;
use crate::models::{BookmarkGroup, GroupIndexEntry};
use crate::registry::WorkspaceRegistry;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub workspace_id: String,
    pub groups: Vec<BookmarkGroup>,
    pub index: Vec<GroupIndexEntry>,
    pub loading: bool,
    pub hydrated: bool,
    /// Bumped by every local mutation of `groups`.
    pub revision: u64,
}

/// One view's in-memory projection of the active workspace.
#[derive(Clone)]
pub struct WorkspaceView {
    cache: Arc<CacheManager>,
    registry: Arc<WorkspaceRegistry>,
    state: Arc<RwLock<ViewState>>,
    switch_lock: Arc<Mutex<()>>,
    prune_mirrors: bool,
}

/// Aborts the change listener when dropped.
pub struct ChangeWatch {
    handle: JoinHandle<()>,
}

impl Drop for ChangeWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl WorkspaceView {
    pub fn new(cache: Arc<CacheManager>, registry: Arc<WorkspaceRegistry>, prune_mirrors: bool) -> Self {
        Self {
            cache,
            registry,
            state: Arc::new(RwLock::new(ViewState::default())),
            switch_lock: Arc::new(Mutex::new(())),
            prune_mirrors,
        }
    }

    pub async fn state(&self) -> ViewState {
        self.state.read().await.clone()
    }

    pub async fn groups(&self) -> Vec<BookmarkGroup> {
        self.state.read().await.groups.clone()
    }

    pub async fn workspace_id(&self) -> String {
        self.state.read().await.workspace_id.clone()
    }

    /// Runs Phase 1a and 1b inline and schedules Phase 2 in the background.
    pub async fn boot(&self) -> EngineResult<JoinHandle<()>> {
        let workspace_id = self.registry.get_active_id().await?;
        Ok(self.boot_workspace(workspace_id).await)
    }

    pub async fn switch_workspace(&self, workspace_id: &str) -> EngineResult<JoinHandle<()>> {
        let _guard = self.switch_lock.lock().await;
        let workspace = self.registry.set_active(workspace_id).await?;
        if self.prune_mirrors {
            let pruned = self.cache.prune_index_mirrors(&workspace.id).await;
            tracing::debug!(workspace_id = %workspace.id, pruned, "pruned inactive index mirrors");
        }
        Ok(self.boot_workspace(workspace.id).await)
    }

    async fn boot_workspace(&self, workspace_id: String) -> JoinHandle<()> {
        {
            let mut state = self.state.write().await;
            if state.workspace_id != workspace_id {
                *state = ViewState {
                    workspace_id: workspace_id.clone(),
                    ..ViewState::default()
                };
            }
            state.loading = true;
        }

        if let Some(snapshot) = self.cache.read_local_snapshot(&workspace_id) {
            let mut state = self.state.write().await;
            if state.workspace_id == workspace_id && state.groups != snapshot.groups {
                state.index = snapshot.groups.iter().map(GroupIndexEntry::from).collect();
                state.groups = snapshot.groups;
            }
        }

        let index = self.cache.read_index(&workspace_id).await;
        {
            let mut state = self.state.write().await;
            if state.workspace_id == workspace_id {
                if let Some(index) = index {
                    state.index = index;
                }
                state.loading = false;
            }
        }

        let view = self.clone();
        tokio::spawn(async move {
            // Low-priority hint: let pending foreground work run first.
            tokio::task::yield_now().await;
            view.hydrate(&workspace_id).await;
        })
    }

    /// Phase 2 only; never touches `loading`. Returns whether groups changed.
    pub async fn rehydrate(&self) -> bool {
        let workspace_id = self.workspace_id().await;
        if workspace_id.is_empty() {
            return false;
        }
        self.hydrate(&workspace_id).await
    }

    pub async fn on_visibility_regained(&self) -> bool {
        self.rehydrate().await
    }

    async fn hydrate(&self, workspace_id: &str) -> bool {
        let revision = self.state.read().await.revision;
        let groups = match self.cache.load_groups(workspace_id).await {
            Ok(groups) => groups,
            Err(error) => {
                tracing::warn!(workspace_id = %workspace_id, error = %error, "background hydration failed; keeping cached view");
                return false;
            }
        };

        let changed = {
            let mut state = self.state.write().await;
            if state.workspace_id != workspace_id {
                tracing::debug!(workspace_id = %workspace_id, "view switched during hydration; discarding result");
                return false;
            }
            if state.revision != revision {
                tracing::debug!(workspace_id = %workspace_id, "view mutated during hydration; discarding result");
                return false;
            }
            let changed = state.groups != groups;
            if changed {
                state.groups = groups.clone();
            }
            state.index = groups.iter().map(GroupIndexEntry::from).collect();
            state.hydrated = true;
            changed
        };

        self.cache.write_through(workspace_id, &groups).await;
        changed
    }

    /// Rehydrates whenever another view reports a change to this view's workspace.
    pub fn watch_changes(&self) -> ChangeWatch {
        let mut subscription = self.cache.bus().subscribe();
        let view = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match subscription.next().await {
                    Delivery::Event(event) => {
                        if event.workspace_id() == view.workspace_id().await {
                            view.rehydrate().await;
                        }
                    }
                    Delivery::Lagged(missed) => {
                        tracing::debug!(missed, "change listener lagged; rehydrating");
                        view.rehydrate().await;
                    }
                    Delivery::Closed => break,
                }
            }
        });
        ChangeWatch { handle }
    }

    /// Folds `new_groups` into the authoritative list of the current workspace.
    pub async fn merge_groups(&self, new_groups: Vec<BookmarkGroup>) -> EngineResult<Vec<BookmarkGroup>> {
        let workspace_id = self.require_workspace().await?;
        let current = self.cache.load_groups(&workspace_id).await?;
        let merged = merge::merge_groups(&current, new_groups);
        self.cache.save_groups(&workspace_id, &merged).await?;

        let mut state = self.state.write().await;
        if state.workspace_id == workspace_id {
            state.groups = merged.clone();
            state.index = merged.iter().map(GroupIndexEntry::from).collect();
            state.revision += 1;
        }
        Ok(merged)
    }

    /// Imports an uploaded export. Returns the number of groups imported.
    pub async fn import_json(&self, raw: &str) -> EngineResult<usize> {
        let groups = merge::normalize(&merge::parse_upload(raw)?);
        let count = groups.len();
        self.merge_groups(groups).await?;
        tracing::info!(groups = count, "json upload imported");
        Ok(count)
    }

    pub async fn export_json(&self) -> EngineResult<String> {
        let workspace_id = self.require_workspace().await?;
        merge::export_json(&self.cache.load_groups(&workspace_id).await?)
    }

    async fn require_workspace(&self) -> EngineResult<String> {
        let workspace_id = self.workspace_id().await;
        if workspace_id.is_empty() {
            return Err(EngineError::Validation("view has not been booted".to_string()));
        }
        Ok(workspace_id)
    }
}
