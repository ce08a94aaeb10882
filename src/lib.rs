mod cache;
mod db;
mod errors;
mod events;
mod groups;
mod hydration;
pub mod import;
pub mod merge;
mod models;
mod registry;
mod storage;
mod transfer;
pub mod url_norm;

pub use crate::cache::CacheManager;
pub use crate::db::Database;
pub use crate::errors::{EngineError, EngineResult};
pub use crate::events::{Delivery, EngineEvent, EventBus, Subscription};
pub use crate::groups::{GroupRepository, RemoteBackend, RemoteBinding};
pub use crate::hydration::{ChangeWatch, ViewState, WorkspaceView};
pub use crate::models::*;
pub use crate::registry::{WorkspaceRegistry, DEFAULT_WORKSPACE_ID, DEFAULT_WORKSPACE_NAME};
pub use crate::storage::{KvStore, MemoryKvStore, MemorySyncStore, SyncStore};
pub use crate::transfer::{CancelFlag, GroupSelection, ProgressFn, TransferControl, TransferEngine, ALL_GROUPS_SENTINEL};

use crate::import::classifier::{PolicyGroupingClassifier, RemoteClassifier, RuleSafetyClassifier};
use crate::import::sources::SourceCollector;
use crate::import::SmartImportOrchestrator;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

const DATABASE_FILE: &str = "state.sqlite";

/// Storage ports the engine runs on.
#[derive(Clone)]
pub struct EnginePorts {
    pub persistent: Arc<dyn KvStore>,
    pub session: Arc<dyn KvStore>,
    pub local: Arc<dyn SyncStore>,
    pub remote: Option<RemoteBinding>,
}

impl EnginePorts {
    pub fn in_memory() -> Self {
        Self {
            persistent: Arc::new(MemoryKvStore::new()),
            session: Arc::new(MemoryKvStore::new()),
            local: Arc::new(MemorySyncStore::new()),
            remote: None,
        }
    }
}

pub struct Engine {
    database: Option<Arc<Database>>,
    settings: RwLock<EngineSettings>,
    registry: Arc<WorkspaceRegistry>,
    cache: Arc<CacheManager>,
}

impl Engine {
    /// Opens (or creates) `state.sqlite` under `data_dir`. The session tier
    /// lives in memory for the lifetime of the engine.
    pub fn open(data_dir: &Path) -> EngineResult<Self> {
        Self::open_with_remote(data_dir, None)
    }

    pub fn open_with_remote(data_dir: &Path, remote: Option<RemoteBinding>) -> EngineResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let database = Arc::new(Database::new(&data_dir.join(DATABASE_FILE))?);
        let settings = database.get_settings()?;
        let ports = EnginePorts {
            persistent: database.clone(),
            session: Arc::new(MemoryKvStore::new()),
            local: database.clone(),
            remote,
        };
        tracing::info!(path = %database.path().display(), "engine opened");
        Ok(Self::assemble(ports, settings, Some(database)))
    }

    /// Runs on caller-supplied ports. Settings are kept in memory only.
    pub fn with_ports(ports: EnginePorts, settings: EngineSettings) -> Self {
        Self::assemble(ports, settings, None)
    }

    fn assemble(ports: EnginePorts, settings: EngineSettings, database: Option<Arc<Database>>) -> Self {
        let mut repository = GroupRepository::new(ports.persistent.clone());
        if let Some(remote) = ports.remote {
            repository = repository.with_remote(remote, settings.remote_fallback_to_local);
        }
        let cache = CacheManager::new(
            ports.persistent.clone(),
            ports.session,
            ports.local,
            repository,
            EventBus::new(),
        );
        Self {
            database,
            settings: RwLock::new(settings),
            registry: Arc::new(WorkspaceRegistry::new(ports.persistent)),
            cache: Arc::new(cache),
        }
    }

    /// Seeds or migrates the registry and guarantees a live workspace.
    pub async fn initialize(&self) -> EngineResult<RegistryRecord> {
        self.registry.ensure_default_workspace().await
    }

    pub fn settings(&self) -> EngineSettings {
        match self.settings.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// `remoteFallbackToLocal` applies from the next `open`; everything else
    /// applies to components created after the update.
    pub fn update_settings(&self, patch: Value) -> EngineResult<EngineSettings> {
        let updated = match &self.database {
            Some(database) => database.update_settings(patch)?,
            None => db::apply_settings_patch(&self.settings(), patch)?,
        };
        let mut settings = self
            .settings
            .write()
            .map_err(|_| EngineError::Internal("settings lock poisoned".to_string()))?;
        *settings = updated.clone();
        Ok(updated)
    }

    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn subscribe(&self) -> Subscription {
        self.cache.bus().subscribe()
    }

    pub fn view(&self) -> WorkspaceView {
        WorkspaceView::new(
            self.cache.clone(),
            self.registry.clone(),
            self.settings().prune_inactive_index_mirrors,
        )
    }

    pub fn transfer(&self) -> TransferEngine {
        let settings = self.settings();
        TransferEngine::new(self.cache.clone(), settings.copy_chunk_size, settings.dedupe_by_url)
    }

    pub fn smart_import(
        &self,
        collectors: Vec<Arc<dyn SourceCollector>>,
        remote_classifier: Option<Arc<dyn RemoteClassifier>>,
    ) -> SmartImportOrchestrator {
        let settings = self.settings();
        let grouping = PolicyGroupingClassifier::new(
            remote_classifier,
            settings.min_items_for_classification,
            settings.max_items_for_classification,
        );
        SmartImportOrchestrator::new(
            self.registry.clone(),
            self.cache.clone(),
            Arc::new(RuleSafetyClassifier::default()),
            Arc::new(grouping),
            settings.history_limit,
        )
        .with_collectors(collectors)
    }

    pub async fn export_workspace(&self, workspace_id: &str) -> EngineResult<String> {
        merge::export_json(&self.cache.load_groups(workspace_id).await?)
    }
}

/// Installs the JSON file logger. Safe to call more than once; later calls
/// report that a subscriber is already set.
pub fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
