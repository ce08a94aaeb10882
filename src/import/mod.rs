pub mod classifier;
pub mod sources;

use crate::cache::CacheManager;
use crate::errors::EngineResult;
use crate::merge::{merge_groups, new_bookmark_id, new_group_id};
use crate::models::{
    Bookmark, BookmarkGroup, ClassifiedGroup, GroupingRequest, ImportItem, ImportPhase, ImportProgress,
    SmartImportOutcome, SmartImportRequest, FALLBACK_GROUP_NAME,
};
use crate::registry::WorkspaceRegistry;
use crate::url_norm::normalize_url;
use chrono::Utc;
use classifier::{GroupingClassifier, SafetyClassifier};
use sources::{select_collectors, SourceCollector};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub type ProgressSink = Arc<dyn Fn(ImportProgress) + Send + Sync>;

/// Turns browser signals into workspaces and groups, one workspace per
/// selected purpose. Runs to completion or to the first unrecovered error.
pub struct SmartImportOrchestrator {
    registry: Arc<WorkspaceRegistry>,
    cache: Arc<CacheManager>,
    collectors: Vec<Arc<dyn SourceCollector>>,
    safety: Arc<dyn SafetyClassifier>,
    grouping: Arc<dyn GroupingClassifier>,
    history_limit: usize,
}

impl SmartImportOrchestrator {
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        cache: Arc<CacheManager>,
        safety: Arc<dyn SafetyClassifier>,
        grouping: Arc<dyn GroupingClassifier>,
        history_limit: usize,
    ) -> Self {
        Self {
            registry,
            cache,
            collectors: Vec::new(),
            safety,
            grouping,
            history_limit,
        }
    }

    pub fn with_collector(mut self, collector: Arc<dyn SourceCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn with_collectors(mut self, collectors: Vec<Arc<dyn SourceCollector>>) -> Self {
        self.collectors.extend(collectors);
        self
    }

    pub async fn run(
        &self,
        request: SmartImportRequest,
        progress: Option<ProgressSink>,
    ) -> EngineResult<SmartImportOutcome> {
        let report = |update: ImportProgress| {
            if let Some(sink) = &progress {
                sink(update);
            }
        };

        report(ImportProgress::phase(ImportPhase::Initializing, "Starting import"));
        let purposes = clean_purposes(&request.purposes);
        let Some((first, rest)) = purposes.split_first() else {
            report(ImportProgress::phase(ImportPhase::Done, "No purposes selected"));
            return Ok(SmartImportOutcome::default());
        };

        let mut outcome = SmartImportOutcome::default();
        let primary_id = self.registry.create(&workspace_name(first)).await?.id;
        outcome.workspaces.insert(first.clone(), primary_id.clone());
        for purpose in rest {
            let workspace = self.registry.create(&workspace_name(purpose)).await?;
            outcome.workspaces.insert(purpose.clone(), workspace.id);
        }
        outcome.primary_workspace_id = Some(primary_id.clone());

        report(ImportProgress::phase(ImportPhase::Collecting, "Collecting browser data"));
        let items = self.collect(&request).await;
        outcome.collected = items.len();

        let total = items.len();
        report(ImportProgress {
            total,
            ..ImportProgress::phase(ImportPhase::Filtering, "Checking items")
        });
        let mut safe = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            if self.safety.is_safe(&item).await {
                safe.push(item);
            }
            report(ImportProgress {
                phase: ImportPhase::Filtering,
                processed: index + 1,
                total,
                message: None,
                primary_workspace_id: None,
            });
        }
        outcome.safe = safe.len();

        report(ImportProgress::phase(ImportPhase::Categorizing, "Grouping items"));
        let response = self
            .grouping
            .group(GroupingRequest {
                items: safe,
                purposes: purposes.clone(),
            })
            .await?;

        report(ImportProgress::phase(ImportPhase::Persisting, "Saving workspaces"));
        let mut per_workspace: BTreeMap<String, Vec<BookmarkGroup>> = BTreeMap::new();
        for group in response.groups {
            if group.items.is_empty() {
                continue;
            }
            let workspace_id = match outcome.workspaces.get(&group.purpose) {
                Some(workspace_id) => workspace_id.clone(),
                None => {
                    tracing::warn!(purpose = %group.purpose, "classifier returned an unselected purpose");
                    primary_id.clone()
                }
            };
            per_workspace
                .entry(workspace_id)
                .or_default()
                .push(to_bookmark_group(group));
        }
        for (workspace_id, groups) in per_workspace {
            let persisted = groups.len();
            let current = self.cache.load_groups(&workspace_id).await?;
            let merged = merge_groups(&current, groups);
            self.cache.save_groups(&workspace_id, &merged).await?;
            outcome.groups_persisted += persisted;
        }
        self.registry.set_active(&primary_id).await?;

        tracing::info!(
            primary_workspace_id = %primary_id,
            collected = outcome.collected,
            safe = outcome.safe,
            groups = outcome.groups_persisted,
            "smart import finished"
        );
        report(ImportProgress {
            phase: ImportPhase::Done,
            processed: outcome.groups_persisted,
            total: outcome.groups_persisted,
            message: Some("Import complete".to_string()),
            primary_workspace_id: Some(primary_id),
        });
        Ok(outcome)
    }

    /// Runs every selected collector concurrently. A failing collector
    /// contributes nothing.
    async fn collect(&self, request: &SmartImportRequest) -> Vec<ImportItem> {
        let history_limit = self.history_limit;
        let handles = select_collectors(&self.collectors, request.sources.as_deref())
            .into_iter()
            .map(|collector| {
                tokio::spawn(async move {
                    let source = collector.source();
                    (source, collector.collect(history_limit).await)
                })
            })
            .collect::<Vec<_>>();

        let mut items = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((_, Ok(collected))) => items.extend(collected),
                Ok((source, Err(error))) => {
                    tracing::warn!(source = source.as_str(), error = %error, "collector unavailable");
                }
                Err(error) => {
                    tracing::warn!(error = %error, "collector task failed");
                }
            }
        }
        dedupe_by_url(items)
    }
}

fn clean_purposes(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|purpose| purpose.trim().to_lowercase())
        .filter(|purpose| !purpose.is_empty() && seen.insert(purpose.clone()))
        .collect()
}

fn workspace_name(purpose: &str) -> String {
    let mut chars = purpose.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Keeps the first item for each normalized URL.
fn dedupe_by_url(items: Vec<ImportItem>) -> Vec<ImportItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(normalize_url(&item.url)))
        .collect()
}

fn to_bookmark_group(group: ClassifiedGroup) -> BookmarkGroup {
    let now = Utc::now();
    let name = group.name.trim();
    BookmarkGroup {
        id: new_group_id(),
        group_name: if name.is_empty() {
            FALLBACK_GROUP_NAME.to_string()
        } else {
            name.to_string()
        },
        bookmarks: group
            .items
            .into_iter()
            .map(|item| Bookmark {
                id: new_bookmark_id(),
                name: if item.name.trim().is_empty() {
                    item.url.clone()
                } else {
                    item.name
                },
                url: item.url,
                favicon_url: None,
                created_at: Some(now),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::classifier::{PolicyGroupingClassifier, RuleSafetyClassifier};
    use super::sources::StaticCollector;
    use super::*;
    use crate::errors::EngineError;
    use crate::events::EventBus;
    use crate::groups::GroupRepository;
    use crate::models::{GroupingResponse, ItemSource, ListWorkspacesFilter};
    use crate::storage::{MemoryKvStore, MemorySyncStore};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Fixture {
        registry: Arc<WorkspaceRegistry>,
        cache: Arc<CacheManager>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryKvStore::new());
        let cache = CacheManager::new(
            store.clone(),
            Arc::new(MemoryKvStore::new()),
            Arc::new(MemorySyncStore::new()),
            GroupRepository::new(store.clone()),
            EventBus::new(),
        );
        Fixture {
            registry: Arc::new(WorkspaceRegistry::new(store)),
            cache: Arc::new(cache),
        }
    }

    fn item(id: &str, url: &str, source: ItemSource) -> ImportItem {
        ImportItem {
            id: id.to_string(),
            name: id.to_string(),
            url: url.to_string(),
            source,
            last_visited_at: None,
        }
    }

    struct OfflineCollector;

    #[async_trait]
    impl SourceCollector for OfflineCollector {
        fn source(&self) -> ItemSource {
            ItemSource::History
        }

        async fn collect(&self, _history_limit: usize) -> anyhow::Result<Vec<ImportItem>> {
            Err(anyhow!("history permission denied"))
        }
    }

    struct ScriptedGrouping(Vec<ClassifiedGroup>);

    #[async_trait]
    impl GroupingClassifier for ScriptedGrouping {
        async fn group(&self, _request: GroupingRequest) -> EngineResult<GroupingResponse> {
            Ok(GroupingResponse { groups: self.0.clone() })
        }
    }

    struct BrokenGrouping;

    #[async_trait]
    impl GroupingClassifier for BrokenGrouping {
        async fn group(&self, _request: GroupingRequest) -> EngineResult<GroupingResponse> {
            Err(EngineError::Classification("model crashed".to_string()))
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<ImportProgress>>>, ProgressSink) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ProgressSink = Arc::new(move |update: ImportProgress| {
            sink_seen.lock().expect("progress lock").push(update);
        });
        (seen, sink)
    }

    fn collectors() -> Vec<Arc<dyn SourceCollector>> {
        vec![
            Arc::new(StaticCollector::new(
                ItemSource::Bookmarks,
                vec![
                    item("docs", "https://docs.rs/", ItemSource::Bookmarks),
                    item("ftp", "ftp://files.example.com", ItemSource::Bookmarks),
                ],
            )),
            Arc::new(StaticCollector::new(
                ItemSource::Tabs,
                vec![
                    item("docs-tab", "https://DOCS.rs#top", ItemSource::Tabs),
                    item("news", "https://news.example.com/today", ItemSource::Tabs),
                ],
            )),
            Arc::new(OfflineCollector),
        ]
    }

    #[tokio::test]
    async fn full_run_creates_workspaces_and_persists_groups() {
        let fx = fixture();
        let orchestrator = SmartImportOrchestrator::new(
            fx.registry.clone(),
            fx.cache.clone(),
            Arc::new(RuleSafetyClassifier::default()),
            Arc::new(PolicyGroupingClassifier::new(None, 5, 100)),
            50,
        )
        .with_collectors(collectors());
        let (seen, sink) = recorder();

        let outcome = orchestrator
            .run(
                SmartImportRequest {
                    purposes: vec!["work".to_string(), "personal".to_string(), "Work ".to_string()],
                    sources: None,
                },
                Some(sink),
            )
            .await
            .expect("import");

        assert_eq!(outcome.collected, 3);
        assert_eq!(outcome.safe, 2);
        assert_eq!(outcome.groups_persisted, 1);
        assert_eq!(outcome.workspaces.len(), 2);
        let primary = outcome.primary_workspace_id.clone().expect("primary");
        assert_eq!(outcome.workspaces.get("work"), Some(&primary));

        let names = fx
            .registry
            .list(ListWorkspacesFilter::default())
            .await
            .expect("list")
            .into_iter()
            .map(|workspace| workspace.name)
            .collect::<Vec<_>>();
        assert!(names.contains(&"Work".to_string()));
        assert!(names.contains(&"Personal".to_string()));
        assert_eq!(fx.registry.get_active_id().await.expect("active"), primary);

        let groups = fx.cache.load_groups(&primary).await.expect("groups");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_name, FALLBACK_GROUP_NAME);
        assert_eq!(
            groups[0].bookmarks.iter().map(|b| b.url.as_str()).collect::<Vec<_>>(),
            vec!["https://docs.rs/", "https://news.example.com/today"]
        );

        let seen = seen.lock().expect("progress lock").clone();
        let phases = seen.iter().map(|update| update.phase).collect::<Vec<_>>();
        assert_eq!(phases.first(), Some(&ImportPhase::Initializing));
        assert_eq!(phases.last(), Some(&ImportPhase::Done));
        let filtering = seen
            .iter()
            .filter(|update| update.phase == ImportPhase::Filtering)
            .map(|update| (update.processed, update.total))
            .collect::<Vec<_>>();
        assert_eq!(filtering, vec![(0, 3), (1, 3), (2, 3), (3, 3)]);
        assert_eq!(seen.last().and_then(|update| update.primary_workspace_id.clone()), Some(primary));
    }

    #[tokio::test]
    async fn no_purposes_finishes_immediately() {
        let fx = fixture();
        let orchestrator = SmartImportOrchestrator::new(
            fx.registry.clone(),
            fx.cache.clone(),
            Arc::new(RuleSafetyClassifier::default()),
            Arc::new(PolicyGroupingClassifier::new(None, 5, 100)),
            50,
        )
        .with_collectors(collectors());
        let (seen, sink) = recorder();

        let outcome = orchestrator
            .run(
                SmartImportRequest {
                    purposes: vec!["  ".to_string()],
                    sources: None,
                },
                Some(sink),
            )
            .await
            .expect("import");
        assert_eq!(outcome, SmartImportOutcome::default());
        let phases = seen
            .lock()
            .expect("progress lock")
            .iter()
            .map(|update| update.phase)
            .collect::<Vec<_>>();
        assert_eq!(phases, vec![ImportPhase::Initializing, ImportPhase::Done]);
        let workspaces = fx.registry.list(ListWorkspacesFilter::default()).await.expect("list");
        assert_eq!(workspaces.len(), 1);
    }

    #[tokio::test]
    async fn groups_are_partitioned_by_purpose() {
        let fx = fixture();
        let group = |name: &str, purpose: &str, url: &str| ClassifiedGroup {
            id: Some(format!("c-{}", name)),
            name: name.to_string(),
            description: None,
            purpose: purpose.to_string(),
            items: vec![item(name, url, ItemSource::Tabs)],
        };
        let grouping = ScriptedGrouping(vec![
            group("Specs", "work", "https://specs.example.com"),
            group("Recipes", "personal", "https://food.example.com"),
            group("Odd", "mystery", "https://odd.example.com"),
        ]);
        let orchestrator = SmartImportOrchestrator::new(
            fx.registry.clone(),
            fx.cache.clone(),
            Arc::new(RuleSafetyClassifier::default()),
            Arc::new(grouping),
            50,
        );
        let seeded = fx.registry.create("Scratch").await.expect("create");
        let outcome = orchestrator
            .run(
                SmartImportRequest {
                    purposes: vec!["work".to_string(), "personal".to_string()],
                    sources: Some(vec![ItemSource::Tabs]),
                },
                None,
            )
            .await
            .expect("import");
        assert_eq!(outcome.groups_persisted, 3);

        let work = fx.cache.load_groups(&outcome.workspaces["work"]).await.expect("work");
        assert_eq!(work.iter().map(|g| g.group_name.as_str()).collect::<Vec<_>>(), vec!["Specs", "Odd"]);
        let personal = fx.cache.load_groups(&outcome.workspaces["personal"]).await.expect("personal");
        assert_eq!(personal.len(), 1);
        assert_ne!(personal[0].id, "c-Recipes");
        assert!(fx.cache.load_groups(&seeded.id).await.expect("scratch").is_empty());
    }

    #[tokio::test]
    async fn grouping_errors_propagate() {
        let fx = fixture();
        let orchestrator = SmartImportOrchestrator::new(
            fx.registry.clone(),
            fx.cache.clone(),
            Arc::new(RuleSafetyClassifier::default()),
            Arc::new(BrokenGrouping),
            50,
        )
        .with_collectors(collectors());
        let error = orchestrator
            .run(
                SmartImportRequest {
                    purposes: vec!["work".to_string()],
                    sources: None,
                },
                None,
            )
            .await
            .expect_err("classification failure");
        assert!(error.to_string().contains("CLASSIFICATION_FAILED"));
    }

    #[test]
    fn purpose_helpers() {
        assert_eq!(workspace_name("work"), "Work");
        assert_eq!(workspace_name("éclair"), "Éclair");
        assert_eq!(
            clean_purposes(&["Work".to_string(), " work".to_string(), String::new(), "study".to_string()]),
            vec!["work".to_string(), "study".to_string()]
        );
    }
}
