use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Group name reserved for the "no groups yet" affordance.
pub const PLACEHOLDER_GROUP_NAME: &str = "[[empty-group]]";
pub const DEFAULT_PURPOSE: &str = "personal";
pub const FALLBACK_GROUP_NAME: &str = "Imported";
pub const CACHE_SCHEMA_VERSION: u32 = 1;
pub const REGISTRY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl Workspace {
    pub fn is_archived(&self) -> bool {
        self.archived.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRecord {
    #[serde(default = "default_registry_version")]
    pub version: u32,
    pub active_id: String,
    #[serde(default)]
    pub items: BTreeMap<String, Workspace>,
}

fn default_registry_version() -> u32 {
    REGISTRY_SCHEMA_VERSION
}

impl RegistryRecord {
    pub fn live(&self) -> impl Iterator<Item = &Workspace> {
        self.items.values().filter(|workspace| !workspace.is_archived())
    }

    pub fn is_live(&self, workspace_id: &str) -> bool {
        self.items
            .get(workspace_id)
            .map(|workspace| !workspace.is_archived())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListWorkspacesFilter {
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkGroup {
    pub id: String,
    pub group_name: String,
    #[serde(default)]
    pub bookmarks: Vec<Bookmark>,
}

impl BookmarkGroup {
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group_name: PLACEHOLDER_GROUP_NAME.to_string(),
            bookmarks: Vec::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.group_name == PLACEHOLDER_GROUP_NAME
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupIndexEntry {
    pub id: String,
    pub group_name: String,
}

impl From<&BookmarkGroup> for GroupIndexEntry {
    fn from(group: &BookmarkGroup) -> Self {
        Self {
            id: group.id.clone(),
            group_name: group.group_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupIndex {
    pub version: u32,
    pub workspace_id: String,
    pub entries: Vec<GroupIndexEntry>,
    pub saved_at: DateTime<Utc>,
}

impl GroupIndex {
    pub fn from_groups(workspace_id: &str, groups: &[BookmarkGroup]) -> Self {
        Self {
            version: CACHE_SCHEMA_VERSION,
            workspace_id: workspace_id.to_string(),
            entries: groups.iter().map(GroupIndexEntry::from).collect(),
            saved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub version: u32,
    pub workspace_id: String,
    pub groups: Vec<BookmarkGroup>,
    pub saved_at: DateTime<Utc>,
}

impl GroupSnapshot {
    pub fn from_groups(workspace_id: &str, groups: &[BookmarkGroup]) -> Self {
        Self {
            version: CACHE_SCHEMA_VERSION,
            workspace_id: workspace_id.to_string(),
            groups: groups.to_vec(),
            saved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub copy_chunk_size: usize,
    pub dedupe_by_url: bool,
    pub min_items_for_classification: usize,
    pub max_items_for_classification: usize,
    pub history_limit: usize,
    pub remote_fallback_to_local: bool,
    pub prune_inactive_index_mirrors: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            copy_chunk_size: 150,
            dedupe_by_url: true,
            min_items_for_classification: 5,
            max_items_for_classification: 100,
            history_limit: 500,
            remote_fallback_to_local: true,
            prune_inactive_index_mirrors: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CopyTarget {
    #[serde(rename_all = "camelCase")]
    Group { group_id: String },
    #[serde(rename_all = "camelCase")]
    Bookmark {
        bookmark_ids: Vec<String>,
        into_group_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyRequest {
    pub source_workspace_id: String,
    pub target_workspace_id: String,
    pub target: CopyTarget,
    #[serde(default)]
    pub dedupe_by_url: Option<bool>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyProgress {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyOutcome {
    pub added: usize,
    pub skipped: usize,
    pub canceled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemSource {
    Bookmarks,
    Tabs,
    History,
}

impl ItemSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bookmarks => "bookmarks",
            Self::Tabs => "tabs",
            Self::History => "history",
        }
    }

    pub fn all() -> Vec<Self> {
        vec![Self::Bookmarks, Self::Tabs, Self::History]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportItem {
    pub id: String,
    pub name: String,
    pub url: String,
    pub source: ItemSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_visited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedGroup {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub purpose: String,
    pub items: Vec<ImportItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupingRequest {
    pub items: Vec<ImportItem>,
    pub purposes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupingResponse {
    pub groups: Vec<ClassifiedGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportPhase {
    Initializing,
    Collecting,
    Filtering,
    Categorizing,
    Persisting,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub phase: ImportPhase,
    pub processed: usize,
    pub total: usize,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub primary_workspace_id: Option<String>,
}

impl ImportProgress {
    pub fn phase(phase: ImportPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            processed: 0,
            total: 0,
            message: Some(message.into()),
            primary_workspace_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartImportRequest {
    pub purposes: Vec<String>,
    #[serde(default)]
    pub sources: Option<Vec<ItemSource>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartImportOutcome {
    pub primary_workspace_id: Option<String>,
    pub workspaces: BTreeMap<String, String>,
    pub collected: usize,
    pub safe: usize,
    pub groups_persisted: usize,
}
