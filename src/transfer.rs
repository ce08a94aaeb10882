use crate::cache::CacheManager;
use crate::errors::{EngineError, EngineResult};
use crate::merge::{ensure_single_empty, new_bookmark_id, new_group_id};
use crate::models::{Bookmark, BookmarkGroup, CopyOutcome, CopyProgress, CopyRequest, CopyTarget};
use crate::url_norm::normalize_url;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const ALL_GROUPS_SENTINEL: &str = "__all__";
const GROUP_ID_SEPARATOR: char = ',';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupSelection {
    All,
    Ids(Vec<String>),
}

impl GroupSelection {
    /// `__all__` selects every non-placeholder group; otherwise a
    /// comma-separated list of group ids.
    pub fn parse(raw: &str) -> EngineResult<Self> {
        let trimmed = raw.trim();
        if trimmed == ALL_GROUPS_SENTINEL {
            return Ok(Self::All);
        }
        let ids = trimmed
            .split(GROUP_ID_SEPARATOR)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if ids.is_empty() {
            return Err(EngineError::Validation("No source group selected".to_string()));
        }
        Ok(Self::Ids(ids))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type ProgressFn = Arc<dyn Fn(CopyProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct TransferControl {
    pub cancel: Option<CancelFlag>,
    pub progress: Option<ProgressFn>,
}

impl TransferControl {
    fn is_canceled(&self) -> bool {
        self.cancel.as_ref().map(CancelFlag::is_canceled).unwrap_or(false)
    }

    fn report(&self, progress: CopyProgress) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }
}

struct Slot {
    group_name: String,
    dest_index: Option<usize>,
}

/// `bookmark` is `None` for a selected group that has no bookmarks.
struct WorkItem {
    slot: usize,
    source_group_id: String,
    bookmark: Option<Bookmark>,
}

enum Removal {
    Groups(HashSet<String>),
    Bookmarks(HashSet<String>),
}

struct CopyRun {
    outcome: CopyOutcome,
    processed: HashSet<(String, String)>,
    copied_empty_groups: HashSet<String>,
    removal: Removal,
}

pub struct TransferEngine {
    cache: Arc<CacheManager>,
    default_chunk_size: usize,
    default_dedupe: bool,
}

impl TransferEngine {
    pub fn new(cache: Arc<CacheManager>, default_chunk_size: usize, default_dedupe: bool) -> Self {
        Self {
            cache,
            default_chunk_size: default_chunk_size.max(1),
            default_dedupe,
        }
    }

    pub async fn copy_items(&self, request: &CopyRequest, control: &TransferControl) -> EngineResult<CopyOutcome> {
        Ok(self.run_copy(request, control).await?.outcome)
    }

    /// Copies, then removes the selection from the source. A copy that added
    /// nothing leaves the source untouched.
    pub async fn move_items(&self, request: &CopyRequest, control: &TransferControl) -> EngineResult<CopyOutcome> {
        let run = self.run_copy(request, control).await?;
        if run.outcome.added == 0 {
            tracing::info!(
                source = %request.source_workspace_id,
                skipped = run.outcome.skipped,
                "move added nothing; source left untouched"
            );
            return Ok(run.outcome);
        }

        let source = self.cache.load_groups(&request.source_workspace_id).await?;
        let remaining = if run.outcome.canceled {
            remove_processed(source, &run)
        } else {
            remove_selection(source, &run.removal)
        };
        let remaining = ensure_single_empty(remaining, true);
        self.cache
            .save_groups(&request.source_workspace_id, &remaining)
            .await?;
        Ok(run.outcome)
    }

    async fn run_copy(&self, request: &CopyRequest, control: &TransferControl) -> EngineResult<CopyRun> {
        self.cache.require_local()?;
        let chunk_size = request.chunk_size.unwrap_or(self.default_chunk_size).max(1);
        let dedupe = request.dedupe_by_url.unwrap_or(self.default_dedupe);

        let source = self.cache.load_groups(&request.source_workspace_id).await?;
        let mut destination = if request.source_workspace_id == request.target_workspace_id {
            source.clone()
        } else {
            self.cache.load_groups(&request.target_workspace_id).await?
        };

        let (mut slots, work, removal) = match &request.target {
            CopyTarget::Group { group_id } => plan_group_copy(&source, group_id)?,
            CopyTarget::Bookmark {
                bookmark_ids,
                into_group_id,
            } => {
                let dest_index = destination
                    .iter()
                    .position(|group| &group.id == into_group_id)
                    .ok_or_else(|| {
                        EngineError::Validation(format!(
                            "Destination group {} does not exist in workspace {}",
                            into_group_id, request.target_workspace_id
                        ))
                    })?;
                plan_bookmark_copy(&source, bookmark_ids, dest_index)
            }
        };

        let mut seen: HashSet<String> = if dedupe {
            destination
                .iter()
                .flat_map(|group| group.bookmarks.iter())
                .map(|bookmark| normalize_url(&bookmark.url))
                .collect()
        } else {
            HashSet::new()
        };

        let mut outcome = CopyOutcome::default();
        let mut processed = HashSet::new();
        let mut copied_empty_groups = HashSet::new();
        for chunk in work.chunks(chunk_size) {
            if control.is_canceled() {
                outcome.canceled = true;
                tracing::info!(added = outcome.added, skipped = outcome.skipped, "copy canceled");
                break;
            }

            for item in chunk {
                let Some(bookmark) = &item.bookmark else {
                    destination_index(&mut slots[item.slot], &mut destination);
                    copied_empty_groups.insert(item.source_group_id.clone());
                    outcome.added += 1;
                    continue;
                };
                if dedupe && !seen.insert(normalize_url(&bookmark.url)) {
                    outcome.skipped += 1;
                } else {
                    let dest_index = destination_index(&mut slots[item.slot], &mut destination);
                    destination[dest_index].bookmarks.push(Bookmark {
                        id: new_bookmark_id(),
                        ..bookmark.clone()
                    });
                    outcome.added += 1;
                }
                processed.insert((item.source_group_id.clone(), bookmark.id.clone()));
            }

            control.report(CopyProgress {
                added: outcome.added,
                skipped: outcome.skipped,
            });
            tokio::task::yield_now().await;
        }

        if outcome.added > 0 {
            let destination = ensure_single_empty(destination, true);
            self.cache
                .save_groups(&request.target_workspace_id, &destination)
                .await?;
        }
        tracing::info!(
            source = %request.source_workspace_id,
            target = %request.target_workspace_id,
            added = outcome.added,
            skipped = outcome.skipped,
            "copy finished"
        );

        Ok(CopyRun {
            outcome,
            processed,
            copied_empty_groups,
            removal,
        })
    }
}

/// Destination groups for a group copy are created on first use.
fn destination_index(slot: &mut Slot, destination: &mut Vec<BookmarkGroup>) -> usize {
    if let Some(index) = slot.dest_index {
        return index;
    }
    destination.push(BookmarkGroup {
        id: new_group_id(),
        group_name: slot.group_name.clone(),
        bookmarks: Vec::new(),
    });
    let index = destination.len() - 1;
    slot.dest_index = Some(index);
    index
}

fn plan_group_copy(source: &[BookmarkGroup], raw_group_id: &str) -> EngineResult<(Vec<Slot>, Vec<WorkItem>, Removal)> {
    let picked: Vec<&BookmarkGroup> = match GroupSelection::parse(raw_group_id)? {
        GroupSelection::All => source.iter().filter(|group| !group.is_placeholder()).collect(),
        GroupSelection::Ids(ids) => ids
            .iter()
            .filter_map(|id| source.iter().find(|group| &group.id == id && !group.is_placeholder()))
            .collect(),
    };
    if picked.is_empty() && raw_group_id.trim() != ALL_GROUPS_SENTINEL {
        return Err(EngineError::NotFound(format!("Source group {} not found", raw_group_id)));
    }

    let slots = picked
        .iter()
        .map(|group| Slot {
            group_name: group.group_name.clone(),
            dest_index: None,
        })
        .collect();
    let mut work = Vec::new();
    for (slot, group) in picked.iter().enumerate() {
        if group.bookmarks.is_empty() {
            work.push(WorkItem {
                slot,
                source_group_id: group.id.clone(),
                bookmark: None,
            });
        }
        work.extend(group.bookmarks.iter().map(|bookmark| WorkItem {
            slot,
            source_group_id: group.id.clone(),
            bookmark: Some(bookmark.clone()),
        }));
    }
    let removal = Removal::Groups(picked.iter().map(|group| group.id.clone()).collect());
    Ok((slots, work, removal))
}

fn plan_bookmark_copy(
    source: &[BookmarkGroup],
    bookmark_ids: &[String],
    dest_index: usize,
) -> (Vec<Slot>, Vec<WorkItem>, Removal) {
    let wanted: HashSet<String> = bookmark_ids.iter().cloned().collect();
    let work = source
        .iter()
        .flat_map(|group| {
            group
                .bookmarks
                .iter()
                .filter(|bookmark| wanted.contains(&bookmark.id))
                .map(move |bookmark| WorkItem {
                    slot: 0,
                    source_group_id: group.id.clone(),
                    bookmark: Some(bookmark.clone()),
                })
        })
        .collect();
    let slots = vec![Slot {
        group_name: String::new(),
        dest_index: Some(dest_index),
    }];
    (slots, work, Removal::Bookmarks(wanted))
}

fn remove_selection(source: Vec<BookmarkGroup>, removal: &Removal) -> Vec<BookmarkGroup> {
    match removal {
        Removal::Groups(ids) => source.into_iter().filter(|group| !ids.contains(&group.id)).collect(),
        Removal::Bookmarks(ids) => source
            .into_iter()
            .map(|mut group| {
                group.bookmarks.retain(|bookmark| !ids.contains(&bookmark.id));
                group
            })
            .collect(),
    }
}

/// After a cancellation only the bookmarks that were actually processed
/// leave the source; selected groups are dropped once emptied or once
/// copied as empty groups.
fn remove_processed(source: Vec<BookmarkGroup>, run: &CopyRun) -> Vec<BookmarkGroup> {
    let processed = &run.processed;
    source
        .into_iter()
        .filter_map(|mut group| {
            let before = group.bookmarks.len();
            let group_id = group.id.clone();
            group
                .bookmarks
                .retain(|bookmark| !processed.contains(&(group_id.clone(), bookmark.id.clone())));
            let emptied = before > 0 && group.bookmarks.is_empty();
            match &run.removal {
                Removal::Groups(_) if run.copied_empty_groups.contains(&group.id) => None,
                Removal::Groups(ids) if emptied && ids.contains(&group.id) => None,
                _ => Some(group),
            }
        })
        .collect()
}
