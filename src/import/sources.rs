use crate::models::{ImportItem, ItemSource};
use async_trait::async_trait;
use std::sync::Arc;

/// A browser signal feeding smart import (saved bookmarks, open tabs, history).
#[async_trait]
pub trait SourceCollector: Send + Sync {
    fn source(&self) -> ItemSource;

    /// `history_limit` only applies to history collectors.
    async fn collect(&self, history_limit: usize) -> anyhow::Result<Vec<ImportItem>>;
}

/// Fixed list of items. Used for embedding and tests.
pub struct StaticCollector {
    source: ItemSource,
    items: Vec<ImportItem>,
}

impl StaticCollector {
    pub fn new(source: ItemSource, items: Vec<ImportItem>) -> Self {
        Self { source, items }
    }
}

#[async_trait]
impl SourceCollector for StaticCollector {
    fn source(&self) -> ItemSource {
        self.source
    }

    async fn collect(&self, history_limit: usize) -> anyhow::Result<Vec<ImportItem>> {
        let items = self.items.iter().cloned();
        Ok(match self.source {
            ItemSource::History => items.take(history_limit).collect(),
            _ => items.collect(),
        })
    }
}

/// Picks the collectors a run should use. Requested sources without a
/// collector are logged and skipped.
pub(crate) fn select_collectors(
    collectors: &[Arc<dyn SourceCollector>],
    requested: Option<&[ItemSource]>,
) -> Vec<Arc<dyn SourceCollector>> {
    let wanted = requested.map(<[ItemSource]>::to_vec).unwrap_or_else(ItemSource::all);
    for source in &wanted {
        if !collectors.iter().any(|collector| collector.source() == *source) {
            tracing::warn!(source = source.as_str(), "no collector configured for source");
        }
    }
    collectors
        .iter()
        .filter(|collector| wanted.contains(&collector.source()))
        .cloned()
        .collect()
}
