use crate::errors::{EngineError, EngineResult};
use crate::models::{
    ClassifiedGroup, GroupingRequest, GroupingResponse, ImportItem, DEFAULT_PURPOSE, FALLBACK_GROUP_NAME,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

static LOCAL_HOST_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^localhost$").expect("valid regex"),
        Regex::new(r"\.local$").expect("valid regex"),
        Regex::new(r"^127\.\d+\.\d+\.\d+$").expect("valid regex"),
        Regex::new(r"^0\.0\.0\.0$").expect("valid regex"),
    ]
});

#[async_trait]
pub trait SafetyClassifier: Send + Sync {
    async fn is_safe(&self, item: &ImportItem) -> bool;
}

#[async_trait]
pub trait GroupingClassifier: Send + Sync {
    async fn group(&self, request: GroupingRequest) -> EngineResult<GroupingResponse>;
}

/// Response of the heavy (usually network) classification service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteClassification {
    pub success: bool,
    #[serde(default)]
    pub groups: Vec<ClassifiedGroup>,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait RemoteClassifier: Send + Sync {
    async fn classify(&self, request: &GroupingRequest) -> anyhow::Result<RemoteClassification>;
}

/// Accepts http(s) URLs whose host is not on the block list. Device-local
/// hosts are always blocked.
#[derive(Default)]
pub struct RuleSafetyClassifier {
    blocked_hosts: Vec<Regex>,
}

impl RuleSafetyClassifier {
    pub fn new(blocked_host_patterns: &[&str]) -> EngineResult<Self> {
        let blocked_hosts = blocked_host_patterns
            .iter()
            .map(|pattern| {
                Regex::new(&format!("(?i){}", pattern)).map_err(|err| {
                    EngineError::Validation(format!("Invalid blocked host pattern '{}': {}", pattern, err))
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self { blocked_hosts })
    }

    pub fn check_url(&self, raw: &str) -> bool {
        let Ok(url) = Url::parse(raw.trim()) else {
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        !LOCAL_HOST_PATTERNS
            .iter()
            .chain(self.blocked_hosts.iter())
            .any(|pattern| pattern.is_match(&host))
    }
}

#[async_trait]
impl SafetyClassifier for RuleSafetyClassifier {
    async fn is_safe(&self, item: &ImportItem) -> bool {
        self.check_url(&item.url)
    }
}

/// Grouping policy around an optional remote classifier:
/// below `min_items` the remote is skipped, above `max_items` only the first
/// `max_items` are sent, and any remote failure falls back to one local
/// group holding every input item.
pub struct PolicyGroupingClassifier {
    remote: Option<Arc<dyn RemoteClassifier>>,
    min_items: usize,
    max_items: usize,
}

impl PolicyGroupingClassifier {
    pub fn new(remote: Option<Arc<dyn RemoteClassifier>>, min_items: usize, max_items: usize) -> Self {
        Self {
            remote,
            min_items,
            max_items: max_items.max(1),
        }
    }
}

#[async_trait]
impl GroupingClassifier for PolicyGroupingClassifier {
    async fn group(&self, request: GroupingRequest) -> EngineResult<GroupingResponse> {
        if request.items.is_empty() {
            return Ok(GroupingResponse::default());
        }
        let Some(remote) = &self.remote else {
            return Ok(fallback_response(request));
        };
        if request.items.len() < self.min_items {
            tracing::debug!(
                items = request.items.len(),
                min_items = self.min_items,
                "too few items for remote classification"
            );
            return Ok(fallback_response(request));
        }

        let outbound = if request.items.len() > self.max_items {
            tracing::info!(
                items = request.items.len(),
                max_items = self.max_items,
                "truncating items sent for classification"
            );
            GroupingRequest {
                items: request.items[..self.max_items].to_vec(),
                purposes: request.purposes.clone(),
            }
        } else {
            request.clone()
        };

        match remote.classify(&outbound).await {
            Ok(response) if response.success => Ok(GroupingResponse {
                groups: response.groups,
            }),
            Ok(response) => {
                tracing::warn!(
                    error = response.error.as_deref().unwrap_or("unspecified"),
                    "classifier reported failure; using fallback group"
                );
                Ok(fallback_response(request))
            }
            Err(error) => {
                tracing::warn!(error = %error, "classifier unavailable; using fallback group");
                Ok(fallback_response(request))
            }
        }
    }
}

fn fallback_response(request: GroupingRequest) -> GroupingResponse {
    let purpose = request
        .purposes
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_PURPOSE.to_string());
    GroupingResponse {
        groups: vec![ClassifiedGroup {
            id: None,
            name: FALLBACK_GROUP_NAME.to_string(),
            description: None,
            purpose,
            items: request.items,
        }],
    }
}
