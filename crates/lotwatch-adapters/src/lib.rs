//! Source adapter contract, source registry entries, and the built-in adapters.

mod classifieds;
mod snapshot;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lotwatch_core::RawCandidate;
use lotwatch_storage::{FetchError, HttpFetcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use classifieds::{
    parse_detail_page, parse_search_page, ClassifiedsAdapter, RowPlan, SearchRow,
};
pub use snapshot::{SnapshotAdapter, SnapshotFile, SnapshotItem};

pub const CRATE_NAME: &str = "lotwatch-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// HTML search result pages plus per-listing detail pages.
    Classifieds,
    /// JSON capture of a rendered marketplace page.
    Snapshot,
    /// JSON array of raw candidates, imported as-is.
    Manual,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub search_urls: Vec<String>,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default)]
    pub max_detail_fetches: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Upper bound on detail-page requests for this source in this cycle.
    pub max_detail_fetches: usize,
}

/// Everything one source produced in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBatch {
    pub candidates: Vec<RawCandidate>,
    pub detail_pages_fetched: usize,
    /// Candidates lost to failed or timed-out detail fetches.
    pub dropped: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;

    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<SourceBatch, AdapterError>;
}

/// Fixed candidate list. Backs the `manual` source kind and test harnesses.
#[derive(Debug, Clone)]
pub struct StaticAdapter {
    name: String,
    candidates: Vec<RawCandidate>,
}

impl StaticAdapter {
    pub fn new(name: impl Into<String>, candidates: Vec<RawCandidate>) -> Self {
        Self {
            name: name.into(),
            candidates,
        }
    }

    pub fn from_json_file(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let candidates: Vec<RawCandidate> =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(name, candidates))
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn collect(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<SourceBatch, AdapterError> {
        let candidates = self
            .candidates
            .iter()
            .cloned()
            .map(|mut c| {
                c.source = self.name.clone();
                c
            })
            .collect();
        Ok(SourceBatch {
            candidates,
            ..SourceBatch::default()
        })
    }
}

/// Build the adapter for a registry entry. Relative paths resolve against `workspace_root`.
///
/// `title_exclusions` lets the classifieds adapter skip detail fetches for titles the
/// normalizer will reject; those rows still reach it as scan candidates.
pub fn adapter_for_source(
    config: &SourceConfig,
    workspace_root: &Path,
    title_exclusions: &[Regex],
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    let resolve = |p: &PathBuf| {
        if p.is_absolute() {
            p.clone()
        } else {
            workspace_root.join(p)
        }
    };

    match config.kind {
        SourceKind::Classifieds => {
            if config.search_urls.is_empty() {
                return Err(AdapterError::Message(format!(
                    "source `{}` has no search_urls",
                    config.name
                )));
            }
            Ok(Box::new(
                ClassifiedsAdapter::new(config.name.clone(), config.search_urls.clone())
                    .with_title_exclusions(title_exclusions.to_vec()),
            ))
        }
        SourceKind::Snapshot => {
            let path = config.snapshot_path.as_ref().ok_or_else(|| {
                AdapterError::Message(format!("source `{}` has no snapshot_path", config.name))
            })?;
            Ok(Box::new(SnapshotAdapter::new(config.name.clone(), resolve(path))))
        }
        SourceKind::Manual => {
            let path = config.snapshot_path.as_ref().ok_or_else(|| {
                AdapterError::Message(format!("source `{}` has no snapshot_path", config.name))
            })?;
            Ok(Box::new(StaticAdapter::from_json_file(
                config.name.clone(),
                resolve(path),
            )?))
        }
    }
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let collapsed = value.as_ref().split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}
