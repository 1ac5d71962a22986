use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::Context;
use async_trait::async_trait;
use lotwatch_core::{normalize_text, RawCandidate};
use lotwatch_storage::HttpFetcher;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{text_or_none, AdapterContext, AdapterError, SourceAdapter, SourceBatch};

static ITEM_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/marketplace/item/(\d+)").expect("marketplace item regex must compile")
});

/// A rendered marketplace results page captured as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    #[serde(default)]
    pub base_url: Option<String>,
    pub items: Vec<SnapshotItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub title: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub mileage: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Card thumbnail.
    #[serde(default)]
    pub image: Option<String>,
}

impl SnapshotItem {
    /// Numeric item id from the url; otherwise a stable digest of title and price.
    pub fn local_id(&self) -> String {
        if let Some(id) = self
            .url
            .as_deref()
            .and_then(|url| ITEM_ID.captures(url))
            .and_then(|c| c.get(1))
        {
            return id.as_str().to_string();
        }
        let key = format!(
            "{}|{}",
            normalize_text(&self.title),
            self.price.as_deref().map(normalize_text).unwrap_or_default()
        );
        format!(
            "h-{}",
            Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).simple()
        )
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotAdapter {
    name: String,
    path: PathBuf,
}

impl SnapshotAdapter {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn candidates_from(&self, snapshot: &SnapshotFile) -> Vec<RawCandidate> {
        snapshot
            .items
            .iter()
            .filter_map(|item| {
                let title = text_or_none(&item.title)?;
                let mut candidate = RawCandidate::new(&self.name, item.local_id(), title);
                candidate.price = item.price.as_deref().and_then(text_or_none);
                candidate.mileage = item.mileage.as_deref().and_then(text_or_none);
                candidate.location = item.location.as_deref().and_then(text_or_none);
                candidate.url = item.url.as_deref().map(|url| absolute(snapshot, url));
                candidate.image_urls = item
                    .image
                    .as_deref()
                    .and_then(text_or_none)
                    .map(|url| vec![absolute(snapshot, &url)])
                    .unwrap_or_default();
                Some(candidate)
            })
            .collect()
    }
}

fn absolute(snapshot: &SnapshotFile, url: &str) -> String {
    match &snapshot.base_url {
        Some(base) if url.starts_with('/') => format!("{}{}", base.trim_end_matches('/'), url),
        _ => url.to_string(),
    }
}

#[async_trait]
impl SourceAdapter for SnapshotAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn collect(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<SourceBatch, AdapterError> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading snapshot {}", self.path.display()))?;
        let snapshot: SnapshotFile = serde_json::from_str(&data)
            .map_err(|e| AdapterError::Parse(format!("{}: {e}", self.path.display())))?;
        Ok(SourceBatch {
            candidates: self.candidates_from(&snapshot),
            ..SourceBatch::default()
        })
    }
}
