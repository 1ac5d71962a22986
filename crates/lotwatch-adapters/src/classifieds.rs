use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use lotwatch_core::{CandidatePath, RawCandidate};
use lotwatch_storage::HttpFetcher;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::{text_or_none, AdapterContext, AdapterError, SourceAdapter, SourceBatch};

static POSTING_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\d+)\.html").expect("posting id regex must compile"));

/// Detail-page attribute labels worth keeping, mapped to attribute keys.
const ATTRIBUTE_LABELS: &[(&str, &str)] = &[
    ("drive", "drive"),
    ("transmission", "transmission"),
    ("fuel", "fuel"),
    ("condition", "condition"),
    ("title status", "title_status"),
    ("paint color", "paint_color"),
    ("type", "body_type"),
    ("cylinders", "cylinders"),
];

/// One row of a search results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRow {
    pub local_id: String,
    pub url: String,
    pub title: String,
    pub price: Option<String>,
    pub location: Option<String>,
}

impl SearchRow {
    fn into_candidate(self, source: &str) -> RawCandidate {
        let mut candidate = RawCandidate::new(source, self.local_id, self.title);
        candidate.url = Some(self.url);
        candidate.price = self.price;
        candidate.location = self.location;
        candidate
    }
}

/// What to do with one search row this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowPlan {
    /// Fetch the detail page.
    Detail(SearchRow),
    /// Hand the scan-level observation straight to the pipeline.
    Scan(RawCandidate),
}

/// Classified-ads site: search result pages, then one detail page per posting.
#[derive(Debug, Clone)]
pub struct ClassifiedsAdapter {
    name: String,
    search_urls: Vec<String>,
    title_exclusions: Vec<Regex>,
}

impl ClassifiedsAdapter {
    pub fn new(name: impl Into<String>, search_urls: Vec<String>) -> Self {
        Self {
            name: name.into(),
            search_urls,
            title_exclusions: Vec::new(),
        }
    }

    pub fn with_title_exclusions(mut self, patterns: Vec<Regex>) -> Self {
        self.title_exclusions = patterns;
        self
    }

    fn excluded(&self, title: &str) -> bool {
        self.title_exclusions.iter().any(|re| re.is_match(title))
    }

    /// Excluded titles skip the detail fetch but still go downstream as scan
    /// candidates, where they are rejected and counted. Rows past the detail budget
    /// keep their scan-level observation so the listing stays seen.
    pub fn plan_rows(&self, rows: Vec<SearchRow>, max_detail_fetches: usize) -> Vec<RowPlan> {
        let mut details = 0usize;
        rows.into_iter()
            .map(|row| {
                if self.excluded(&row.title) {
                    debug!(source = %self.name, title = %row.title, "excluded title; skipping detail fetch");
                    return RowPlan::Scan(row.into_candidate(&self.name));
                }
                if details >= max_detail_fetches {
                    return RowPlan::Scan(row.into_candidate(&self.name));
                }
                details += 1;
                RowPlan::Detail(row)
            })
            .collect()
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(format!("selector `{css}`: {e}")))
}

fn first_text(root: ElementRef<'_>, sel: &Selector) -> Option<String> {
    root.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Extract result rows. Rows without a posting id in their link are skipped.
pub fn parse_search_page(html: &str) -> Result<Vec<SearchRow>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector("li.cl-static-search-result")?;
    let link_sel = selector("a[href]")?;
    let title_sel = selector(".title")?;
    let price_sel = selector(".price")?;
    let location_sel = selector(".location")?;

    let mut rows = Vec::new();
    for row in document.select(&row_sel) {
        let Some(url) = row
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string)
        else {
            continue;
        };
        let Some(local_id) = POSTING_ID
            .captures(&url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        else {
            continue;
        };
        let Some(title) = first_text(row, &title_sel)
            .or_else(|| row.value().attr("title").and_then(text_or_none))
        else {
            continue;
        };

        rows.push(SearchRow {
            local_id,
            url,
            title,
            price: first_text(row, &price_sel),
            location: first_text(row, &location_sel),
        });
    }
    Ok(rows)
}

/// Enrich a search row with its detail page: attribute table, body text, seller type.
pub fn parse_detail_page(
    source: &str,
    row: &SearchRow,
    html: &str,
) -> Result<RawCandidate, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let title_sel = selector("#titletextonly")?;
    let price_sel = selector(".postingtitletext .price")?;
    let attr_sel = selector(".attrgroup .attr")?;
    let label_sel = selector(".labl")?;
    let value_sel = selector(".valu")?;
    let body_sel = selector("section#postingbody")?;
    let thumb_sel = selector("#thumbs a[href]")?;

    let mut candidate = row.clone().into_candidate(source);
    candidate.path = CandidatePath::Detail;
    if let Some(title) = first_text(root, &title_sel) {
        candidate.title = title;
    }
    if let Some(price) = first_text(root, &price_sel) {
        candidate.price = Some(price);
    }

    let mut attributes = BTreeMap::new();
    for attr in document.select(&attr_sel) {
        let (Some(label), Some(value)) = (first_text(attr, &label_sel), first_text(attr, &value_sel))
        else {
            continue;
        };
        let label = label.trim_end_matches(':').to_lowercase();
        if label == "odometer" {
            candidate.mileage = Some(value);
            continue;
        }
        if let Some((_, key)) = ATTRIBUTE_LABELS.iter().find(|(l, _)| *l == label) {
            attributes.insert((*key).to_string(), value);
        }
    }

    candidate.description = document
        .select(&body_sel)
        .next()
        .and_then(|body| {
            text_or_none(
                body.text()
                    .collect::<String>()
                    .replace("QR Code Link to This Post", ""),
            )
        });

    candidate.image_urls = document
        .select(&thumb_sel)
        .filter_map(|a| a.value().attr("href"))
        .map(str::to_string)
        .collect();

    if row.url.contains("/ctd/") {
        attributes.insert("seller_type".into(), "dealer".into());
    } else if row.url.contains("/cto/") {
        attributes.insert("seller_type".into(), "owner".into());
    }
    candidate.attributes = attributes;
    Ok(candidate)
}

#[async_trait]
impl SourceAdapter for ClassifiedsAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<SourceBatch, AdapterError> {
        let mut rows = Vec::new();
        let mut seen_ids = HashSet::new();
        let mut last_error = None;
        let mut pages_ok = 0usize;

        for url in &self.search_urls {
            match http.fetch_text(ctx.run_id, &self.name, url).await {
                Ok(html) => {
                    pages_ok += 1;
                    for row in parse_search_page(&html)? {
                        // General and model-specific searches overlap.
                        if seen_ids.insert(row.local_id.clone()) {
                            rows.push(row);
                        }
                    }
                }
                Err(err) => {
                    warn!(source = %self.name, url, error = %err, "search page fetch failed");
                    last_error = Some(err);
                }
            }
        }
        if pages_ok == 0 {
            if let Some(err) = last_error {
                return Err(err.into());
            }
        }

        let mut batch = SourceBatch::default();
        for plan in self.plan_rows(rows, ctx.max_detail_fetches) {
            let row = match plan {
                RowPlan::Scan(candidate) => {
                    batch.candidates.push(candidate);
                    continue;
                }
                RowPlan::Detail(row) => row,
            };

            batch.detail_pages_fetched += 1;
            match http.fetch_text(ctx.run_id, &self.name, &row.url).await {
                Ok(html) => batch
                    .candidates
                    .push(parse_detail_page(&self.name, &row, &html)?),
                Err(err) => {
                    warn!(source = %self.name, url = %row.url, error = %err, "detail fetch failed; dropping candidate");
                    batch.dropped += 1;
                }
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH: &str = include_str!("../../../fixtures/classifieds/search.html");
    const DETAIL: &str = include_str!("../../../fixtures/classifieds/detail.html");

    #[test]
    fn search_rows_carry_id_title_price_location() {
        let rows = parse_search_page(SEARCH).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].local_id, "7788123401");
        assert_eq!(rows[0].title, "2018 Ford F-150 XLT SuperCrew 4x4");
        assert_eq!(rows[0].price.as_deref(), Some("$24,500"));
        assert_eq!(rows[0].location.as_deref(), Some("Warren"));
        // Third row has no price element.
        assert_eq!(rows[2].price, None);
    }

    #[test]
    fn rows_without_posting_id_are_skipped() {
        let html = r#"<ul><li class="cl-static-search-result"><a href="/about"><div class="title">x</div></a></li></ul>"#;
        assert!(parse_search_page(html).unwrap().is_empty());
    }

    #[test]
    fn detail_page_fills_mileage_attributes_and_body() {
        let rows = parse_search_page(SEARCH).unwrap();
        let candidate = parse_detail_page("classifieds", &rows[0], DETAIL).unwrap();

        assert_eq!(candidate.path, CandidatePath::Detail);
        assert_eq!(candidate.source_local_id, "7788123401");
        assert_eq!(candidate.mileage.as_deref(), Some("98,400"));
        assert_eq!(candidate.attributes.get("drive").map(String::as_str), Some("4wd"));
        assert_eq!(
            candidate.attributes.get("title_status").map(String::as_str),
            Some("clean")
        );
        assert_eq!(
            candidate.attributes.get("seller_type").map(String::as_str),
            Some("owner")
        );
        assert_eq!(candidate.image_urls.len(), 3);
        assert!(candidate.image_urls[0].ends_with("f150front_600x450.jpg"));
        let body = candidate.description.unwrap();
        assert!(body.starts_with("One owner truck"), "{body}");
        assert!(!body.contains("QR Code"));
    }

    #[test]
    fn excluded_rows_become_scan_candidates_without_spending_budget() {
        let mut rows = parse_search_page(SEARCH).unwrap();
        rows[0].title = "2019 Isuzu Box Truck 16ft".into();
        let adapter = ClassifiedsAdapter::new("classifieds", vec![])
            .with_title_exclusions(vec![Regex::new(r"(?i)\bbox\s+truck\b").unwrap()]);

        let plans = adapter.plan_rows(rows, 1);
        assert_eq!(plans.len(), 3);
        let RowPlan::Scan(excluded) = &plans[0] else {
            panic!("excluded row should not be fetched: {:?}", plans[0]);
        };
        assert_eq!(excluded.source, "classifieds");
        assert_eq!(excluded.path, CandidatePath::Scan);
        assert_eq!(excluded.title, "2019 Isuzu Box Truck 16ft");
        assert!(matches!(&plans[1], RowPlan::Detail(row) if row.local_id == "7788123402"));
        // Budget of one already spent on the second row.
        assert!(matches!(&plans[2], RowPlan::Scan(c) if c.source_local_id == "7788123403"));
    }

    #[test]
    fn title_exclusions_match_case_insensitively() {
        let adapter = ClassifiedsAdapter::new("classifieds", vec![])
            .with_title_exclusions(vec![Regex::new(r"(?i)\bbox\s+truck\b").unwrap()]);
        assert!(adapter.excluded("2019 Isuzu BOX TRUCK 16ft"));
        assert!(!adapter.excluded("2019 Toyota Tacoma"));
    }
}
