//! Raw candidate -> typed candidate. Pure: no store, no clock beyond the `now` passed in.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use lotwatch_core::{
    fingerprint, global_listing_id, vehicle_age, CandidatePath, NormalizedCandidate, RawCandidate,
};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::seller::{SellerExtractor, SellerTerms};

const BUILTIN_VOCABULARY: &str = include_str!("../../../rules/vocabulary.yaml");
const BUILTIN_EXCLUSIONS: &str = include_str!("../../../rules/exclusions.yaml");

static YEAR_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})\b").expect("year regex must compile"));
static MILEAGE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s*(k\b)?").expect("mileage regex must compile")
});
static MILEAGE_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d[\d,]*(?:\.\d+)?)\s*(k)?\s*(?:miles|mi)\b")
        .expect("mileage mention regex must compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizerConfig {
    /// Oldest accepted model year is `current_year - max_vehicle_age_years`.
    pub max_vehicle_age_years: i32,
    pub min_price: i64,
    pub max_price: i64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_vehicle_age_years: 15,
            min_price: 1_000,
            max_price: 80_000,
        }
    }
}

/// Why a candidate never reaches identity resolution. Not an error: counted, not raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("candidate has no source or source-local id")]
    MissingIdentity,
    #[error("candidate has no title")]
    MissingTitle,
    #[error("no model year within {min}..={max}")]
    MissingYear { min: i32, max: i32 },
    #[error("price {price} outside {min}..={max}")]
    PriceOutOfBounds { price: i64, min: i64, max: i64 },
    #[error("excluded by pattern `{pattern}`")]
    Excluded { pattern: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct VocabularyFile {
    #[allow(dead_code)]
    version: u32,
    pub makes: Vec<MakeEntry>,
    #[serde(default)]
    pub seller: SellerTerms,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MakeEntry {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExclusionsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// A vocabulary term compiled to a case-insensitive, word-bounded regex.
#[derive(Debug, Clone)]
pub(crate) struct Term {
    pub(crate) display: String,
    weight: usize,
    pub(crate) regex: Regex,
}

impl Term {
    pub(crate) fn compile(term: &str, display: &str) -> Result<Self> {
        let parts: Vec<String> = term
            .split(|c: char| c == '-' || c.is_whitespace())
            .filter(|p| !p.is_empty())
            .map(regex::escape)
            .collect();
        let pattern = format!(r"(?i)\b{}\b", parts.join(r"[-\s]?"));
        Ok(Self {
            display: display.to_string(),
            weight: parts.iter().map(String::len).sum(),
            regex: Regex::new(&pattern).with_context(|| format!("compiling term `{term}`"))?,
        })
    }
}

#[derive(Debug, Clone)]
struct Make {
    terms: Vec<Term>,
    models: Vec<Term>,
}

/// Longest match wins; ties go to the earlier vocabulary entry.
fn longest_match<'a>(terms: impl Iterator<Item = &'a Term>, text: &str) -> Option<&'a Term> {
    let mut best: Option<&'a Term> = None;
    for term in terms.filter(|t| t.regex.is_match(text)) {
        if best.map_or(true, |b| term.weight > b.weight) {
            best = Some(term);
        }
    }
    best
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    config: NormalizerConfig,
    makes: Vec<Make>,
    exclusions: Vec<(String, Regex)>,
    seller: SellerExtractor,
}

impl Normalizer {
    pub fn new(
        config: NormalizerConfig,
        vocabulary: &VocabularyFile,
        exclusions: &ExclusionsFile,
    ) -> Result<Self> {
        let makes = vocabulary
            .makes
            .iter()
            .map(|entry| {
                let mut terms = vec![Term::compile(&entry.name, &entry.name)?];
                for alias in &entry.aliases {
                    terms.push(Term::compile(alias, &entry.name)?);
                }
                let models = entry
                    .models
                    .iter()
                    .map(|m| Term::compile(m, m))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Make { terms, models })
            })
            .collect::<Result<Vec<_>>>()?;

        let exclusions = exclusions
            .patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){p}"))
                    .map(|re| (p.clone(), re))
                    .with_context(|| format!("compiling exclusion pattern `{p}`"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            makes,
            exclusions,
            seller: SellerExtractor::new(&vocabulary.seller)?,
        })
    }

    /// Built-in vocabulary and exclusion list.
    pub fn builtin(config: NormalizerConfig) -> Result<Self> {
        let vocabulary: VocabularyFile =
            serde_yaml::from_str(BUILTIN_VOCABULARY).context("parsing built-in vocabulary")?;
        let exclusions: ExclusionsFile =
            serde_yaml::from_str(BUILTIN_EXCLUSIONS).context("parsing built-in exclusions")?;
        Self::new(config, &vocabulary, &exclusions)
    }

    /// Load `rules/vocabulary.yaml` and `rules/exclusions.yaml`, falling back to the
    /// built-in copy of whichever file is absent.
    pub fn from_workspace_root(root: &Path, config: NormalizerConfig) -> Result<Self> {
        let rules_dir = root.join("rules");
        let vocabulary_text = read_optional(&rules_dir.join("vocabulary.yaml"))?
            .unwrap_or_else(|| BUILTIN_VOCABULARY.to_string());
        let exclusions_text = read_optional(&rules_dir.join("exclusions.yaml"))?
            .unwrap_or_else(|| BUILTIN_EXCLUSIONS.to_string());
        let vocabulary: VocabularyFile =
            serde_yaml::from_str(&vocabulary_text).context("parsing rules/vocabulary.yaml")?;
        let exclusions: ExclusionsFile =
            serde_yaml::from_str(&exclusions_text).context("parsing rules/exclusions.yaml")?;
        Self::new(config, &vocabulary, &exclusions)
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn exclusion_patterns(&self) -> Vec<Regex> {
        self.exclusions.iter().map(|(_, re)| re.clone()).collect()
    }

    pub fn normalize(
        &self,
        raw: &RawCandidate,
        now: DateTime<Utc>,
    ) -> Result<NormalizedCandidate, Rejection> {
        let source = raw.source.trim();
        let source_local_id = raw.source_local_id.trim();
        if source.is_empty() || source_local_id.is_empty() {
            return Err(Rejection::MissingIdentity);
        }
        let title = clean_text(&raw.title).ok_or(Rejection::MissingTitle)?;
        let description = raw.description.as_deref().and_then(clean_text);
        let location = raw.location.as_deref().and_then(clean_text);

        if let Some((pattern, _)) = self.exclusions.iter().find(|(_, re)| re.is_match(&title)) {
            return Err(Rejection::Excluded {
                pattern: pattern.clone(),
            });
        }

        let max_year = now.year();
        let min_year = max_year.saturating_sub(self.config.max_vehicle_age_years.max(0));
        let year = extract_year(&title, min_year, max_year).or_else(|| {
            description
                .as_deref()
                .and_then(|d| extract_year(d, min_year, max_year))
        });
        if year.is_none() && raw.path == CandidatePath::Detail {
            return Err(Rejection::MissingYear {
                min: min_year,
                max: max_year,
            });
        }

        let price = match raw.price.as_deref().and_then(parse_price) {
            Some(price) if price < self.config.min_price || price > self.config.max_price => {
                return Err(Rejection::PriceOutOfBounds {
                    price,
                    min: self.config.min_price,
                    max: self.config.max_price,
                })
            }
            other => other,
        };

        let mileage = raw
            .mileage
            .as_deref()
            .and_then(parse_mileage)
            .or_else(|| mileage_mention(&title))
            .or_else(|| description.as_deref().and_then(mileage_mention));

        let (make, model) = self.resolve_make_model(&title);
        let seller = description
            .as_deref()
            .map(|d| self.seller.extract(d))
            .unwrap_or_default();
        let images = image_links(&raw.image_urls);

        Ok(NormalizedCandidate {
            listing_id: global_listing_id(source, source_local_id),
            source: source.to_string(),
            source_local_id: source_local_id.to_string(),
            url: raw.url.as_deref().and_then(clean_text),
            fingerprint: fingerprint(&title, price, location.as_deref()),
            title,
            description,
            year,
            make,
            model,
            price,
            mileage,
            location,
            attributes: raw
                .attributes
                .iter()
                .filter_map(|(k, v)| clean_text(v).map(|v| (k.clone(), v)))
                .collect(),
            vehicle_age: vehicle_age(year, now),
            primary_image_url: images.first().cloned(),
            image_count: (!images.is_empty()).then(|| i64::try_from(images.len()).unwrap_or(i64::MAX)),
            seller,
        })
    }

    /// Model is only looked up in the resolved make's allow-list.
    pub fn resolve_make_model(&self, text: &str) -> (Option<String>, Option<String>) {
        let mut best: Option<(&Make, &Term)> = None;
        for make in &self.makes {
            let Some(term) = longest_match(make.terms.iter(), text) else {
                continue;
            };
            if best.map_or(true, |(_, b)| term.weight > b.weight) {
                best = Some((make, term));
            }
        }
        let Some((make, make_term)) = best else {
            return (None, None);
        };
        let model = longest_match(make.models.iter(), text).map(|t| t.display.clone());
        (Some(make_term.display.clone()), model)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

fn clean_text(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Absolute http(s) links, first occurrence order, repeats dropped.
fn image_links(urls: &[String]) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for url in urls.iter().map(|u| u.trim()) {
        let absolute = url.starts_with("https://") || url.starts_with("http://");
        if absolute && !links.iter().any(|l| l == url) {
            links.push(url.to_string());
        }
    }
    links
}

/// First 4-digit token inside `[min, max]`.
pub fn extract_year(text: &str, min: i32, max: i32) -> Option<i32> {
    YEAR_TOKEN
        .captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<i32>().ok())
        .find(|year| (min..=max).contains(year))
}

/// Integer price from text like "$24,500" or "24500.00". No digits means unknown.
pub fn parse_price(text: &str) -> Option<i64> {
    let whole = text.split('.').next().unwrap_or_default();
    let digits: String = whole.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    // Absurdly long digit runs are out of bounds, not unknown.
    Some(digits.parse::<i64>().unwrap_or(i64::MAX))
}

fn scale(number: &str, thousands: bool) -> Option<i64> {
    let cleaned: String = number.chars().filter(|c| *c != ',').collect();
    let (whole, frac) = cleaned.split_once('.').unwrap_or((cleaned.as_str(), ""));
    let whole: i64 = whole.parse().ok()?;
    if !thousands {
        return Some(whole);
    }
    let frac: String = frac.chars().chain(std::iter::repeat('0')).take(3).collect();
    whole.checked_mul(1000)?.checked_add(frac.parse().ok()?)
}

/// Mileage field text: "98,400", "123K miles", "5.4k". Unparsable is unknown.
pub fn parse_mileage(text: &str) -> Option<i64> {
    let caps = MILEAGE_FIELD.captures(text)?;
    scale(caps.get(1)?.as_str(), caps.get(2).is_some())
}

/// A "<n>[k] miles" mention inside free text.
pub fn mileage_mention(text: &str) -> Option<i64> {
    let caps = MILEAGE_MENTION.captures(text)?;
    scale(caps.get(1)?.as_str(), caps.get(2).is_some())
}
