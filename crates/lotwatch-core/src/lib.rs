//! Core domain model for lotwatch: raw observations, canonical listings, and audit records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotwatch-core";

/// Namespace for deterministic listing ids derived from (source, source-local id).
pub const LISTING_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c6f_7477_6174_6368_8000_0000_0000_0001);

/// How a candidate was obtained. Detail pages carry enough text to require a year;
/// lightweight scans (search rows, page snapshots) may defer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CandidatePath {
    #[default]
    Scan,
    Detail,
}

/// Loosely-typed handoff contract from source adapters into the pipeline.
///
/// Every optional field is "unknown" when absent; adapters must not substitute
/// zero or empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source: String,
    pub source_local_id: String,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub mileage: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Photo links in page order.
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub path: CandidatePath,
}

impl RawCandidate {
    pub fn new(
        source: impl Into<String>,
        source_local_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            source_local_id: source_local_id.into(),
            title: title.into(),
            url: None,
            description: None,
            price: None,
            mileage: None,
            location: None,
            attributes: BTreeMap::new(),
            image_urls: Vec::new(),
            path: CandidatePath::Scan,
        }
    }
}

/// What the seller's free text says about the vehicle's condition and upkeep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerInfo {
    /// Coarse grade: excellent, very good, good, fair or poor.
    pub condition: Option<String>,
    pub maintenance: Vec<String>,
    pub issues: Vec<String>,
    pub service_records: Vec<String>,
}

impl SellerInfo {
    pub fn is_empty(&self) -> bool {
        self.condition.is_none()
            && self.maintenance.is_empty()
            && self.issues.is_empty()
            && self.service_records.is_empty()
    }
}

/// Typed candidate produced by the normalizer, ready for identity resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedCandidate {
    pub listing_id: Uuid,
    pub source: String,
    pub source_local_id: String,
    pub url: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub price: Option<i64>,
    pub mileage: Option<i64>,
    pub location: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub fingerprint: String,
    pub vehicle_age: Option<i32>,
    pub primary_image_url: Option<String>,
    pub image_count: Option<i64>,
    #[serde(default)]
    pub seller: SellerInfo,
}

impl NormalizedCandidate {
    pub fn price_per_unit_distance(&self) -> Option<f64> {
        price_per_unit_distance(self.price, self.mileage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Inactive,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(format!("unknown listing status `{other}`")),
        }
    }
}

/// Canonical persisted listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub source: String,
    pub source_local_id: String,
    pub url: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub price: Option<i64>,
    pub mileage: Option<i64>,
    pub location: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub fingerprint: String,
    pub price_per_unit_distance: Option<f64>,
    pub vehicle_age: Option<i32>,
    pub primary_image_url: Option<String>,
    pub image_count: Option<i64>,
    pub seller: SellerInfo,
    pub status: ListingStatus,
    pub times_seen: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    /// Fresh active listing observed for the first time at `now`.
    pub fn first_observation(candidate: &NormalizedCandidate, now: DateTime<Utc>) -> Self {
        Self {
            id: candidate.listing_id,
            source: candidate.source.clone(),
            source_local_id: candidate.source_local_id.clone(),
            url: candidate.url.clone(),
            title: candidate.title.clone(),
            description: candidate.description.clone(),
            year: candidate.year,
            make: candidate.make.clone(),
            model: candidate.model.clone(),
            price: candidate.price,
            mileage: candidate.mileage,
            location: candidate.location.clone(),
            attributes: candidate.attributes.clone(),
            fingerprint: candidate.fingerprint.clone(),
            price_per_unit_distance: candidate.price_per_unit_distance(),
            vehicle_age: vehicle_age(candidate.year, now),
            primary_image_url: candidate.primary_image_url.clone(),
            image_count: candidate.image_count,
            seller: candidate.seller.clone(),
            status: ListingStatus::Active,
            times_seen: 1,
            first_seen_at: now,
            last_seen_at: now,
            updated_at: now,
        }
    }

    /// Merge a re-observation into this listing. Unknown candidate fields keep the
    /// stored value. Returns the previous price when the listing takes on a
    /// different observed price.
    pub fn absorb_observation(
        &mut self,
        candidate: &NormalizedCandidate,
        now: DateTime<Utc>,
        effects: ObservationEffects,
    ) -> Option<Option<i64>> {
        let previous_price = self.price;
        let price_changed =
            effects.apply_price && candidate.price.is_some() && candidate.price != previous_price;

        self.title = candidate.title.clone();
        if candidate.url.is_some() {
            self.url = candidate.url.clone();
        }
        if candidate.description.is_some() {
            self.description = candidate.description.clone();
            self.seller = candidate.seller.clone();
        }
        if candidate.year.is_some() {
            self.year = candidate.year;
        }
        if candidate.make.is_some() {
            self.make = candidate.make.clone();
        }
        if candidate.model.is_some() {
            self.model = candidate.model.clone();
        }
        if price_changed {
            self.price = candidate.price;
        }
        if candidate.mileage.is_some() {
            self.mileage = candidate.mileage;
        }
        if candidate.location.is_some() {
            self.location = candidate.location.clone();
        }
        if candidate.primary_image_url.is_some() {
            self.primary_image_url = candidate.primary_image_url.clone();
        }
        if candidate.image_count.is_some() {
            self.image_count = candidate.image_count;
        }
        for (key, value) in &candidate.attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
        self.fingerprint = fingerprint(&self.title, self.price, self.location.as_deref());
        self.price_per_unit_distance = price_per_unit_distance(self.price, self.mileage);
        self.vehicle_age = vehicle_age(self.year, now);
        self.status = ListingStatus::Active;
        if effects.count_sighting {
            self.times_seen += 1;
        }
        // Clock skew between runs must not move last_seen_at backwards.
        self.last_seen_at = self.last_seen_at.max(now);
        self.updated_at = now;

        price_changed.then_some(previous_price)
    }
}

/// Which parts of a re-observation a listing takes on.
///
/// A listing merged from several posting keys sees one observation per key per
/// cycle; only the first counts as a sighting, and a key whose own price has not
/// moved does not overwrite the price another key reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationEffects {
    pub apply_price: bool,
    pub count_sighting: bool,
}

impl ObservationEffects {
    pub const ALL: Self = Self {
        apply_price: true,
        count_sighting: true,
    };
}

/// One point on a listing's price timeline: the price observed from `observed_at` on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub listing_id: Uuid,
    pub price: i64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(format!("unknown run outcome `{other}`")),
        }
    }
}

/// Immutable audit record of one ingestion cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub source: String,
    pub listings_found: i64,
    pub listings_rejected: i64,
    pub new_listings: i64,
    pub inactivated_listings: i64,
    pub detail_pages_fetched: i64,
    pub candidate_errors: i64,
    pub duration_ms: i64,
    pub outcome: RunOutcome,
    pub error: Option<String>,
}

/// Deterministic global id for a (source, source-local id) pair. The source is
/// length-prefixed so no two distinct pairs hash the same name.
pub fn global_listing_id(source: &str, source_local_id: &str) -> Uuid {
    Uuid::new_v5(
        &LISTING_ID_NAMESPACE,
        format!("{}:{source}{source_local_id}", source.len()).as_bytes(),
    )
}

/// Whole years since the model year, never negative.
pub fn vehicle_age(year: Option<i32>, now: DateTime<Utc>) -> Option<i32> {
    year.map(|year| now.year().saturating_sub(year).max(0))
}

pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Content-dedup fingerprint over normalized title, price and location.
pub fn fingerprint(title: &str, price: Option<i64>, location: Option<&str>) -> String {
    let price = price.map(|p| p.to_string()).unwrap_or_else(|| "0".to_string());
    let location = location.map(normalize_text).unwrap_or_default();
    let key = format!("{}|{}|{}", normalize_text(title), price, location);
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn price_per_unit_distance(price: Option<i64>, mileage: Option<i64>) -> Option<f64> {
    match (price, mileage) {
        (Some(price), Some(mileage)) if mileage > 0 => Some(price as f64 / mileage as f64),
        _ => None,
    }
}
