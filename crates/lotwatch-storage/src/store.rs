use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use lotwatch_core::{Listing, ListingStatus, PriceHistoryEntry, RunOutcome, ScrapeRun, SellerInfo};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::{StoreError, StoreResult};

/// Base tables. Every column outside these is added by `ADDITIVE_LISTING_COLUMNS`
/// so older databases pick them up as nullable columns.
const BASE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS listings (
        id TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        source_local_id TEXT NOT NULL,
        title TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        times_seen INTEGER NOT NULL DEFAULT 1,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS price_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        listing_id TEXT NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
        price INTEGER NOT NULL,
        observed_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scrape_runs (
        run_id TEXT PRIMARY KEY,
        started_at TEXT NOT NULL,
        source TEXT NOT NULL,
        listings_found INTEGER NOT NULL DEFAULT 0,
        listings_rejected INTEGER NOT NULL DEFAULT 0,
        new_listings INTEGER NOT NULL DEFAULT 0,
        inactivated_listings INTEGER NOT NULL DEFAULT 0,
        detail_pages_fetched INTEGER NOT NULL DEFAULT 0,
        candidate_errors INTEGER NOT NULL DEFAULT 0,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        outcome TEXT NOT NULL,
        error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS listing_keys (
        source TEXT NOT NULL,
        source_local_id TEXT NOT NULL,
        listing_id TEXT NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
        last_price INTEGER,
        PRIMARY KEY (source, source_local_id)
    )
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS scrape_runs_no_update
    BEFORE UPDATE ON scrape_runs
    BEGIN
        SELECT RAISE(ABORT, 'scrape_runs is append-only');
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS scrape_runs_no_delete
    BEFORE DELETE ON scrape_runs
    BEGIN
        SELECT RAISE(ABORT, 'scrape_runs is append-only');
    END
    "#,
];

const ADDITIVE_LISTING_COLUMNS: &[(&str, &str)] = &[
    ("url", "TEXT"),
    ("description", "TEXT"),
    ("year", "INTEGER"),
    ("make", "TEXT"),
    ("model", "TEXT"),
    ("price", "INTEGER"),
    ("mileage", "INTEGER"),
    ("location", "TEXT"),
    ("attributes_json", "TEXT"),
    ("fingerprint", "TEXT"),
    ("price_per_unit_distance", "REAL"),
    ("vehicle_age", "INTEGER"),
    ("primary_image_url", "TEXT"),
    ("image_count", "INTEGER"),
    ("vehicle_condition", "TEXT"),
    ("maintenance_history", "TEXT"),
    ("known_issues", "TEXT"),
    ("service_records", "TEXT"),
];

const INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_listings_source_key ON listings(source, source_local_id)",
    "CREATE INDEX IF NOT EXISTS idx_listings_fingerprint ON listings(fingerprint)",
    "CREATE INDEX IF NOT EXISTS idx_listings_vehicle ON listings(year, make, model)",
    "CREATE INDEX IF NOT EXISTS idx_listings_source_status ON listings(source, status)",
    "CREATE INDEX IF NOT EXISTS idx_price_history_listing ON price_history(listing_id, observed_at)",
    "CREATE INDEX IF NOT EXISTS idx_listing_keys_listing ON listing_keys(listing_id)",
];

pub(crate) const LISTING_COLUMNS: &str = "id, source, source_local_id, url, title, description, year, make, model, \
     price, mileage, location, attributes_json, fingerprint, price_per_unit_distance, vehicle_age, \
     primary_image_url, image_count, vehicle_condition, maintenance_history, known_issues, \
     service_records, status, times_seen, first_seen_at, last_seen_at, updated_at";

/// Explicit handle to the persistent listing store. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct ListingStore {
    pool: SqlitePool,
}

impl ListingStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        // One connection: all listing writes go through a single writer anyway, and
        // SQLite would otherwise surface "database is locked" under contention.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    /// Private in-memory database, kept alive for the lifetime of the handle.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("building in-memory options")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .context("opening in-memory sqlite")?;
        let store = Self { pool };
        store.migrate().await.context("migrating in-memory sqlite")?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create missing tables and indexes; add missing nullable columns. Never drops
    /// or rewrites existing data.
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in BASE_SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        let existing: HashSet<String> =
            sqlx::query_scalar::<_, String>("SELECT name FROM pragma_table_info('listings')")
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .collect();
        for (column, sql_type) in ADDITIVE_LISTING_COLUMNS {
            if !existing.contains(*column) {
                info!(column, "adding column to listings");
                sqlx::query(&format!("ALTER TABLE listings ADD COLUMN {column} {sql_type}"))
                    .execute(&self.pool)
                    .await?;
            }
        }

        for statement in INDEXES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn begin(&self) -> StoreResult<StoreTx> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn get_listing(&self, id: Uuid) -> StoreResult<Option<Listing>> {
        let row = sqlx::query(&format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    pub async fn count_listings(&self) -> StoreResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn price_history(&self, listing_id: Uuid) -> StoreResult<Vec<PriceHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT listing_id, price, observed_at
              FROM price_history
             WHERE listing_id = ?
             ORDER BY observed_at ASC, id ASC
            "#,
        )
        .bind(listing_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PriceHistoryEntry {
                    listing_id: parse_uuid(&row.try_get::<String, _>("listing_id")?)?,
                    price: row.try_get("price")?,
                    observed_at: row.try_get("observed_at")?,
                })
            })
            .collect()
    }

    /// Flip every active listing of `source` last seen before `cutoff` and absent from
    /// `seen` to inactive. `last_seen_at` is left untouched. Returns the affected ids.
    pub async fn mark_stale_inactive(
        &self,
        source: &str,
        seen: &HashSet<Uuid>,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;
        let stale: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id
              FROM listings
             WHERE source = ?
               AND status = 'active'
               AND last_seen_at < ?
             ORDER BY id
            "#,
        )
        .bind(source)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut inactivated = Vec::new();
        for raw_id in stale {
            let id = parse_uuid(&raw_id)?;
            if seen.contains(&id) {
                continue;
            }
            sqlx::query(
                "UPDATE listings SET status = 'inactive', updated_at = ? WHERE id = ? AND status = 'active'",
            )
            .bind(now)
            .bind(&raw_id)
            .execute(&mut *tx)
            .await?;
            inactivated.push(id);
        }
        tx.commit().await?;
        Ok(inactivated)
    }

    pub async fn insert_scrape_run(&self, run: &ScrapeRun) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scrape_runs (
                run_id, started_at, source, listings_found, listings_rejected, new_listings,
                inactivated_listings, detail_pages_fetched, candidate_errors, duration_ms,
                outcome, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.started_at)
        .bind(&run.source)
        .bind(run.listings_found)
        .bind(run.listings_rejected)
        .bind(run.new_listings)
        .bind(run.inactivated_listings)
        .bind(run.detail_pages_fetched)
        .bind(run.candidate_errors)
        .bind(run.duration_ms)
        .bind(run.outcome.as_str())
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// One logical write unit: resolve + apply for a single candidate.
/// Dropping without `commit` rolls back.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    /// Listing a posting key belongs to: a key merged into another source's listing
    /// first, then the listing that key created.
    pub async fn find_by_key(
        &mut self,
        source: &str,
        source_local_id: &str,
    ) -> StoreResult<Option<Listing>> {
        let merged = sqlx::query(&format!(
            r#"
            SELECT {LISTING_COLUMNS}
              FROM listings
             WHERE id = (SELECT listing_id FROM listing_keys WHERE source = ? AND source_local_id = ?)
            "#
        ))
        .bind(source)
        .bind(source_local_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        if let Some(row) = merged {
            return listing_from_row(&row).map(Some);
        }

        let row = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE source = ? AND source_local_id = ?"
        ))
        .bind(source)
        .bind(source_local_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    /// Last price this posting key reported. `None` when the key has never been
    /// bound; `Some(None)` when it was bound without a price.
    pub async fn key_last_price(
        &mut self,
        source: &str,
        source_local_id: &str,
    ) -> StoreResult<Option<Option<i64>>> {
        Ok(sqlx::query_scalar::<_, Option<i64>>(
            "SELECT last_price FROM listing_keys WHERE source = ? AND source_local_id = ?",
        )
        .bind(source)
        .bind(source_local_id)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    /// Point a posting key at a listing. An unknown price keeps the last known one.
    pub async fn bind_key(
        &mut self,
        source: &str,
        source_local_id: &str,
        listing_id: Uuid,
        price: Option<i64>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO listing_keys (source, source_local_id, listing_id, last_price)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (source, source_local_id) DO UPDATE
               SET listing_id = excluded.listing_id,
                   last_price = COALESCE(excluded.last_price, listing_keys.last_price)
            "#,
        )
        .bind(source)
        .bind(source_local_id)
        .bind(listing_id.to_string())
        .bind(price)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Most recently seen listing with this fingerprint posted on another source.
    pub async fn find_id_by_fingerprint(
        &mut self,
        fingerprint: &str,
        other_than_source: &str,
    ) -> StoreResult<Option<Uuid>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id
              FROM listings
             WHERE fingerprint = ?
               AND source <> ?
             ORDER BY last_seen_at DESC, id ASC
             LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .bind(other_than_source)
        .fetch_optional(&mut *self.tx)
        .await?;
        id.as_deref().map(parse_uuid).transpose()
    }

    /// Priced listings of the same vehicle seen at or after `seen_since`, most recent first.
    pub async fn vehicle_matches_since(
        &mut self,
        year: i32,
        make: &str,
        model: &str,
        seen_since: DateTime<Utc>,
    ) -> StoreResult<Vec<(Uuid, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, price
              FROM listings
             WHERE year = ?
               AND make = ?
               AND model = ?
               AND price IS NOT NULL
               AND last_seen_at >= ?
             ORDER BY last_seen_at DESC, id ASC
            "#,
        )
        .bind(year)
        .bind(make)
        .bind(model)
        .bind(seen_since)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|row| {
                Ok((
                    parse_uuid(&row.try_get::<String, _>("id")?)?,
                    row.try_get::<i64, _>("price")?,
                ))
            })
            .collect()
    }

    pub async fn load(&mut self, id: Uuid) -> StoreResult<Option<Listing>> {
        let row = sqlx::query(&format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    pub async fn insert_listing(&mut self, listing: &Listing) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO listings (
                id, source, source_local_id, url, title, description, year, make, model,
                price, mileage, location, attributes_json, fingerprint, price_per_unit_distance,
                vehicle_age, primary_image_url, image_count, vehicle_condition,
                maintenance_history, known_issues, service_records,
                status, times_seen, first_seen_at, last_seen_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(listing.id.to_string())
        .bind(&listing.source)
        .bind(&listing.source_local_id)
        .bind(&listing.url)
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.year)
        .bind(&listing.make)
        .bind(&listing.model)
        .bind(listing.price)
        .bind(listing.mileage)
        .bind(&listing.location)
        .bind(attributes_to_json(&listing.attributes)?)
        .bind(&listing.fingerprint)
        .bind(listing.price_per_unit_distance)
        .bind(listing.vehicle_age)
        .bind(&listing.primary_image_url)
        .bind(listing.image_count)
        .bind(&listing.seller.condition)
        .bind(terms_to_json(&listing.seller.maintenance)?)
        .bind(terms_to_json(&listing.seller.issues)?)
        .bind(terms_to_json(&listing.seller.service_records)?)
        .bind(listing.status.as_str())
        .bind(listing.times_seen)
        .bind(listing.first_seen_at)
        .bind(listing.last_seen_at)
        .bind(listing.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Persist the mutable state of an already-stored listing.
    pub async fn update_listing(&mut self, listing: &Listing) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET url = ?,
                   title = ?,
                   description = ?,
                   year = ?,
                   make = ?,
                   model = ?,
                   price = ?,
                   mileage = ?,
                   location = ?,
                   attributes_json = ?,
                   fingerprint = ?,
                   price_per_unit_distance = ?,
                   vehicle_age = ?,
                   primary_image_url = ?,
                   image_count = ?,
                   vehicle_condition = ?,
                   maintenance_history = ?,
                   known_issues = ?,
                   service_records = ?,
                   status = ?,
                   times_seen = ?,
                   last_seen_at = ?,
                   updated_at = ?
             WHERE id = ?
            "#,
        )
        .bind(&listing.url)
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.year)
        .bind(&listing.make)
        .bind(&listing.model)
        .bind(listing.price)
        .bind(listing.mileage)
        .bind(&listing.location)
        .bind(attributes_to_json(&listing.attributes)?)
        .bind(&listing.fingerprint)
        .bind(listing.price_per_unit_distance)
        .bind(listing.vehicle_age)
        .bind(&listing.primary_image_url)
        .bind(listing.image_count)
        .bind(&listing.seller.condition)
        .bind(terms_to_json(&listing.seller.maintenance)?)
        .bind(terms_to_json(&listing.seller.issues)?)
        .bind(terms_to_json(&listing.seller.service_records)?)
        .bind(listing.status.as_str())
        .bind(listing.times_seen)
        .bind(listing.last_seen_at)
        .bind(listing.updated_at)
        .bind(listing.id.to_string())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!(
                "listing {} vanished during update",
                listing.id
            )));
        }
        Ok(())
    }

    pub async fn latest_price_observation(
        &mut self,
        listing_id: Uuid,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(sqlx::query_scalar(
            "SELECT MAX(observed_at) FROM price_history WHERE listing_id = ?",
        )
        .bind(listing_id.to_string())
        .fetch_one(&mut *self.tx)
        .await?)
    }

    pub async fn append_price_history(&mut self, entry: &PriceHistoryEntry) -> StoreResult<()> {
        sqlx::query("INSERT INTO price_history (listing_id, price, observed_at) VALUES (?, ?, ?)")
            .bind(entry.listing_id.to_string())
            .bind(entry.price)
            .bind(entry.observed_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

pub(crate) fn parse_uuid(raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("bad id `{raw}`: {e}")))
}

fn attributes_to_json(attributes: &BTreeMap<String, String>) -> StoreResult<Option<String>> {
    if attributes.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(attributes)
        .map(Some)
        .map_err(|e| StoreError::Corrupt(format!("serializing attributes: {e}")))
}

fn terms_to_json(terms: &[String]) -> StoreResult<Option<String>> {
    if terms.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(terms)
        .map(Some)
        .map_err(|e| StoreError::Corrupt(format!("serializing seller terms: {e}")))
}

fn terms_from_row(row: &SqliteRow, column: &str, id: &str) -> StoreResult<Vec<String>> {
    match row.try_get::<Option<String>, _>(column)? {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| StoreError::Corrupt(format!("{column} of {id}: {e}"))),
        None => Ok(Vec::new()),
    }
}

pub(crate) fn listing_from_row(row: &SqliteRow) -> StoreResult<Listing> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let attributes = match row.try_get::<Option<String>, _>("attributes_json")? {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| StoreError::Corrupt(format!("attributes of {id}: {e}")))?,
        None => BTreeMap::new(),
    };
    let seller = SellerInfo {
        condition: row.try_get("vehicle_condition")?,
        maintenance: terms_from_row(row, "maintenance_history", &id)?,
        issues: terms_from_row(row, "known_issues", &id)?,
        service_records: terms_from_row(row, "service_records", &id)?,
    };

    Ok(Listing {
        id: parse_uuid(&id)?,
        source: row.try_get("source")?,
        source_local_id: row.try_get("source_local_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        year: row.try_get("year")?,
        make: row.try_get("make")?,
        model: row.try_get("model")?,
        price: row.try_get("price")?,
        mileage: row.try_get("mileage")?,
        location: row.try_get("location")?,
        attributes,
        fingerprint: row
            .try_get::<Option<String>, _>("fingerprint")?
            .unwrap_or_default(),
        price_per_unit_distance: row.try_get("price_per_unit_distance")?,
        vehicle_age: row.try_get("vehicle_age")?,
        primary_image_url: row.try_get("primary_image_url")?,
        image_count: row.try_get("image_count")?,
        seller,
        status: ListingStatus::from_str(&status).map_err(StoreError::Corrupt)?,
        times_seen: row.try_get("times_seen")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn scrape_run_from_row(row: &SqliteRow) -> StoreResult<ScrapeRun> {
    let outcome: String = row.try_get("outcome")?;
    Ok(ScrapeRun {
        run_id: parse_uuid(&row.try_get::<String, _>("run_id")?)?,
        started_at: row.try_get("started_at")?,
        source: row.try_get("source")?,
        listings_found: row.try_get("listings_found")?,
        listings_rejected: row.try_get("listings_rejected")?,
        new_listings: row.try_get("new_listings")?,
        inactivated_listings: row.try_get("inactivated_listings")?,
        detail_pages_fetched: row.try_get("detail_pages_fetched")?,
        candidate_errors: row.try_get("candidate_errors")?,
        duration_ms: row.try_get("duration_ms")?,
        outcome: RunOutcome::from_str(&outcome).map_err(StoreError::Corrupt)?,
        error: row.try_get("error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use lotwatch_core::{fingerprint, global_listing_id, NormalizedCandidate};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, hour, 0, 0).single().unwrap()
    }

    fn listing(source: &str, local_id: &str, price: i64, seen: DateTime<Utc>) -> Listing {
        let title = format!("2018 Ford F-150 #{local_id}");
        let candidate = NormalizedCandidate {
            listing_id: global_listing_id(source, local_id),
            source: source.into(),
            source_local_id: local_id.into(),
            url: None,
            title: title.clone(),
            description: None,
            year: Some(2018),
            make: Some("Ford".into()),
            model: Some("F-150".into()),
            price: Some(price),
            mileage: Some(120_000),
            location: None,
            attributes: BTreeMap::from([("drive".to_string(), "4wd".to_string())]),
            fingerprint: fingerprint(&title, Some(price), None),
            vehicle_age: Some(8),
            primary_image_url: Some(format!("https://img.example.test/{local_id}/1.jpg")),
            image_count: Some(3),
            seller: SellerInfo {
                condition: Some("good".into()),
                maintenance: vec!["new tires".into()],
                issues: Vec::new(),
                service_records: vec!["clean title".into()],
            },
        };
        Listing::first_observation(&candidate, seen)
    }

    async fn insert(store: &ListingStore, listing: &Listing) {
        let mut tx = store.begin().await.unwrap();
        tx.insert_listing(listing).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = ListingStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
        assert_eq!(store.count_listings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn migrate_adds_columns_to_legacy_table_without_losing_rows() {
        let store = ListingStore::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE listings (id TEXT PRIMARY KEY, source TEXT NOT NULL, source_local_id TEXT NOT NULL, \
             title TEXT NOT NULL, status TEXT NOT NULL DEFAULT 'active', times_seen INTEGER NOT NULL DEFAULT 1, \
             first_seen_at TEXT NOT NULL, last_seen_at TEXT NOT NULL, updated_at TEXT NOT NULL)",
        )
        .execute(store.pool())
        .await
        .unwrap();
        let id = global_listing_id("classifieds", "1");
        sqlx::query(
            "INSERT INTO listings (id, source, source_local_id, title, first_seen_at, last_seen_at, updated_at) \
             VALUES (?, 'classifieds', '1', 'old row', ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(at(1))
        .bind(at(1))
        .bind(at(1))
        .execute(store.pool())
        .await
        .unwrap();

        store.migrate().await.unwrap();

        let row = store.get_listing(id).await.unwrap().unwrap();
        assert_eq!(row.title, "old row");
        assert_eq!(row.price, None);
        assert!(row.attributes.is_empty());
        assert_eq!(row.status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn listing_round_trips_through_the_store() {
        let store = ListingStore::in_memory().await.unwrap();
        let original = listing("classifieds", "42", 21_000, at(3));
        insert(&store, &original).await;

        let loaded = store.get_listing(original.id).await.unwrap().unwrap();
        assert_eq!(loaded, original);

        let mut tx = store.begin().await.unwrap();
        let by_key = tx.find_by_key("classifieds", "42").await.unwrap().unwrap();
        assert_eq!(by_key.id, original.id);
        assert!(tx.find_by_key("marketplace", "42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_persists_filled_in_vehicle_fields() {
        let store = ListingStore::in_memory().await.unwrap();
        let mut original = listing("classifieds", "43", 21_000, at(3));
        original.year = None;
        original.model = None;
        insert(&store, &original).await;

        let mut filled = original.clone();
        filled.year = Some(2018);
        filled.make = Some("Ford".into());
        filled.model = Some("F-150".into());
        let mut tx = store.begin().await.unwrap();
        tx.update_listing(&filled).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = store.get_listing(original.id).await.unwrap().unwrap();
        assert_eq!(loaded.year, Some(2018));
        assert_eq!(loaded.model.as_deref(), Some("F-150"));
        assert_eq!(loaded, filled);
    }

    #[tokio::test]
    async fn bound_keys_resolve_to_the_merged_listing() {
        let store = ListingStore::in_memory().await.unwrap();
        let original = listing("classifieds", "44", 21_000, at(3));
        insert(&store, &original).await;

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.key_last_price("marketplace", "9").await.unwrap(), None);
        tx.bind_key("marketplace", "9", original.id, Some(20_500))
            .await
            .unwrap();
        assert_eq!(
            tx.find_by_key("marketplace", "9").await.unwrap().map(|l| l.id),
            Some(original.id)
        );
        // An unpriced sighting keeps the key's last known price.
        tx.bind_key("marketplace", "9", original.id, None).await.unwrap();
        assert_eq!(
            tx.key_last_price("marketplace", "9").await.unwrap(),
            Some(Some(20_500))
        );
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_composite_key_is_a_conflict() {
        let store = ListingStore::in_memory().await.unwrap();
        let first = listing("classifieds", "9", 21_000, at(3));
        insert(&store, &first).await;

        let mut clash = first.clone();
        clash.id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_listing(&clash).await.unwrap_err();
        assert!(err.is_conflict(), "{err:?}");
    }

    #[tokio::test]
    async fn fingerprint_lookup_skips_same_source() {
        let store = ListingStore::in_memory().await.unwrap();
        let existing = listing("classifieds", "5", 19_500, at(2));
        insert(&store, &existing).await;

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.find_id_by_fingerprint(&existing.fingerprint, "marketplace")
                .await
                .unwrap(),
            Some(existing.id)
        );
        assert_eq!(
            tx.find_id_by_fingerprint(&existing.fingerprint, "classifieds")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn vehicle_matches_respect_recency() {
        let store = ListingStore::in_memory().await.unwrap();
        insert(&store, &listing("classifieds", "old", 20_000, at(0))).await;
        let fresh = listing("classifieds", "fresh", 20_500, at(10));
        insert(&store, &fresh).await;

        let mut tx = store.begin().await.unwrap();
        let matches = tx
            .vehicle_matches_since(2018, "Ford", "F-150", at(5))
            .await
            .unwrap();
        assert_eq!(matches, vec![(fresh.id, 20_500)]);
    }

    #[tokio::test]
    async fn stale_sweep_skips_seen_and_recent_listings() {
        let store = ListingStore::in_memory().await.unwrap();
        let now = at(20);
        let stale = listing("classifieds", "stale", 20_000, now - ChronoDuration::hours(25));
        let stale_but_seen = listing("classifieds", "seen", 20_000, now - ChronoDuration::hours(30));
        let recent = listing("classifieds", "recent", 20_000, now - ChronoDuration::hours(23));
        let other_source = listing("marketplace", "other", 20_000, now - ChronoDuration::hours(48));
        for l in [&stale, &stale_but_seen, &recent, &other_source] {
            insert(&store, l).await;
        }

        let seen = HashSet::from([stale_but_seen.id]);
        let cutoff = now - ChronoDuration::hours(24);
        let inactivated = store
            .mark_stale_inactive("classifieds", &seen, cutoff, now)
            .await
            .unwrap();
        assert_eq!(inactivated, vec![stale.id]);

        let row = store.get_listing(stale.id).await.unwrap().unwrap();
        assert_eq!(row.status, ListingStatus::Inactive);
        assert_eq!(row.last_seen_at, stale.last_seen_at);
        assert_eq!(row.updated_at, now);
        for untouched in [&stale_but_seen, &recent, &other_source] {
            let row = store.get_listing(untouched.id).await.unwrap().unwrap();
            assert_eq!(row.status, ListingStatus::Active);
        }
    }

    #[tokio::test]
    async fn scrape_runs_are_append_only() {
        let store = ListingStore::in_memory().await.unwrap();
        let run = ScrapeRun {
            run_id: Uuid::new_v4(),
            started_at: at(6),
            source: "all".into(),
            listings_found: 3,
            listings_rejected: 1,
            new_listings: 2,
            inactivated_listings: 0,
            detail_pages_fetched: 3,
            candidate_errors: 0,
            duration_ms: 1200,
            outcome: RunOutcome::Success,
            error: None,
        };
        store.insert_scrape_run(&run).await.unwrap();

        let update = sqlx::query("UPDATE scrape_runs SET new_listings = 99")
            .execute(store.pool())
            .await;
        assert!(update.is_err());
        let delete = sqlx::query("DELETE FROM scrape_runs").execute(store.pool()).await;
        assert!(delete.is_err());

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs, vec![run]);
    }

    #[tokio::test]
    async fn file_backed_store_persists_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("lotwatch.db").display());
        let original = listing("classifieds", "77", 18_000, at(4));
        {
            let store = ListingStore::connect(&url).await.unwrap();
            store.migrate().await.unwrap();
            insert(&store, &original).await;
            store.close().await;
        }
        let reopened = ListingStore::connect(&url).await.unwrap();
        reopened.migrate().await.unwrap();
        assert_eq!(reopened.count_listings().await.unwrap(), 1);
    }
}
