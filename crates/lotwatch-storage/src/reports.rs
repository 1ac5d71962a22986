//! Read-only reporting queries. None of these participate in reconciliation.

use std::collections::BTreeMap;

use lotwatch_core::ScrapeRun;
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use crate::store::{parse_uuid, scrape_run_from_row};
use crate::{ListingStore, StoreResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestValueRow {
    pub id: Uuid,
    pub title: String,
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub price: i64,
    pub mileage: i64,
    pub price_per_unit_distance: f64,
    pub location: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceDropRow {
    pub id: Uuid,
    pub title: String,
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub location: Option<String>,
    pub previous_price: i64,
    pub current_price: i64,
    pub savings: i64,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MakeModelStats {
    pub make: String,
    pub model: String,
    pub count: i64,
    pub avg_price: Option<f64>,
    pub avg_mileage: Option<f64>,
    pub avg_price_per_unit_distance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_listings: i64,
    pub active_listings: i64,
    pub inactive_listings: i64,
    pub active_by_source: BTreeMap<String, i64>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub avg_price: Option<f64>,
    pub total_runs: i64,
    pub last_run: Option<ScrapeRun>,
}

impl ListingStore {
    /// Active listings with the lowest price per unit of distance.
    pub async fn best_value(&self, limit: i64) -> StoreResult<Vec<BestValueRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, year, make, model, price, mileage, price_per_unit_distance, location, url
              FROM listings
             WHERE status = 'active'
               AND mileage > 0
               AND price IS NOT NULL
               AND price_per_unit_distance IS NOT NULL
             ORDER BY price_per_unit_distance ASC, id ASC
             LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(BestValueRow {
                    id: parse_uuid(&row.try_get::<String, _>("id")?)?,
                    title: row.try_get("title")?,
                    year: row.try_get("year")?,
                    make: row.try_get("make")?,
                    model: row.try_get("model")?,
                    price: row.try_get("price")?,
                    mileage: row.try_get("mileage")?,
                    price_per_unit_distance: row.try_get("price_per_unit_distance")?,
                    location: row.try_get("location")?,
                    url: row.try_get("url")?,
                })
            })
            .collect()
    }

    /// Active listings whose current price is below the history entry preceding the
    /// latest one, largest drop first.
    pub async fn price_drops(&self, limit: i64) -> StoreResult<Vec<PriceDropRow>> {
        let rows = sqlx::query(
            r#"
            WITH ranked AS (
                SELECT listing_id,
                       price,
                       ROW_NUMBER() OVER (
                           PARTITION BY listing_id
                           ORDER BY observed_at DESC, id DESC
                       ) AS rn
                  FROM price_history
            )
            SELECT l.id, l.title, l.year, l.make, l.model, l.location, l.url,
                   prev.price AS previous_price,
                   l.price AS current_price
              FROM listings l
              JOIN ranked prev ON prev.listing_id = l.id AND prev.rn = 2
             WHERE l.status = 'active'
               AND l.price IS NOT NULL
               AND l.price < prev.price
             ORDER BY (prev.price - l.price) DESC, l.id ASC
             LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let previous_price: i64 = row.try_get("previous_price")?;
                let current_price: i64 = row.try_get("current_price")?;
                Ok(PriceDropRow {
                    id: parse_uuid(&row.try_get::<String, _>("id")?)?,
                    title: row.try_get("title")?,
                    year: row.try_get("year")?,
                    make: row.try_get("make")?,
                    model: row.try_get("model")?,
                    location: row.try_get("location")?,
                    previous_price,
                    current_price,
                    savings: previous_price - current_price,
                    url: row.try_get("url")?,
                })
            })
            .collect()
    }

    pub async fn make_model_stats(&self, min_count: i64) -> StoreResult<Vec<MakeModelStats>> {
        let rows = sqlx::query(
            r#"
            SELECT make, model,
                   COUNT(*) AS listing_count,
                   AVG(price) AS avg_price,
                   AVG(mileage) AS avg_mileage,
                   AVG(price_per_unit_distance) AS avg_ppd
              FROM listings
             WHERE status = 'active'
               AND make IS NOT NULL
               AND model IS NOT NULL
             GROUP BY make, model
            HAVING COUNT(*) >= ?
             ORDER BY listing_count DESC, make ASC, model ASC
            "#,
        )
        .bind(min_count)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(MakeModelStats {
                    make: row.try_get("make")?,
                    model: row.try_get("model")?,
                    count: row.try_get("listing_count")?,
                    avg_price: row.try_get("avg_price")?,
                    avg_mileage: row.try_get("avg_mileage")?,
                    avg_price_per_unit_distance: row.try_get("avg_ppd")?,
                })
            })
            .collect()
    }

    pub async fn recent_runs(&self, limit: i64) -> StoreResult<Vec<ScrapeRun>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, started_at, source, listings_found, listings_rejected, new_listings,
                   inactivated_listings, detail_pages_fetched, candidate_errors, duration_ms,
                   outcome, error
              FROM scrape_runs
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(scrape_run_from_row).collect()
    }

    pub async fn stats(&self) -> StoreResult<StoreStats> {
        let counts = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0) AS active,
                   COALESCE(SUM(CASE WHEN status = 'inactive' THEN 1 ELSE 0 END), 0) AS inactive
              FROM listings
            "#,
        )
        .fetch_one(self.pool())
        .await?;

        let prices = sqlx::query(
            r#"
            SELECT MIN(price) AS min_price, MAX(price) AS max_price, AVG(price) AS avg_price
              FROM listings
             WHERE status = 'active' AND price IS NOT NULL
            "#,
        )
        .fetch_one(self.pool())
        .await?;

        let by_source = sqlx::query(
            r#"
            SELECT source, COUNT(*) AS listing_count
              FROM listings
             WHERE status = 'active'
             GROUP BY source
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        let mut active_by_source = BTreeMap::new();
        for row in by_source {
            active_by_source.insert(
                row.try_get::<String, _>("source")?,
                row.try_get::<i64, _>("listing_count")?,
            );
        }

        let total_runs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scrape_runs")
            .fetch_one(self.pool())
            .await?;
        let last_run = self.recent_runs(1).await?.into_iter().next();

        Ok(StoreStats {
            total_listings: counts.try_get("total")?,
            active_listings: counts.try_get("active")?,
            inactive_listings: counts.try_get("inactive")?,
            active_by_source,
            min_price: prices.try_get("min_price")?,
            max_price: prices.try_get("max_price")?,
            avg_price: prices.try_get("avg_price")?,
            total_runs,
            last_run,
        })
    }
}
