//! Tiered identity resolution: exact key, then fingerprint, then fuzzy vehicle match.

use chrono::{DateTime, Duration, Utc};
use lotwatch_core::{Listing, NormalizedCandidate};
use lotwatch_storage::{StoreError, StoreResult, StoreTx};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    ExactKey,
    Fingerprint,
    Fuzzy,
}

impl MatchTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactKey => "exact_key",
            Self::Fingerprint => "fingerprint",
            Self::Fuzzy => "fuzzy",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Existing { listing: Listing, tier: MatchTier },
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Symmetric fuzzy price band in basis points of the existing price (500 = 5%).
    pub price_tolerance_bps: i64,
    /// Fuzzy matches must have been seen at or after `now - recency_window`.
    pub recency_window: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            price_tolerance_bps: 500,
            recency_window: Duration::hours(24),
        }
    }
}

/// `|candidate - existing| <= existing * bps / 10000`, in exact integer arithmetic.
pub fn within_price_band(candidate: i64, existing: i64, bps: i64) -> bool {
    let diff = (i128::from(candidate) - i128::from(existing)).abs();
    diff * 10_000 <= i128::from(existing) * i128::from(bps)
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityResolver {
    config: ResolverConfig,
}

impl IdentityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// First tier that hits wins. Reads go through `tx` so the caller's write sees
    /// exactly the state the decision was made on.
    pub async fn resolve(
        &self,
        tx: &mut StoreTx,
        candidate: &NormalizedCandidate,
        now: DateTime<Utc>,
    ) -> StoreResult<Resolution> {
        if let Some(listing) = tx
            .find_by_key(&candidate.source, &candidate.source_local_id)
            .await?
        {
            return Ok(self.hit(listing, MatchTier::ExactKey));
        }

        if let Some(id) = tx
            .find_id_by_fingerprint(&candidate.fingerprint, &candidate.source)
            .await?
        {
            let listing = tx.load(id).await?.ok_or_else(|| {
                StoreError::Corrupt(format!("fingerprint match {id} disappeared mid-transaction"))
            })?;
            return Ok(self.hit(listing, MatchTier::Fingerprint));
        }

        let (Some(year), Some(make), Some(model), Some(price)) = (
            candidate.year,
            candidate.make.as_deref(),
            candidate.model.as_deref(),
            candidate.price,
        ) else {
            return Ok(Resolution::New);
        };

        let since = now
            .checked_sub_signed(self.config.recency_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let matches = tx.vehicle_matches_since(year, make, model, since).await?;
        let Some((id, _)) = matches.into_iter().find(|(_, existing)| {
            within_price_band(price, *existing, self.config.price_tolerance_bps)
        }) else {
            return Ok(Resolution::New);
        };
        let listing = tx.load(id).await?.ok_or_else(|| {
            StoreError::Corrupt(format!("fuzzy match {id} disappeared mid-transaction"))
        })?;
        Ok(self.hit(listing, MatchTier::Fuzzy))
    }

    fn hit(&self, listing: Listing, tier: MatchTier) -> Resolution {
        debug!(listing_id = %listing.id, tier = tier.as_str(), "resolved candidate");
        Resolution::Existing { listing, tier }
    }
}
