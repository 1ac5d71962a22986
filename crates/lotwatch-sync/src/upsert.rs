use std::collections::HashSet;

use chrono::{DateTime, Utc};
use lotwatch_core::{Listing, NormalizedCandidate, ObservationEffects, PriceHistoryEntry};
use lotwatch_storage::{ListingStore, StoreError, StoreResult, StoreTx};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::identity::{IdentityResolver, MatchTier, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub listing_id: Uuid,
    pub created: bool,
    pub price_changed: bool,
    pub tier: Option<MatchTier>,
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("write conflict persisted after retry: {0}")]
    Conflict(#[source] StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolve + apply for one candidate inside one store transaction.
#[derive(Debug, Clone)]
pub struct UpsertEngine {
    store: ListingStore,
    resolver: IdentityResolver,
}

impl UpsertEngine {
    pub fn new(store: ListingStore, resolver: IdentityResolver) -> Self {
        Self { store, resolver }
    }

    /// A write conflict is retried once with a fresh resolve.
    pub async fn upsert(
        &self,
        candidate: &NormalizedCandidate,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, UpsertError> {
        self.upsert_sighting(candidate, now, &mut HashSet::new()).await
    }

    /// Like [`upsert`](Self::upsert), within a cycle. `sighted` holds the existing
    /// listings already counted this cycle; a second key resolving to one of them
    /// does not bump `times_seen` again.
    pub async fn upsert_sighting(
        &self,
        candidate: &NormalizedCandidate,
        now: DateTime<Utc>,
        sighted: &mut HashSet<Uuid>,
    ) -> Result<UpsertOutcome, UpsertError> {
        let outcome = self.upsert_with_retry(candidate, now, sighted).await?;
        if !outcome.created {
            sighted.insert(outcome.listing_id);
        }
        Ok(outcome)
    }

    async fn upsert_with_retry(
        &self,
        candidate: &NormalizedCandidate,
        now: DateTime<Utc>,
        sighted: &HashSet<Uuid>,
    ) -> Result<UpsertOutcome, UpsertError> {
        match self.try_upsert(candidate, now, sighted).await {
            Err(err) if err.is_conflict() => {
                warn!(
                    source = %candidate.source,
                    source_local_id = %candidate.source_local_id,
                    error = %err,
                    "write conflict; retrying with a fresh resolve"
                );
                match self.try_upsert(candidate, now, sighted).await {
                    Err(err) if err.is_conflict() => Err(UpsertError::Conflict(err)),
                    other => Ok(other?),
                }
            }
            other => Ok(other?),
        }
    }

    async fn try_upsert(
        &self,
        candidate: &NormalizedCandidate,
        now: DateTime<Utc>,
        sighted: &HashSet<Uuid>,
    ) -> StoreResult<UpsertOutcome> {
        let mut tx = self.store.begin().await?;
        let outcome = match self.resolver.resolve(&mut tx, candidate, now).await? {
            Resolution::New => {
                let listing = Listing::first_observation(candidate, now);
                tx.insert_listing(&listing).await?;
                tx.bind_key(&listing.source, &listing.source_local_id, listing.id, listing.price)
                    .await?;
                if let Some(price) = listing.price {
                    record_price(&mut tx, listing.id, price, now).await?;
                }
                info!(
                    listing_id = %listing.id,
                    source = %listing.source,
                    title = %listing.title,
                    price = ?listing.price,
                    "new listing"
                );
                UpsertOutcome {
                    listing_id: listing.id,
                    created: true,
                    price_changed: false,
                    tier: None,
                }
            }
            Resolution::Existing { mut listing, tier } => {
                // A key repeating its own last price leaves the listing's price alone,
                // so two keys quoting different prices do not flip it every cycle.
                let key_price = tx
                    .key_last_price(&candidate.source, &candidate.source_local_id)
                    .await?;
                let effects = ObservationEffects {
                    apply_price: !matches!(key_price, Some(Some(last)) if candidate.price == Some(last)),
                    count_sighting: !sighted.contains(&listing.id),
                };
                let previous_price = listing.absorb_observation(candidate, now, effects);
                tx.update_listing(&listing).await?;
                tx.bind_key(
                    &candidate.source,
                    &candidate.source_local_id,
                    listing.id,
                    candidate.price,
                )
                .await?;
                if let (Some(previous), Some(price)) = (previous_price, listing.price) {
                    record_price(&mut tx, listing.id, price, now).await?;
                    info!(
                        listing_id = %listing.id,
                        tier = tier.as_str(),
                        previous = ?previous,
                        price,
                        "price changed"
                    );
                }
                UpsertOutcome {
                    listing_id: listing.id,
                    created: false,
                    price_changed: previous_price.is_some(),
                    tier: Some(tier),
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }
}

/// Entries for a listing never go backwards in time, even if the clock did.
async fn record_price(
    tx: &mut StoreTx,
    listing_id: Uuid,
    price: i64,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let observed_at = match tx.latest_price_observation(listing_id).await? {
        Some(latest) => latest.max(now),
        None => now,
    };
    tx.append_price_history(&PriceHistoryEntry {
        listing_id,
        price,
        observed_at,
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone};
    use lotwatch_core::{fingerprint, global_listing_id, ListingStatus};

    use super::*;
    use crate::identity::ResolverConfig;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 3, 8, 0, 0).single().unwrap()
    }

    fn candidate(price: Option<i64>) -> NormalizedCandidate {
        NormalizedCandidate {
            listing_id: global_listing_id("classifieds", "501"),
            source: "classifieds".into(),
            source_local_id: "501".into(),
            url: Some("https://example.test/501.html".into()),
            title: "2017 GMC Sierra 1500 SLE".into(),
            description: None,
            year: Some(2017),
            make: Some("GMC".into()),
            model: Some("Sierra".into()),
            price,
            mileage: Some(101_000),
            location: Some("Fenton".into()),
            attributes: BTreeMap::new(),
            fingerprint: fingerprint("2017 GMC Sierra 1500 SLE", price, Some("Fenton")),
            ..Default::default()
        }
    }

    fn repost(source: &str, local_id: &str, title: &str, price: i64) -> NormalizedCandidate {
        NormalizedCandidate {
            listing_id: global_listing_id(source, local_id),
            source: source.into(),
            source_local_id: local_id.into(),
            title: title.into(),
            year: Some(2020),
            make: Some("Ford".into()),
            model: Some("F-150".into()),
            price: Some(price),
            fingerprint: fingerprint(title, Some(price), None),
            ..Default::default()
        }
    }

    async fn engine() -> (ListingStore, UpsertEngine) {
        let store = ListingStore::in_memory().await.unwrap();
        let engine = UpsertEngine::new(store.clone(), IdentityResolver::new(ResolverConfig::default()));
        (store, engine)
    }

    #[tokio::test]
    async fn insert_seeds_price_history() {
        let (store, engine) = engine().await;
        let outcome = engine.upsert(&candidate(Some(17_500)), t0()).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.tier, None);

        let listing = store.get_listing(outcome.listing_id).await.unwrap().unwrap();
        assert_eq!(listing.times_seen, 1);
        assert_eq!(listing.first_seen_at, listing.last_seen_at);
        assert_eq!(listing.status, ListingStatus::Active);
        assert!((listing.price_per_unit_distance.unwrap() - 17_500.0 / 101_000.0).abs() < 1e-12);

        let history = store.price_history(outcome.listing_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].price, 17_500);
        assert_eq!(history[0].observed_at, t0());
    }

    #[tokio::test]
    async fn unpriced_insert_has_no_history() {
        let (store, engine) = engine().await;
        let outcome = engine.upsert(&candidate(None), t0()).await.unwrap();
        assert!(store.price_history(outcome.listing_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_appends_only_on_price_change() {
        let (store, engine) = engine().await;
        let id = engine.upsert(&candidate(Some(17_500)), t0()).await.unwrap().listing_id;

        let same = engine
            .upsert(&candidate(Some(17_500)), t0() + Duration::hours(1))
            .await
            .unwrap();
        assert!(!same.price_changed);
        assert_eq!(same.tier, Some(MatchTier::ExactKey));

        let unknown = engine
            .upsert(&candidate(None), t0() + Duration::hours(2))
            .await
            .unwrap();
        assert!(!unknown.price_changed);

        let dropped = engine
            .upsert(&candidate(Some(16_900)), t0() + Duration::hours(3))
            .await
            .unwrap();
        assert!(dropped.price_changed);

        let history = store.price_history(id).await.unwrap();
        let prices: Vec<_> = history.iter().map(|h| h.price).collect();
        assert_eq!(prices, vec![17_500, 16_900]);
        assert_eq!(history[1].observed_at, t0() + Duration::hours(3));

        let listing = store.get_listing(id).await.unwrap().unwrap();
        assert_eq!(listing.times_seen, 4);
        assert_eq!(listing.price, Some(16_900));
    }

    #[tokio::test]
    async fn history_timestamps_never_regress_under_clock_skew() {
        let (store, engine) = engine().await;
        let id = engine.upsert(&candidate(Some(17_500)), t0()).await.unwrap().listing_id;
        engine
            .upsert(&candidate(Some(16_000)), t0() - Duration::hours(5))
            .await
            .unwrap();

        let history = store.price_history(id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].observed_at <= history[1].observed_at);
        let listing = store.get_listing(id).await.unwrap().unwrap();
        assert!(listing.first_seen_at <= listing.last_seen_at);
        assert_eq!(listing.last_seen_at, t0());
    }

    #[tokio::test]
    async fn reobservation_reactivates_inactive_listing() {
        let (store, engine) = engine().await;
        let id = engine.upsert(&candidate(Some(17_500)), t0()).await.unwrap().listing_id;
        let later = t0() + Duration::days(3);
        store
            .mark_stale_inactive("classifieds", &Default::default(), later, later)
            .await
            .unwrap();
        assert_eq!(
            store.get_listing(id).await.unwrap().unwrap().status,
            ListingStatus::Inactive
        );

        engine.upsert(&candidate(Some(17_500)), later).await.unwrap();
        let listing = store.get_listing(id).await.unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Active);
        assert_eq!(listing.last_seen_at, later);
    }

    #[tokio::test]
    async fn merged_keys_do_not_flip_price_on_repeat_cycles() {
        let (store, engine) = engine().await;
        let first = repost("classifieds", "1", "2020 Ford F-150", 25_000);
        let second = repost("marketplace", "99", "2020 Ford F-150 Lariat", 24_500);

        let mut id = None;
        for cycle in 0..3 {
            let now = t0() + Duration::hours(cycle);
            let mut sighted = HashSet::new();
            let a = engine.upsert_sighting(&first, now, &mut sighted).await.unwrap();
            let b = engine.upsert_sighting(&second, now, &mut sighted).await.unwrap();
            assert_eq!(a.listing_id, b.listing_id);
            if cycle == 0 {
                assert_eq!(b.tier, Some(MatchTier::Fuzzy));
            } else {
                assert_eq!(b.tier, Some(MatchTier::ExactKey));
                assert!(!a.price_changed && !b.price_changed, "cycle {cycle}");
            }
            id = Some(a.listing_id);
        }

        let id = id.unwrap();
        assert_eq!(store.count_listings().await.unwrap(), 1);
        let prices: Vec<_> = store
            .price_history(id)
            .await
            .unwrap()
            .iter()
            .map(|h| h.price)
            .collect();
        assert_eq!(prices, vec![25_000, 24_500]);
        let listing = store.get_listing(id).await.unwrap().unwrap();
        assert_eq!(listing.price, Some(24_500));
        // Created plus one merge in the first cycle, then one sighting per cycle.
        assert_eq!(listing.times_seen, 4);
    }

    #[tokio::test]
    async fn merged_key_price_change_is_still_recorded() {
        let (store, engine) = engine().await;
        let first = repost("classifieds", "1", "2020 Ford F-150", 25_000);
        let second = repost("marketplace", "99", "2020 Ford F-150 Lariat", 24_500);
        let id = engine.upsert(&first, t0()).await.unwrap().listing_id;
        engine.upsert(&second, t0()).await.unwrap();

        let dropped = repost("marketplace", "99", "2020 Ford F-150 Lariat", 23_900);
        let outcome = engine
            .upsert(&dropped, t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(outcome.listing_id, id);
        assert!(outcome.price_changed);
        assert_eq!(store.price_history(id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn persistent_conflict_surfaces_after_one_retry() {
        let (store, engine) = engine().await;
        // A foreign row already owns the id this candidate would be inserted under,
        // so every attempt hits the primary key.
        let mut squatter = Listing::first_observation(&candidate(Some(17_500)), t0());
        squatter.source = "legacy".into();
        squatter.source_local_id = "x-1".into();
        squatter.title = "1999 Something Else".into();
        squatter.fingerprint = fingerprint("1999 Something Else", Some(1), None);
        squatter.year = None;
        let mut tx = store.begin().await.unwrap();
        tx.insert_listing(&squatter).await.unwrap();
        tx.commit().await.unwrap();

        let err = engine
            .upsert(&candidate(Some(17_500)), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, UpsertError::Conflict(_)), "{err:?}");
        assert_eq!(store.count_listings().await.unwrap(), 1);
        assert!(store.price_history(squatter.id).await.unwrap().is_empty());
    }
}
