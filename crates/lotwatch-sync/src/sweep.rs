use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use lotwatch_storage::{ListingStore, StoreResult};
use tracing::info;
use uuid::Uuid;

/// Retires listings of one source that this cycle did not observe, once they are
/// older than the grace period.
#[derive(Debug, Clone)]
pub struct StalenessSweeper {
    store: ListingStore,
    grace: Duration,
}

impl StalenessSweeper {
    pub fn new(store: ListingStore, grace: Duration) -> Self {
        Self { store, grace }
    }

    pub async fn sweep(
        &self,
        source: &str,
        seen: &HashSet<Uuid>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        // A grace period reaching past the calendar retires nothing.
        let cutoff = now
            .checked_sub_signed(self.grace)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let inactivated = self
            .store
            .mark_stale_inactive(source, seen, cutoff, now)
            .await?;
        info!(
            source,
            seen = seen.len(),
            inactivated = inactivated.len(),
            "staleness sweep finished"
        );
        Ok(inactivated)
    }
}
