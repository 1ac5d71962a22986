use lotwatch_core::{RunOutcome, ScrapeRun};
use lotwatch_storage::{ListingStore, StoreResult};
use tracing::info;

use crate::CycleReport;

/// Label stored on a run: the source name for single-source cycles, else `all`.
pub fn run_source_label(sources: &[String]) -> String {
    match sources {
        [only] => only.clone(),
        _ => "all".to_string(),
    }
}

pub fn scrape_run_for(report: &CycleReport) -> ScrapeRun {
    let totals = &report.totals;
    ScrapeRun {
        run_id: report.run_id,
        started_at: report.started_at,
        source: run_source_label(&report.sources),
        listings_found: totals.found as i64,
        listings_rejected: totals.rejected as i64,
        new_listings: totals.new as i64,
        inactivated_listings: totals.inactivated as i64,
        detail_pages_fetched: totals.detail_pages_fetched as i64,
        candidate_errors: totals.errors as i64,
        duration_ms: report.duration_ms,
        outcome: if report.error.is_some() {
            RunOutcome::Failure
        } else {
            RunOutcome::Success
        },
        error: report.error.clone(),
    }
}

/// Appends exactly one audit row per cycle.
#[derive(Debug, Clone)]
pub struct RunRecorder {
    store: ListingStore,
}

impl RunRecorder {
    pub fn new(store: ListingStore) -> Self {
        Self { store }
    }

    pub async fn record(&self, report: &CycleReport) -> StoreResult<ScrapeRun> {
        let run = scrape_run_for(report);
        self.store.insert_scrape_run(&run).await?;
        info!(
            run_id = %run.run_id,
            source = %run.source,
            outcome = run.outcome.as_str(),
            "recorded scrape run"
        );
        Ok(run)
    }
}
