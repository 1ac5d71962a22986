//! One reconciliation cycle: concurrent source collection feeding a single writer
//! that resolves, upserts, sweeps and finally records the run.

mod identity;
mod normalize;
mod record;
mod seller;
mod sweep;
mod upsert;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use lotwatch_adapters::{adapter_for_source, AdapterContext, SourceAdapter, SourceConfig};
use lotwatch_core::NormalizedCandidate;
use lotwatch_storage::{HttpClientConfig, HttpFetcher, ListingStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use identity::{within_price_band, IdentityResolver, MatchTier, Resolution, ResolverConfig};
pub use normalize::{
    extract_year, mileage_mention, parse_mileage, parse_price, ExclusionsFile, MakeEntry,
    Normalizer, NormalizerConfig, Rejection, VocabularyFile,
};
pub use record::{run_source_label, scrape_run_for, RunRecorder};
pub use seller::{ConditionGrade, SellerTerms};
pub use sweep::StalenessSweeper;
pub use upsert::{UpsertEngine, UpsertError, UpsertOutcome};

pub const CRATE_NAME: &str = "lotwatch-sync";

/// Bounded so producers back off while the writer is busy with the store.
const WRITER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Identity and staleness tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub price_tolerance_bps: i64,
    pub fuzzy_recency: Duration,
    pub staleness_grace: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        let resolver = ResolverConfig::default();
        Self {
            price_tolerance_bps: resolver.price_tolerance_bps,
            fuzzy_recency: resolver.recency_window,
            staleness_grace: Duration::hours(24),
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            price_tolerance_bps: env_or("LOTWATCH_PRICE_TOLERANCE_BPS", defaults.price_tolerance_bps),
            fuzzy_recency: env_hours("LOTWATCH_FUZZY_RECENCY_HOURS", defaults.fuzzy_recency),
            staleness_grace: env_hours("LOTWATCH_STALENESS_GRACE_HOURS", defaults.staleness_grace),
        }
    }

    pub fn resolver(&self) -> ResolverConfig {
        ResolverConfig {
            price_tolerance_bps: self.price_tolerance_bps,
            recency_window: self.fuzzy_recency,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub min_request_delay_ms: u64,
    pub max_detail_fetches: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub reconcile: ReconcileConfig,
    pub normalizer: NormalizerConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://lotwatch.db".to_string(),
            workspace_root: PathBuf::from("."),
            user_agent: "lotwatch-bot/0.1".to_string(),
            http_timeout_secs: 15,
            min_request_delay_ms: 1_500,
            max_detail_fetches: 50,
            scheduler_enabled: false,
            sync_cron: "0 0 6,18 * * *".to_string(),
            reconcile: ReconcileConfig::default(),
            normalizer: NormalizerConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let normalizer = NormalizerConfig {
            max_vehicle_age_years: env_or(
                "LOTWATCH_MAX_VEHICLE_AGE_YEARS",
                defaults.normalizer.max_vehicle_age_years,
            ),
            min_price: env_or("LOTWATCH_MIN_PRICE", defaults.normalizer.min_price),
            max_price: env_or("LOTWATCH_MAX_PRICE", defaults.normalizer.max_price),
        };
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            workspace_root: std::env::var("LOTWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            user_agent: std::env::var("LOTWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("LOTWATCH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            min_request_delay_ms: env_or(
                "LOTWATCH_MIN_REQUEST_DELAY_MS",
                defaults.min_request_delay_ms,
            ),
            max_detail_fetches: env_or("LOTWATCH_MAX_DETAIL_FETCHES", defaults.max_detail_fetches),
            scheduler_enabled: std::env::var("LOTWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("LOTWATCH_SYNC_CRON").unwrap_or(defaults.sync_cron),
            reconcile: ReconcileConfig::from_env(),
            normalizer,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_hours(key: &str, default: Duration) -> Duration {
    hours_setting(std::env::var(key).ok().as_deref(), default)
}

/// Whole hours; negative values count as zero, values past what a `Duration` holds
/// saturate.
fn hours_setting(raw: Option<&str>, default: Duration) -> Duration {
    match raw.and_then(|v| v.trim().parse::<i64>().ok()) {
        Some(hours) => Duration::try_hours(hours.max(0)).unwrap_or(Duration::MAX),
        None => default,
    }
}

/// Which sources a cycle covers. Empty `sources` means every registered source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleRequest {
    pub sources: Vec<String>,
    pub max_detail_fetches: Option<usize>,
}

impl CycleRequest {
    pub fn only<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            max_detail_fetches: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    /// Candidates that passed normalization; rejections are counted apart.
    pub found: usize,
    pub rejected: usize,
    pub new: usize,
    pub updated: usize,
    pub inactivated: usize,
    pub detail_pages_fetched: usize,
    pub dropped: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
}

impl SourceCounts {
    fn add(&mut self, other: &SourceCounts) {
        self.found += other.found;
        self.rejected += other.rejected;
        self.new += other.new;
        self.updated += other.updated;
        self.inactivated += other.inactivated;
        self.detail_pages_fetched += other.detail_pages_fetched;
        self.dropped += other.dropped;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub sources: Vec<String>,
    pub per_source: BTreeMap<String, SourceCounts>,
    pub totals: SourceCounts,
    pub error: Option<String>,
}

impl CycleReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            duration_ms: 0,
            sources: Vec::new(),
            per_source: BTreeMap::new(),
            totals: SourceCounts::default(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn source(&self, name: &str) -> Option<&SourceCounts> {
        self.per_source.get(name)
    }
}

/// An adapter plus its per-source detail budget from the registry.
#[derive(Clone)]
pub struct RegisteredSource {
    adapter: Arc<dyn SourceAdapter>,
    max_detail_fetches: Option<usize>,
}

impl RegisteredSource {
    pub fn new(adapter: impl SourceAdapter + 'static) -> Self {
        Self {
            adapter: Arc::new(adapter),
            max_detail_fetches: None,
        }
    }

    pub fn with_detail_budget(mut self, max_detail_fetches: usize) -> Self {
        self.max_detail_fetches = Some(max_detail_fetches);
        self
    }

    pub fn name(&self) -> &str {
        self.adapter.source_name()
    }
}

enum WriterEvent {
    Candidate {
        source: String,
        candidate: Box<Result<NormalizedCandidate, Rejection>>,
    },
    SourceFinished {
        source: String,
        detail_pages_fetched: usize,
        dropped: usize,
        fetch_error: Option<String>,
    },
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: ListingStore,
    http: Arc<HttpFetcher>,
    normalizer: Arc<Normalizer>,
    sources: Vec<RegisteredSource>,
    upsert: UpsertEngine,
    sweeper: StalenessSweeper,
    recorder: RunRecorder,
    cycle_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: ListingStore,
        normalizer: Normalizer,
        sources: Vec<RegisteredSource>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: std::time::Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            min_request_delay: std::time::Duration::from_millis(config.min_request_delay_ms),
            ..Default::default()
        })?;
        let resolver = IdentityResolver::new(config.reconcile.resolver());
        Ok(Self {
            upsert: UpsertEngine::new(store.clone(), resolver),
            sweeper: StalenessSweeper::new(store.clone(), config.reconcile.staleness_grace),
            recorder: RunRecorder::new(store.clone()),
            http: Arc::new(http),
            normalizer: Arc::new(normalizer),
            config,
            store,
            sources,
            cycle_lock: Mutex::new(()),
        })
    }

    /// Rules from `rules/`, enabled sources from `sources.yaml`, both under the workspace root.
    pub fn from_config(config: SyncConfig, store: ListingStore) -> Result<Self> {
        let normalizer = Normalizer::from_workspace_root(&config.workspace_root, config.normalizer)?;
        let registry = SourceRegistry::load(&config.workspace_root)?;
        let exclusions = normalizer.exclusion_patterns();
        let sources = registry
            .sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| {
                let adapter = adapter_for_source(s, &config.workspace_root, &exclusions)
                    .with_context(|| format!("building adapter for source {}", s.name))?;
                Ok(RegisteredSource {
                    adapter: Arc::from(adapter),
                    max_detail_fetches: s.max_detail_fetches,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(config, store, normalizer, sources)
    }

    pub fn store(&self) -> &ListingStore {
        &self.store
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn run_cycle(&self, request: &CycleRequest) -> Result<CycleReport> {
        self.run_cycle_at(request, Utc::now()).await
    }

    /// Runs one cycle with `now` as the reconciliation clock. Cycles never overlap.
    ///
    /// Source and candidate failures end up in the report; only a failure to record
    /// the run itself is returned as an error.
    pub async fn run_cycle_at(&self, request: &CycleRequest, now: DateTime<Utc>) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        let run_id = Uuid::new_v4();
        let clock = Instant::now();
        let mut report = CycleReport::new(run_id, now);

        async {
            match self.select_sources(request) {
                Ok(selected) => {
                    report.sources = selected.iter().map(|s| s.name().to_string()).collect();
                    if let Err(err) = self.process(run_id, &selected, request, now, &mut report).await {
                        report.error = Some(format!("{err:#}"));
                    }
                }
                Err(err) => {
                    report.sources = request.sources.clone();
                    report.error = Some(err.to_string());
                }
            }
        }
        .instrument(info_span!("sync_cycle", %run_id))
        .await;

        let mut totals = SourceCounts::default();
        for counts in report.per_source.values() {
            totals.add(counts);
        }
        report.totals = totals;

        let failed: Vec<&str> = report
            .per_source
            .iter()
            .filter(|(_, c)| c.fetch_error.is_some())
            .map(|(name, _)| name.as_str())
            .collect();
        if report.error.is_none() && !report.per_source.is_empty() && failed.len() == report.per_source.len() {
            report.error = Some(format!("every source failed to fetch: {}", failed.join(", ")));
        }

        report.duration_ms = i64::try_from(clock.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.recorder
            .record(&report)
            .await
            .context("recording scrape run")?;

        info!(
            %run_id,
            found = report.totals.found,
            rejected = report.totals.rejected,
            new = report.totals.new,
            updated = report.totals.updated,
            inactivated = report.totals.inactivated,
            errors = report.totals.errors,
            duration_ms = report.duration_ms,
            error = ?report.error,
            "cycle finished"
        );
        Ok(report)
    }

    fn select_sources(&self, request: &CycleRequest) -> Result<Vec<&RegisteredSource>> {
        if request.sources.is_empty() {
            return Ok(self.sources.iter().collect());
        }
        let mut requested = HashSet::new();
        request
            .sources
            .iter()
            .filter(|name| requested.insert(name.as_str()))
            .map(|name| {
                self.sources
                    .iter()
                    .find(|s| s.name() == name)
                    .ok_or_else(|| anyhow!("unknown or disabled source `{name}`"))
            })
            .collect()
    }

    async fn process(
        &self,
        run_id: Uuid,
        selected: &[&RegisteredSource],
        request: &CycleRequest,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let mut producers = JoinSet::new();
        for source in selected {
            let name = source.name().to_string();
            report.per_source.entry(name.clone()).or_default();
            let ctx = AdapterContext {
                run_id,
                max_detail_fetches: request
                    .max_detail_fetches
                    .or(source.max_detail_fetches)
                    .unwrap_or(self.config.max_detail_fetches),
            };
            let span = info_span!("source", source = %name);
            producers.spawn(
                produce(
                    name,
                    Arc::clone(&source.adapter),
                    Arc::clone(&self.http),
                    Arc::clone(&self.normalizer),
                    ctx,
                    now,
                    tx.clone(),
                )
                .instrument(span),
            );
        }
        drop(tx);

        let written = self.write(&mut rx, report, now).await;
        if written.is_err() {
            producers.abort_all();
        }
        while let Some(joined) = producers.join_next().await {
            if let Err(err) = joined {
                if !err.is_cancelled() {
                    error!(error = %err, "source task panicked; its listings are not swept");
                }
            }
        }
        written
    }

    /// The only place listings are written during a cycle.
    async fn write(
        &self,
        rx: &mut mpsc::Receiver<WriterEvent>,
        report: &mut CycleReport,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut seen: HashMap<String, HashSet<Uuid>> = HashMap::new();
        let mut sighted = HashSet::new();
        while let Some(event) = rx.recv().await {
            match event {
                WriterEvent::Candidate { source, candidate } => {
                    let counts = report.per_source.entry(source.clone()).or_default();
                    let candidate = match *candidate {
                        Ok(candidate) => candidate,
                        Err(rejection) => {
                            counts.rejected += 1;
                            debug!(source, reason = %rejection, "candidate rejected");
                            continue;
                        }
                    };
                    counts.found += 1;
                    match self.upsert.upsert_sighting(&candidate, now, &mut sighted).await {
                        Ok(outcome) => {
                            if outcome.created {
                                counts.new += 1;
                            } else {
                                counts.updated += 1;
                            }
                            seen.entry(source).or_default().insert(outcome.listing_id);
                        }
                        Err(err) => {
                            counts.errors += 1;
                            warn!(
                                source,
                                source_local_id = %candidate.source_local_id,
                                error = %err,
                                "candidate upsert failed"
                            );
                        }
                    }
                }
                WriterEvent::SourceFinished {
                    source,
                    detail_pages_fetched,
                    dropped,
                    fetch_error,
                } => {
                    let counts = report.per_source.entry(source.clone()).or_default();
                    counts.detail_pages_fetched = detail_pages_fetched;
                    counts.dropped = dropped;
                    if let Some(err) = fetch_error {
                        warn!(source, error = %err, "source fetch failed; skipping staleness sweep");
                        counts.fetch_error = Some(err);
                        continue;
                    }
                    let observed = seen.remove(&source).unwrap_or_default();
                    let inactivated = self
                        .sweeper
                        .sweep(&source, &observed, now)
                        .await
                        .with_context(|| format!("sweeping source {source}"))?;
                    counts.inactivated = inactivated.len();
                }
            }
        }
        Ok(())
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_cycle(&CycleRequest::default()).await {
                    Ok(report) => info!(
                        run_id = %report.run_id,
                        success = report.is_success(),
                        "scheduled cycle finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled cycle failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Collects one source, drops repeated local ids, normalizes, and hands everything
/// to the writer. Always ends with `SourceFinished` unless the writer has gone away.
async fn produce(
    source: String,
    adapter: Arc<dyn SourceAdapter>,
    http: Arc<HttpFetcher>,
    normalizer: Arc<Normalizer>,
    ctx: AdapterContext,
    now: DateTime<Utc>,
    tx: mpsc::Sender<WriterEvent>,
) {
    let finished = match adapter.collect(&http, &ctx).await {
        Ok(batch) => {
            let mut local_ids = HashSet::new();
            let mut duplicates = 0usize;
            for mut raw in batch.candidates {
                if !local_ids.insert(raw.source_local_id.trim().to_string()) {
                    duplicates += 1;
                    continue;
                }
                raw.source = source.clone();
                let candidate = normalizer.normalize(&raw, now);
                let event = WriterEvent::Candidate {
                    source: source.clone(),
                    candidate: Box::new(candidate),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if duplicates > 0 {
                debug!(duplicates, "dropped repeated listings within the cycle");
            }
            WriterEvent::SourceFinished {
                source,
                detail_pages_fetched: batch.detail_pages_fetched,
                dropped: batch.dropped,
                fetch_error: None,
            }
        }
        Err(err) => WriterEvent::SourceFinished {
            source,
            detail_pages_fetched: 0,
            dropped: 0,
            fetch_error: Some(err.to_string()),
        },
    };
    let _ = tx.send(finished).await;
}

pub async fn run_sync_once_from_env(request: &CycleRequest) -> Result<CycleReport> {
    let config = SyncConfig::from_env();
    let store = ListingStore::connect(&config.database_url).await?;
    store.migrate().await.context("migrating listing store")?;
    let pipeline = SyncPipeline::from_config(config, store.clone())?;
    let report = pipeline.run_cycle(request).await;
    store.close().await;
    report
}
