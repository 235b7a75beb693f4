//! Run coordinator: source selection, per-source isolation, run bookkeeping
//! and schedule advancement for the tender sync pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tender_adapters::{
    AdapterRegistry, ConstructionIndexAdapter, CouncilPortalAdapter, DownstreamApiAdapter,
    SyncContext,
};
use tender_core::{
    OrchestratorReport, PerSourceResult, RunRecord, RunStatus, SelectionMode, Source, SourceKind,
    SourceRunStatus, SyncOutcome, SyncRequest,
};
use tender_store::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, MemoryStore, OpportunityStore, OutcomeDelta,
    RunCompletion, RunLedger, SourceRegistry, StoreError,
};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tender-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub catalog_path: PathBuf,
    pub downstream_sync_url: String,
    pub construction_index_url: String,
    pub council_portal_name: String,
    pub council_portal_url: String,
    pub user_agent: String,
    pub http_timeout: Duration,
    /// Budget for one source's adapting step; a hung source is recorded as
    /// failed and the loop proceeds.
    pub source_timeout: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("sources.yaml"),
            downstream_sync_url: "http://localhost:54321/functions/v1/sync-uk-tenders-api"
                .to_string(),
            construction_index_url: "https://www.theconstructionindex.co.uk/tenders?status=Active"
                .to_string(),
            council_portal_name: "Council procurement portals".to_string(),
            council_portal_url: "https://procontract.due-north.com/Opportunities".to_string(),
            user_agent: "tender-sync-bot/0.1".to_string(),
            http_timeout: Duration::from_secs(20),
            source_timeout: Duration::from_secs(120),
            scheduler_enabled: false,
            sync_cron_1: "0 0 6 * * *".to_string(),
            sync_cron_2: "0 0 18 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            catalog_path: std::env::var("TENDER_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_path),
            downstream_sync_url: std::env::var("TENDER_DOWNSTREAM_SYNC_URL")
                .unwrap_or(defaults.downstream_sync_url),
            construction_index_url: std::env::var("TENDER_CONSTRUCTION_INDEX_URL")
                .unwrap_or(defaults.construction_index_url),
            council_portal_name: std::env::var("TENDER_COUNCIL_PORTAL_NAME")
                .unwrap_or(defaults.council_portal_name),
            council_portal_url: std::env::var("TENDER_COUNCIL_PORTAL_URL")
                .unwrap_or(defaults.council_portal_url),
            user_agent: std::env::var("TENDER_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout: std::env::var("TENDER_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            source_timeout: std::env::var("TENDER_SOURCE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.source_timeout),
            scheduler_enabled: std::env::var("TENDER_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("TENDER_SYNC_CRON_1").unwrap_or(defaults.sync_cron_1),
            sync_cron_2: std::env::var("TENDER_SYNC_CRON_2").unwrap_or(defaults.sync_cron_2),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceCatalog {
    pub sources: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub display_name: String,
    pub kind: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

pub async fn load_source_catalog(path: impl AsRef<Path>) -> Result<SourceCatalog> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Seed the registry from the catalog. Configuration fields follow the
/// catalog; health counters and schedule timestamps already in the store are
/// preserved, so re-seeding at startup is harmless.
pub async fn seed_registry(
    registry: &dyn SourceRegistry,
    catalog: &SourceCatalog,
) -> Result<usize> {
    for entry in &catalog.sources {
        let mut source = registry
            .get(&entry.name)
            .await?
            .unwrap_or_else(|| Source::new(&entry.name, &entry.display_name, entry.kind));
        source.display_name = entry.display_name.clone();
        source.kind = entry.kind;
        source.enabled = entry.enabled;
        source.interval_minutes = entry.interval_minutes;
        registry.upsert_source(source).await?;
    }
    Ok(catalog.sources.len())
}

/// Next-run time computed from the run's completion time, so a slow source
/// does not get a shorter effective gap.
pub fn next_sync_after(
    completed_at: DateTime<Utc>,
    interval_minutes: Option<u32>,
) -> Option<DateTime<Utc>> {
    interval_minutes.map(|minutes| completed_at + chrono::Duration::minutes(i64::from(minutes)))
}

fn unregistered_outcome(name: &str) -> SyncOutcome {
    let mut outcome = SyncOutcome::empty();
    outcome
        .errors
        .push(format!("no adapter registered for source {name}; nothing fetched"));
    outcome
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Registry unreachable during selection: fatal for the invocation, no
    /// run records are opened.
    #[error("source selection failed: {0}")]
    Selection(#[from] StoreError),
    #[error("unknown source: {0}")]
    UnknownSource(String),
}

pub struct Coordinator {
    config: SyncConfig,
    registry: Arc<dyn SourceRegistry>,
    opportunities: Arc<dyn OpportunityStore>,
    runs: Arc<dyn RunLedger>,
    adapters: AdapterRegistry,
    http: HttpFetcher,
    /// Advisory lock: overlapping triggers within this process serialize
    /// instead of racing on registry writes.
    run_guard: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(
        config: SyncConfig,
        registry: Arc<dyn SourceRegistry>,
        opportunities: Arc<dyn OpportunityStore>,
        runs: Arc<dyn RunLedger>,
        adapters: AdapterRegistry,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        })?;
        Ok(Self {
            config,
            registry,
            opportunities,
            runs,
            adapters,
            http,
            run_guard: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn SourceRegistry> {
        &self.registry
    }

    pub fn runs(&self) -> &Arc<dyn RunLedger> {
        &self.runs
    }

    pub fn opportunities(&self) -> &Arc<dyn OpportunityStore> {
        &self.opportunities
    }

    /// One full orchestration invocation: select -> per-source
    /// (open run -> adapt -> close run -> record outcome) -> aggregate.
    pub async fn run_sync(&self, request: SyncRequest) -> Result<OrchestratorReport, SyncError> {
        let _guard = self.run_guard.lock().await;
        let triggered_by = request.origin().to_string();
        let selected = self.select_sources(&request).await?;

        if selected.is_empty() {
            info!(%triggered_by, "no sources selected; nothing to do");
            return Ok(OrchestratorReport::empty(triggered_by));
        }

        info!(
            %triggered_by,
            sources = selected.len(),
            "starting sync invocation"
        );

        let mut results = Vec::with_capacity(selected.len());
        for source in &selected {
            let result = self.process_source(source, &triggered_by).await;
            match result.status {
                SourceRunStatus::Failed => warn!(
                    source = %result.source,
                    errors = ?result.errors,
                    "source sync failed"
                ),
                _ => info!(
                    source = %result.source,
                    found = result.found,
                    inserted = result.inserted,
                    updated = result.updated,
                    "source sync finished"
                ),
            }
            results.push(result);
        }

        let next_scheduled = self.next_scheduled().await;
        Ok(aggregate_report(triggered_by, results, next_scheduled))
    }

    async fn select_sources(&self, request: &SyncRequest) -> Result<Vec<Source>, SyncError> {
        let mut sources = match request.mode() {
            SelectionMode::Scheduled => self.registry.list_due(Utc::now()).await?,
            SelectionMode::ForcedAll => self.registry.list_enabled().await?,
            SelectionMode::Single(name) => {
                let source = self
                    .registry
                    .get(&name)
                    .await?
                    .ok_or(SyncError::UnknownSource(name))?;
                vec![source]
            }
        };
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    /// Everything after selection is per-source isolated: whatever happens
    /// here, the caller's loop continues with the next source.
    async fn process_source(&self, source: &Source, triggered_by: &str) -> PerSourceResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        // The run record must exist before the adapter runs so a crash
        // mid-run still leaves a `running` row behind.
        if let Err(err) = self
            .runs
            .open(RunRecord::open(run_id, &source.name, triggered_by, started_at))
            .await
        {
            warn!(source = %source.name, error = %err, "run record not opened; skipping source");
            return PerSourceResult {
                source: source.name.clone(),
                status: SourceRunStatus::Skipped,
                found: 0,
                inserted: 0,
                updated: 0,
                errors: vec![format!("run record not opened: {err}")],
                duration_ms: 0,
            };
        }

        let outcome = self.adapt(source, run_id, triggered_by, started_at).await;

        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds();
        let status = if outcome.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        let mut errors = outcome.errors.clone();
        if let Err(err) = self
            .runs
            .close(
                run_id,
                RunCompletion {
                    status,
                    found: outcome.found,
                    inserted: outcome.inserted,
                    updated: outcome.updated,
                    errors: outcome.errors,
                    completed_at,
                    duration_ms,
                },
            )
            .await
        {
            warn!(source = %source.name, error = %err, "run record not finalized");
            errors.push(format!("run record not finalized: {err}"));
        }

        let delta = OutcomeDelta {
            success_delta: u64::from(outcome.success),
            error_delta: u64::from(!outcome.success),
            last_sync_at: completed_at,
            next_sync_at: next_sync_after(completed_at, source.interval_minutes),
        };
        if let Err(err) = self.registry.record_outcome(&source.name, delta).await {
            warn!(source = %source.name, error = %err, "registry outcome not recorded");
            errors.push(format!("registry outcome not recorded: {err}"));
        }

        PerSourceResult {
            source: source.name.clone(),
            status: if outcome.success {
                SourceRunStatus::Success
            } else {
                SourceRunStatus::Failed
            },
            found: outcome.found,
            inserted: outcome.inserted,
            updated: outcome.updated,
            errors,
            duration_ms,
        }
    }

    async fn adapt(
        &self,
        source: &Source,
        run_id: Uuid,
        triggered_by: &str,
        fetched_at: DateTime<Utc>,
    ) -> SyncOutcome {
        let Some(adapter) = self.adapters.get(&source.name) else {
            // Soft failure: the source may be configured ahead of its
            // adapter shipping.
            return unregistered_outcome(&source.name);
        };

        let ctx = SyncContext {
            run_id,
            triggered_by,
            fetched_at,
            http: &self.http,
            opportunities: self.opportunities.as_ref(),
        };

        match tokio::time::timeout(self.config.source_timeout, adapter.sync(&ctx)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => SyncOutcome::failed(err.to_string()),
            Err(_) => SyncOutcome::failed(format!(
                "source timed out after {}s",
                self.config.source_timeout.as_secs()
            )),
        }
    }

    async fn next_scheduled(&self) -> Option<DateTime<Utc>> {
        match self.registry.list_enabled().await {
            Ok(sources) => sources.iter().filter_map(|s| s.next_sync_at).min(),
            Err(err) => {
                warn!(error = %err, "could not compute next scheduled time");
                None
            }
        }
    }
}

fn aggregate_report(
    triggered_by: String,
    results: Vec<PerSourceResult>,
    next_scheduled: Option<DateTime<Utc>>,
) -> OrchestratorReport {
    let mut report = OrchestratorReport::empty(triggered_by);
    report.sources_processed = results.len() as u64;
    for result in &results {
        report.total_opportunities_found += result.found;
        report.total_inserted += result.inserted;
        report.total_updated += result.updated;
    }
    report.results = results;
    report.next_scheduled = next_scheduled;
    report
}

/// Built-in adapter wiring for the configured endpoints.
pub fn default_adapters(config: &SyncConfig) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(DownstreamApiAdapter::new(
        config.downstream_sync_url.clone(),
    )));
    registry.register(Arc::new(ConstructionIndexAdapter::new(
        config.construction_index_url.clone(),
    )));
    registry.register(Arc::new(CouncilPortalAdapter::new(
        config.council_portal_name.clone(),
        config.council_portal_url.clone(),
    )));
    registry
}

/// Env-configured coordinator over the in-memory store, seeded from the
/// source catalog. The binaries share this wiring.
pub async fn coordinator_from_env() -> Result<Arc<Coordinator>> {
    let config = SyncConfig::from_env();
    let store = Arc::new(MemoryStore::new());
    let catalog = load_source_catalog(&config.catalog_path).await?;
    let seeded = seed_registry(store.as_ref(), &catalog).await?;
    info!(sources = seeded, catalog = %config.catalog_path.display(), "source registry seeded");

    let adapters = default_adapters(&config);
    let coordinator = Coordinator::new(
        config,
        store.clone(),
        store.clone(),
        store,
        adapters,
    )?;
    Ok(Arc::new(coordinator))
}

/// Cron-driven trigger, enabled via `TENDER_SCHEDULER_ENABLED`. Each firing
/// is an ordinary scheduled-mode invocation with `triggered_by = "cron"`.
pub async fn maybe_build_scheduler(
    coordinator: Arc<Coordinator>,
) -> Result<Option<JobScheduler>> {
    if !coordinator.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let crons = [
        coordinator.config().sync_cron_1.clone(),
        coordinator.config().sync_cron_2.clone(),
    ];
    for cron in crons {
        let coordinator = coordinator.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let coordinator = coordinator.clone();
            Box::pin(async move {
                let request = SyncRequest {
                    triggered_by: Some("cron".to_string()),
                    ..SyncRequest::default()
                };
                match coordinator.run_sync(request).await {
                    Ok(report) => info!(
                        sources = report.sources_processed,
                        found = report.total_opportunities_found,
                        "scheduled sync completed"
                    ),
                    Err(err) => warn!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
