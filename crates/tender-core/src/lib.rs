//! Core domain model and report contracts for the tender sync pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tender-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Scrape,
}

/// Durable registry row describing one external opportunity feed.
///
/// `name` is the immutable identity key; scheduling and health fields are
/// mutated only through the registry's outcome-recording entrypoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub display_name: String,
    pub kind: SourceKind,
    pub enabled: bool,
    /// Minutes between scheduled runs. `None` means the source is only ever
    /// selected in forced or single-source mode.
    pub interval_minutes: Option<u32>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
}

impl Source {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            kind,
            enabled: true,
            interval_minutes: None,
            last_sync_at: None,
            next_sync_at: None,
            success_count: 0,
            error_count: 0,
        }
    }

    /// Scheduled-mode selection predicate: enabled, has a schedule, and its
    /// next-run time has arrived or was never set.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.interval_minutes.is_some()
            && self.next_sync_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    Live,
    Closed,
    Unknown,
}

/// Normalized record handed from an adapter into the upsert engine.
///
/// `(source, external_id)` is the only identity; everything else is payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOpportunity {
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub client_name: String,
    pub description: String,
    pub location_text: Option<String>,
    pub value_low: Option<f64>,
    pub value_high: Option<f64>,
    pub deadline: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
    pub status: OpportunityStatus,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
}

/// Persisted opportunity row. Refreshable fields (`status`, `deadline`,
/// `value_low`/`value_high`, `fetched_at`) are overwritten on every
/// re-observation; the rest keep their first-observed values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub client_name: String,
    pub description: String,
    pub location_text: Option<String>,
    pub value_low: Option<f64>,
    pub value_high: Option<f64>,
    pub deadline: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
    pub status: OpportunityStatus,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Audit entry for one (source, invocation) execution. Written in `running`
/// state before the adapter is invoked and finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub source: String,
    pub status: RunStatus,
    pub triggered_by: String,
    pub found: u64,
    pub inserted: u64,
    pub updated: u64,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl RunRecord {
    pub fn open(
        run_id: Uuid,
        source: impl Into<String>,
        triggered_by: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            source: source.into(),
            status: RunStatus::Running,
            triggered_by: triggered_by.into(),
            found: 0,
            inserted: 0,
            updated: 0,
            errors: Vec::new(),
            started_at,
            completed_at: None,
            duration_ms: None,
        }
    }
}

/// What one adapter invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SyncOutcome {
    pub success: bool,
    pub found: u64,
    pub inserted: u64,
    pub updated: u64,
    pub errors: Vec<String>,
}

impl SyncOutcome {
    pub fn empty() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![message.into()],
            ..Self::default()
        }
    }
}

/// Inbound trigger payload for `run_sync`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub triggered_by: Option<String>,
    /// Specific source name; selects single-source mode.
    #[serde(default)]
    pub source: Option<String>,
    /// Selects forced-all mode; ignored when `source` is set.
    #[serde(default)]
    pub force_all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionMode {
    Scheduled,
    ForcedAll,
    Single(String),
}

impl SyncRequest {
    pub fn origin(&self) -> &str {
        self.triggered_by.as_deref().unwrap_or("manual")
    }

    pub fn mode(&self) -> SelectionMode {
        if let Some(name) = &self.source {
            SelectionMode::Single(name.clone())
        } else if self.force_all {
            SelectionMode::ForcedAll
        } else {
            SelectionMode::Scheduled
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRunStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerSourceResult {
    pub source: String,
    pub status: SourceRunStatus,
    pub found: u64,
    pub inserted: u64,
    pub updated: u64,
    pub errors: Vec<String>,
    pub duration_ms: i64,
}

/// Aggregate report returned to the caller of `run_sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorReport {
    pub success: bool,
    pub triggered_by: String,
    pub sources_processed: u64,
    pub total_opportunities_found: u64,
    pub total_inserted: u64,
    pub total_updated: u64,
    pub results: Vec<PerSourceResult>,
    pub next_scheduled: Option<DateTime<Utc>>,
}

impl OrchestratorReport {
    /// The normal, non-error result of an invocation that selected nothing.
    pub fn empty(triggered_by: impl Into<String>) -> Self {
        Self {
            success: true,
            triggered_by: triggered_by.into(),
            sources_processed: 0,
            total_opportunities_found: 0,
            total_inserted: 0,
            total_updated: 0,
            results: Vec::new(),
            next_scheduled: None,
        }
    }
}
