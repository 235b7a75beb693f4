//! Store collaborator contracts + in-memory reference store + HTTP fetch
//! utilities for the tender sync pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use tender_core::{
    NewOpportunity, Opportunity, RunRecord, RunStatus, Source,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tender-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: bool,
}

/// Mutation payload for `SourceRegistry::record_outcome`. Deltas are applied
/// at the store layer so counter updates never round-trip through the caller.
#[derive(Debug, Clone, Copy)]
pub struct OutcomeDelta {
    pub success_delta: u64,
    pub error_delta: u64,
    pub last_sync_at: DateTime<Utc>,
    pub next_sync_at: Option<DateTime<Utc>>,
}

/// Terminal-state payload for `RunLedger::close`.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub found: u64,
    pub inserted: u64,
    pub updated: u64,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Durable source configuration + health counters. The coordinator is the
/// only writer; `record_outcome` is the only mutation entrypoint after seed.
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    /// Enabled sources whose `next_sync_at` is unset or has arrived,
    /// ordered by name for determinism. Sources without a configured
    /// interval are never due.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Source>, StoreError>;

    /// Every enabled source, ordered by name. Supports forced-all mode.
    async fn list_enabled(&self) -> Result<Vec<Source>, StoreError>;

    /// Every known source, ordered by name.
    async fn list_all(&self) -> Result<Vec<Source>, StoreError>;

    async fn get(&self, name: &str) -> Result<Option<Source>, StoreError>;

    /// Insert or replace a registry row; used by catalog seeding.
    async fn upsert_source(&self, source: Source) -> Result<(), StoreError>;

    async fn record_outcome(&self, name: &str, delta: OutcomeDelta) -> Result<(), StoreError>;
}

/// Upsert engine over the shared opportunity table, keyed by
/// `(source, external_id)`.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn upsert(&self, record: NewOpportunity) -> Result<UpsertOutcome, StoreError>;

    async fn find(&self, source: &str, external_id: &str)
        -> Result<Option<Opportunity>, StoreError>;

    async fn list_by_source(&self, source: &str) -> Result<Vec<Opportunity>, StoreError>;
}

/// Append-only run history. Records transition `running` -> terminal exactly
/// once; a crash mid-run leaves the `running` row behind for operators.
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn open(&self, record: RunRecord) -> Result<(), StoreError>;

    async fn close(&self, run_id: Uuid, completion: RunCompletion) -> Result<(), StoreError>;

    /// Most recent runs first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    sources: BTreeMap<String, Source>,
    opportunities: BTreeMap<(String, String), Opportunity>,
    runs: Vec<RunRecord>,
}

/// Reference implementation of all three store contracts, backed by an
/// `RwLock`. SQL-backed implementations slot behind the same traits.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceRegistry for MemoryStore {
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Source>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .sources
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect())
    }

    async fn list_enabled(&self) -> Result<Vec<Source>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .sources
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Source>, StoreError> {
        let state = self.state.read().await;
        Ok(state.sources.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<Source>, StoreError> {
        let state = self.state.read().await;
        Ok(state.sources.get(name).cloned())
    }

    async fn upsert_source(&self, source: Source) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.sources.insert(source.name.clone(), source);
        Ok(())
    }

    async fn record_outcome(&self, name: &str, delta: OutcomeDelta) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let source = state
            .sources
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("source {name}")))?;
        source.success_count += delta.success_delta;
        source.error_count += delta.error_delta;
        source.last_sync_at = Some(delta.last_sync_at);
        source.next_sync_at = delta.next_sync_at;
        Ok(())
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn upsert(&self, record: NewOpportunity) -> Result<UpsertOutcome, StoreError> {
        if record.external_id.trim().is_empty() {
            return Err(StoreError::Constraint(format!(
                "empty external_id for source {}",
                record.source
            )));
        }

        let mut state = self.state.write().await;
        let key = (record.source.clone(), record.external_id.clone());
        match state.opportunities.get_mut(&key) {
            Some(existing) => {
                // Conflict path: refresh only the refreshable fields.
                existing.status = record.status;
                existing.deadline = record.deadline;
                existing.value_low = record.value_low;
                existing.value_high = record.value_high;
                existing.fetched_at = record.fetched_at;
                existing.updated_at = record.fetched_at;
                Ok(UpsertOutcome { inserted: false })
            }
            None => {
                let row = Opportunity {
                    id: Uuid::new_v4(),
                    source: record.source,
                    external_id: record.external_id,
                    title: record.title,
                    client_name: record.client_name,
                    description: record.description,
                    location_text: record.location_text,
                    value_low: record.value_low,
                    value_high: record.value_high,
                    deadline: record.deadline,
                    categories: record.categories,
                    status: record.status,
                    source_url: record.source_url,
                    fetched_at: record.fetched_at,
                    first_seen_at: record.fetched_at,
                    updated_at: record.fetched_at,
                };
                state.opportunities.insert(key, row);
                Ok(UpsertOutcome { inserted: true })
            }
        }
    }

    async fn find(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Opportunity>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .opportunities
            .get(&(source.to_string(), external_id.to_string()))
            .cloned())
    }

    async fn list_by_source(&self, source: &str) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .opportunities
            .values()
            .filter(|o| o.source == source)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn open(&self, record: RunRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.runs.iter().any(|r| r.run_id == record.run_id) {
            return Err(StoreError::Constraint(format!(
                "run {} already opened",
                record.run_id
            )));
        }
        state.runs.push(record);
        Ok(())
    }

    async fn close(&self, run_id: Uuid, completion: RunCompletion) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::Running {
            return Err(StoreError::Constraint(format!(
                "run {run_id} already finalized as {:?}",
                run.status
            )));
        }
        run.status = completion.status;
        run.found = completion.found;
        run.inserted = completion.inserted;
        run.updated = completion.updated;
        run.errors = completion.errors;
        run.completed_at = Some(completion.completed_at);
        run.duration_ms = Some(completion.duration_ms);
        Ok(())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let state = self.state.read().await;
        let mut runs: Vec<_> = state.runs.iter().rev().take(limit).cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin retrying wrapper over `reqwest` with an identifying user-agent.
/// Sources are processed one at a time by the coordinator, so there is no
/// cross-source concurrency control here.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET a markup or feed page for a scrape-backed source.
    pub async fn get_text(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", %run_id, source, url);
        self.execute(|| self.client.get(url)).instrument(span).await
    }

    /// POST a JSON body to a downstream API collaborator.
    pub async fn post_json<B: Serialize>(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", %run_id, source, url);
        self.execute(|| self.client.post(url).json(body))
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
