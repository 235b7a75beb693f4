//! Source adapter contract + API-backed and scrape-backed implementations.
//!
//! Each adapter owns fetch + normalize (+ persist) for exactly one source.
//! Dispatch is a name -> adapter registry so wiring a new source is a single
//! registration, not an edit to a central conditional.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use scraper::{Html, Selector};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tender_core::{NewOpportunity, OpportunityStatus, SourceKind, SyncOutcome};
use tender_store::{FetchError, HttpFetcher, OpportunityStore, UpsertOutcome};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tender-adapters";

pub const UK_TENDERS_API: &str = "uk_tenders_api";
pub const CONSTRUCTION_INDEX: &str = "construction_index";
pub const COUNCIL_PORTAL: &str = "council_portal";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Per-invocation collaborators handed to an adapter by the coordinator.
/// Adapters drive the upsert engine themselves; the coordinator only
/// aggregates the counts they report.
pub struct SyncContext<'a> {
    pub run_id: Uuid,
    pub triggered_by: &'a str,
    pub fetched_at: DateTime<Utc>,
    pub http: &'a HttpFetcher,
    pub opportunities: &'a dyn OpportunityStore,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &'static str;
    fn kind(&self) -> SourceKind;

    async fn sync(&self, ctx: &SyncContext<'_>) -> Result<SyncOutcome, AdapterError>;
}

/// Name -> adapter dispatch table.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.source_name(), adapter);
    }

    pub fn get(&self, source_name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source_name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.adapters.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Upsert every normalized record, counting inserts/updates and converting
/// per-record persistence failures into error strings without aborting the
/// rest of the batch.
async fn upsert_records(ctx: &SyncContext<'_>, records: Vec<NewOpportunity>) -> SyncOutcome {
    let mut outcome = SyncOutcome::empty();
    outcome.found = records.len() as u64;
    for record in records {
        let label = format!("{}/{}", record.source, record.external_id);
        match ctx.opportunities.upsert(record).await {
            Ok(UpsertOutcome { inserted: true }) => outcome.inserted += 1,
            Ok(UpsertOutcome { inserted: false }) => outcome.updated += 1,
            Err(err) => outcome.errors.push(format!("upsert {label}: {err}")),
        }
    }
    outcome
}

// --- relevance + normalization helpers -------------------------------------

const ELECTRICAL_KEYWORDS: &[&str] = &[
    "electrical",
    "electric",
    "electrician",
    "wiring",
    "rewire",
    "rewiring",
    "cabling",
    "lighting",
    "luminaire",
    "fire alarm",
    "fire detection",
    "smoke detector",
    "access control",
    "eicr",
    "periodic inspection",
    "fixed wire testing",
    "pat testing",
    "consumer unit",
    "distribution board",
    "switchgear",
    "ev charging",
    "ev charger",
    "charge point",
    "solar pv",
    "photovoltaic",
    "data cabling",
    "structured cabling",
    "cctv",
    "door entry",
    "m&e",
    "mechanical and electrical",
    "building services",
];

const CATEGORY_RULES: &[(&str, &[&str])] = &[
    ("fire_alarm", &["fire alarm", "fire detection"]),
    ("emergency_lighting", &["emergency light"]),
    ("rewire", &["rewir", "re-wir"]),
    ("testing", &["eicr", "periodic inspection", "testing"]),
    ("ev_charging", &["ev charg", "electric vehicle", "charge point"]),
    ("lighting", &["lighting", "luminaire", "led "]),
    ("solar", &["solar", "photovoltaic"]),
    ("data_cabling", &["data cabling", "structured cabling", "cat6"]),
    ("m_and_e", &["m&e", "mechanical and electrical"]),
];

pub fn is_relevant(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    ELECTRICAL_KEYWORDS.iter().any(|needle| lower.contains(needle))
}

pub fn categories_for(text: &str) -> Vec<String> {
    let lower = text.to_ascii_lowercase();
    let mut categories = vec!["electrical".to_string()];
    for (category, needles) in CATEGORY_RULES {
        if needles.iter().any(|needle| lower.contains(needle)) {
            categories.push((*category).to_string());
        }
    }
    categories
}

/// Stable content-derived identifier for sources that publish none of their
/// own. Derived from title + client + deadline so a re-observed listing maps
/// onto the same row run after run.
pub fn stable_external_id(
    title: &str,
    client: &str,
    deadline: Option<DateTime<Utc>>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_ascii_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(client.trim().to_ascii_lowercase().as_bytes());
    hasher.update(b"|");
    if let Some(deadline) = deadline {
        hasher.update(deadline.to_rfc3339().as_bytes());
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        // Thousands separator inside a number.
        if ch == ',' && !current.is_empty() {
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

/// "£120,000 - £180,000" -> (120000, 180000); a single figure fills both ends.
pub fn extract_money_range(text: &str) -> (Option<f64>, Option<f64>) {
    let nums = extract_numbers(text);
    let low = nums.first().copied();
    let high = nums.get(1).copied().or(low);
    (low, high)
}

pub fn parse_deadline(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn origin_of(url: &str) -> &str {
    let Some(scheme_end) = url.find("://") else {
        return url;
    };
    match url[scheme_end + 3..].find('/') {
        Some(idx) => &url[..scheme_end + 3 + idx],
        None => url,
    }
}

fn absolutize(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{base}{href}")
    } else {
        format!("{base}/{href}")
    }
}

// --- API-backed adapter -----------------------------------------------------

/// Delegates to the dedicated downstream sync service and relays its counts.
/// The downstream owns persistence for the records it processes.
pub struct DownstreamApiAdapter {
    endpoint: String,
}

impl DownstreamApiAdapter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownstreamSummary {
    total_found: Option<u64>,
    processed: Option<u64>,
    #[serde(default)]
    inserted: u64,
    #[serde(default)]
    updated: u64,
    #[serde(default)]
    errors: Vec<String>,
}

fn summary_outcome(summary: DownstreamSummary) -> SyncOutcome {
    SyncOutcome {
        success: true,
        found: summary
            .total_found
            .or(summary.processed)
            .unwrap_or(summary.inserted + summary.updated),
        inserted: summary.inserted,
        updated: summary.updated,
        errors: summary.errors,
    }
}

#[async_trait]
impl SourceAdapter for DownstreamApiAdapter {
    fn source_name(&self) -> &'static str {
        UK_TENDERS_API
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn sync(&self, ctx: &SyncContext<'_>) -> Result<SyncOutcome, AdapterError> {
        let body = serde_json::json!({ "triggered_by": ctx.triggered_by });
        let resp = ctx
            .http
            .post_json(ctx.run_id, self.source_name(), &self.endpoint, &body)
            .await?;
        let summary: DownstreamSummary = serde_json::from_slice(&resp.body)
            .map_err(|e| AdapterError::Message(format!("invalid downstream response: {e}")))?;
        Ok(summary_outcome(summary))
    }
}

// --- scrape-backed adapters -------------------------------------------------

/// Construction Index tender listing: a table of rows whose first cell links
/// to the notice and whose second cell carries the location.
pub struct ConstructionIndexAdapter {
    listing_url: String,
}

impl ConstructionIndexAdapter {
    pub fn new(listing_url: impl Into<String>) -> Self {
        Self {
            listing_url: listing_url.into(),
        }
    }
}

fn notice_id_from_href(href: &str) -> Option<String> {
    let rest = href.split("/tender/").nth(1)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

pub fn extract_construction_index(
    html: &str,
    listing_url: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<NewOpportunity>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = parse_selector("tr")?;
    let link_sel = parse_selector("td a[href]")?;
    let cell_sel = parse_selector("td")?;
    let base = origin_of(listing_url);

    let mut records = Vec::new();
    for row in document.select(&row_sel) {
        let Some(link) = row.select(&link_sel).next() else {
            continue;
        };
        let Some(title) = text_or_none(link.text().collect::<String>()) else {
            continue;
        };
        if !is_relevant(&title) {
            continue;
        }

        let href = link.value().attr("href").unwrap_or_default();
        let location = row
            .select(&cell_sel)
            .nth(1)
            .and_then(|cell| text_or_none(cell.text().collect::<String>()));
        let external_id = notice_id_from_href(href)
            .unwrap_or_else(|| stable_external_id(&title, "Construction Index", None));

        records.push(NewOpportunity {
            source: CONSTRUCTION_INDEX.to_string(),
            external_id,
            title: title.clone(),
            client_name: "Construction Index listing".to_string(),
            description: title.clone(),
            location_text: location,
            value_low: None,
            value_high: None,
            deadline: None,
            categories: categories_for(&title),
            status: OpportunityStatus::Live,
            source_url: absolutize(base, href),
            fetched_at,
        });
    }
    Ok(records)
}

#[async_trait]
impl SourceAdapter for ConstructionIndexAdapter {
    fn source_name(&self) -> &'static str {
        CONSTRUCTION_INDEX
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Scrape
    }

    async fn sync(&self, ctx: &SyncContext<'_>) -> Result<SyncOutcome, AdapterError> {
        let page = ctx
            .http
            .get_text(ctx.run_id, self.source_name(), &self.listing_url)
            .await?;
        let records =
            extract_construction_index(&page.text(), &self.listing_url, ctx.fetched_at)?;
        Ok(upsert_records(ctx, records).await)
    }
}

/// ProContract-style council procurement portal: opportunity cards with a
/// title heading plus client/deadline/value/location spans.
pub struct CouncilPortalAdapter {
    portal_name: String,
    listing_url: String,
}

impl CouncilPortalAdapter {
    pub fn new(portal_name: impl Into<String>, listing_url: impl Into<String>) -> Self {
        Self {
            portal_name: portal_name.into(),
            listing_url: listing_url.into(),
        }
    }
}

pub fn extract_council_portal(
    html: &str,
    portal_name: &str,
    listing_url: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<NewOpportunity>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = parse_selector("div.opportunity, li.opportunity")?;
    let title_sel = parse_selector("h2, h3")?;
    let link_sel = parse_selector("a[href]")?;
    let client_sel = parse_selector(".client")?;
    let summary_sel = parse_selector(".summary")?;
    let deadline_sel = parse_selector(".deadline")?;
    let value_sel = parse_selector(".value")?;
    let location_sel = parse_selector(".location")?;
    let base = origin_of(listing_url);

    let first_text = |card: &scraper::ElementRef<'_>, sel: &Selector| {
        card.select(sel)
            .next()
            .and_then(|el| text_or_none(el.text().collect::<String>()))
    };

    let mut records = Vec::new();
    for card in document.select(&card_sel) {
        let Some(title) = first_text(&card, &title_sel) else {
            continue;
        };
        let summary = first_text(&card, &summary_sel);
        let haystack = match &summary {
            Some(summary) => format!("{title} {summary}"),
            None => title.clone(),
        };
        if !is_relevant(&haystack) {
            continue;
        }

        let client = first_text(&card, &client_sel).unwrap_or_else(|| portal_name.to_string());
        let deadline = first_text(&card, &deadline_sel).and_then(|text| parse_deadline(&text));
        let (value_low, value_high) = first_text(&card, &value_sel)
            .map(|text| extract_money_range(&text))
            .unwrap_or((None, None));
        let external_id = card
            .value()
            .attr("data-notice-id")
            .map(str::to_string)
            .unwrap_or_else(|| stable_external_id(&title, &client, deadline));
        let source_url = card
            .select(&link_sel)
            .next()
            .and_then(|link| link.value().attr("href"))
            .map(|href| absolutize(base, href))
            .unwrap_or_else(|| listing_url.to_string());

        records.push(NewOpportunity {
            source: COUNCIL_PORTAL.to_string(),
            external_id,
            title: title.clone(),
            client_name: client,
            description: summary.unwrap_or_else(|| title.clone()),
            location_text: first_text(&card, &location_sel),
            value_low,
            value_high,
            deadline,
            categories: categories_for(&haystack),
            status: OpportunityStatus::Live,
            source_url,
            fetched_at,
        });
    }
    Ok(records)
}

#[async_trait]
impl SourceAdapter for CouncilPortalAdapter {
    fn source_name(&self) -> &'static str {
        COUNCIL_PORTAL
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Scrape
    }

    async fn sync(&self, ctx: &SyncContext<'_>) -> Result<SyncOutcome, AdapterError> {
        let page = ctx
            .http
            .get_text(ctx.run_id, self.source_name(), &self.listing_url)
            .await?;
        let records = extract_council_portal(
            &page.text(),
            &self.portal_name,
            &self.listing_url,
            ctx.fetched_at,
        )?;
        Ok(upsert_records(ctx, records).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tender_store::{HttpClientConfig, MemoryStore};

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).single().unwrap()
    }

    const TCI_LISTING: &str = r#"
        <table>
          <tr><th>Opportunity</th><th>Location</th></tr>
          <tr>
            <td><a href="/tender/81234/rewire">Rewire of community centre</a></td>
            <td>Leeds</td>
          </tr>
          <tr>
            <td><a href="/tender/81235/roofing">Roof repairs framework</a></td>
            <td>York</td>
          </tr>
          <tr>
            <td><a href="https://partner.example.org/notice/99">Fire alarm upgrade programme</a></td>
            <td>Hull</td>
          </tr>
        </table>
    "#;

    #[test]
    fn construction_index_extraction_filters_and_normalizes() {
        let records = extract_construction_index(
            TCI_LISTING,
            "https://www.theconstructionindex.co.uk/tenders",
            fetched_at(),
        )
        .unwrap();

        assert_eq!(records.len(), 2, "roofing row is not relevant");

        let rewire = &records[0];
        assert_eq!(rewire.external_id, "81234");
        assert_eq!(rewire.location_text.as_deref(), Some("Leeds"));
        assert_eq!(
            rewire.source_url,
            "https://www.theconstructionindex.co.uk/tender/81234/rewire"
        );
        assert!(rewire.categories.contains(&"rewire".to_string()));

        let alarm = &records[1];
        assert_eq!(alarm.source_url, "https://partner.example.org/notice/99");
        // No /tender/<id> segment, so the identifier is content-derived.
        assert_eq!(alarm.external_id.len(), 16);
        assert!(alarm.categories.contains(&"fire_alarm".to_string()));
    }

    const COUNCIL_LISTING: &str = r#"
        <ul>
          <li class="opportunity" data-notice-id="4471">
            <h3>Emergency lighting replacement</h3>
            <span class="client">Kent County Council</span>
            <span class="summary">Replace emergency lighting across 14 sites.</span>
            <span class="deadline">2026-04-01</span>
            <span class="value">£120,000 - £180,000</span>
            <span class="location">Maidstone</span>
            <a href="/opportunity/4471">View notice</a>
          </li>
          <li class="opportunity" data-notice-id="4472">
            <h3>Grounds maintenance 2026-2029</h3>
            <span class="client">Kent County Council</span>
          </li>
          <li class="opportunity">
            <h3>EICR testing programme</h3>
            <span class="client">Medway Council</span>
          </li>
        </ul>
    "#;

    #[test]
    fn council_portal_extraction_parses_deadline_value_and_ids() {
        let records = extract_council_portal(
            COUNCIL_LISTING,
            "Kent County Council",
            "https://procontract.example.co.uk/opportunities",
            fetched_at(),
        )
        .unwrap();

        assert_eq!(records.len(), 2, "grounds maintenance is not relevant");

        let lighting = &records[0];
        assert_eq!(lighting.external_id, "4471");
        assert_eq!(lighting.client_name, "Kent County Council");
        assert_eq!(lighting.value_low, Some(120_000.0));
        assert_eq!(lighting.value_high, Some(180_000.0));
        assert_eq!(
            lighting.deadline,
            Utc.with_ymd_and_hms(2026, 4, 1, 23, 59, 59).single()
        );
        assert_eq!(
            lighting.source_url,
            "https://procontract.example.co.uk/opportunity/4471"
        );
        assert_eq!(
            lighting.description,
            "Replace emergency lighting across 14 sites."
        );
        assert!(lighting.categories.contains(&"emergency_lighting".to_string()));

        let eicr = &records[1];
        assert_eq!(eicr.external_id.len(), 16);
        assert!(eicr.categories.contains(&"testing".to_string()));
    }

    #[test]
    fn synthesized_identifiers_are_stable_across_runs() {
        let first = extract_council_portal(
            COUNCIL_LISTING,
            "Kent County Council",
            "https://procontract.example.co.uk/opportunities",
            fetched_at(),
        )
        .unwrap();
        let second = extract_council_portal(
            COUNCIL_LISTING,
            "Kent County Council",
            "https://procontract.example.co.uk/opportunities",
            Utc.with_ymd_and_hms(2026, 3, 11, 8, 0, 0).single().unwrap(),
        )
        .unwrap();

        assert_eq!(first[1].external_id, second[1].external_id);
    }

    #[test]
    fn stable_external_id_varies_with_content() {
        let a = stable_external_id("Rewire block A", "Council", None);
        let b = stable_external_id("Rewire block B", "Council", None);
        assert_ne!(a, b);
        assert_eq!(a, stable_external_id("Rewire block A", "Council", None));
    }

    #[test]
    fn money_range_handles_thousands_separators_and_single_values() {
        assert_eq!(
            extract_money_range("£120,000 - £180,000"),
            (Some(120_000.0), Some(180_000.0))
        );
        assert_eq!(extract_money_range("£95,500"), (Some(95_500.0), Some(95_500.0)));
        assert_eq!(extract_money_range("TBC"), (None, None));
    }

    #[test]
    fn deadline_parses_rfc3339_and_plain_dates() {
        assert_eq!(
            parse_deadline("2026-04-01T12:30:00Z"),
            Utc.with_ymd_and_hms(2026, 4, 1, 12, 30, 0).single()
        );
        assert_eq!(
            parse_deadline("2026-04-01"),
            Utc.with_ymd_and_hms(2026, 4, 1, 23, 59, 59).single()
        );
        assert_eq!(parse_deadline("when ready"), None);
    }

    #[test]
    fn downstream_summary_falls_back_from_total_found_to_processed() {
        let with_total: DownstreamSummary =
            serde_json::from_str(r#"{"total_found": 41, "inserted": 12, "updated": 3}"#).unwrap();
        let outcome = summary_outcome(with_total);
        assert_eq!(outcome.found, 41);
        assert_eq!(outcome.inserted, 12);
        assert!(outcome.success);

        let with_processed: DownstreamSummary =
            serde_json::from_str(r#"{"processed": 7, "errors": ["one bad row"]}"#).unwrap();
        let outcome = summary_outcome(with_processed);
        assert_eq!(outcome.found, 7);
        assert_eq!(outcome.errors.len(), 1);
    }

    fn mk_record(external_id: &str) -> NewOpportunity {
        NewOpportunity {
            source: COUNCIL_PORTAL.to_string(),
            external_id: external_id.to_string(),
            title: "EICR testing programme".to_string(),
            client_name: "Medway Council".to_string(),
            description: "EICR testing programme".to_string(),
            location_text: None,
            value_low: None,
            value_high: None,
            deadline: None,
            categories: vec!["electrical".to_string()],
            status: OpportunityStatus::Live,
            source_url: "https://example.test/notice/1".to_string(),
            fetched_at: fetched_at(),
        }
    }

    #[tokio::test]
    async fn upsert_records_counts_and_swallows_per_record_failures() {
        let store = MemoryStore::new();
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = SyncContext {
            run_id: Uuid::new_v4(),
            triggered_by: "test",
            fetched_at: fetched_at(),
            http: &http,
            opportunities: &store,
        };

        let records = vec![mk_record("a"), mk_record("a"), mk_record(""), mk_record("b")];
        let outcome = upsert_records(&ctx, records).await;

        assert!(outcome.success);
        assert_eq!(outcome.found, 4);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.errors.len(), 1, "constraint failure is swallowed");
    }

    #[test]
    fn registry_dispatches_by_name() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(ConstructionIndexAdapter::new(
            "https://www.theconstructionindex.co.uk/tenders",
        )));
        registry.register(Arc::new(DownstreamApiAdapter::new(
            "https://api.example.test/sync",
        )));

        assert!(registry.get(CONSTRUCTION_INDEX).is_some());
        assert!(registry.get("no_such_source").is_none());
        assert_eq!(registry.names(), vec![CONSTRUCTION_INDEX, UK_TENDERS_API]);
    }
}
