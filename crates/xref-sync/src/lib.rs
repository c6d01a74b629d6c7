//! Cross-reference run orchestration: configuration, the fetch -> index ->
//! match -> refresh pipeline, the output table refresh and run reports.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use xref_core::{Adviser, FundFiling, MatchMethod, MatchRecord, OfferingFiling};
use xref_match::{
    check_discrepancies, join_issues, CascadeStats, Match, MatchCascade, OfferingIndex,
    OverduePolicy, OverdueStatus, Resolution,
};
use xref_storage::{
    fetch_all, BackoffPolicy, FetchOutcome, PageQuery, PostgrestStore, RemoteStore,
    RetryDisposition, Row, StoreConfig, StoreError, TableRequest,
};

pub use xref_match::SimilarityConfig;

pub const CRATE_NAME: &str = "xref-sync";

pub const FORMD_TABLE: &str = "form_d_filings";
pub const FORMD_ORDER_COLUMN: &str = "id";
pub const FORMD_COLUMNS: &str =
    "id,accessionnumber,entityname,filing_date,totalofferingamount,totalamountsold,investmentfundtype,file_num";
pub const FUNDS_TABLE: &str = "funds_enriched";
pub const FUNDS_ORDER_COLUMN: &str = "reference_id";
pub const ADVISERS_TABLE: &str = "advisers_enriched";
pub const ADVISERS_ORDER_COLUMN: &str = "crd";
pub const ADVISERS_COLUMNS: &str = "crd,adviser_name,primary_website,type,total_aum,aum_2025";
pub const MATCHES_TABLE: &str = "cross_reference_matches";
pub const MATCHES_KEY_COLUMN: &str = "id";

const DEFAULT_USER_AGENT: &str = "xref-bot/0.1";

#[derive(Clone)]
pub struct RemoteEndpoint {
    pub url: String,
    pub key: String,
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("url", &self.url)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Everything one run needs, built once at startup and passed down.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub adv: RemoteEndpoint,
    pub formd: RemoteEndpoint,
    pub page_size: usize,
    pub insert_batch: usize,
    pub clear_batch: usize,
    pub similarity: Option<SimilarityConfig>,
    pub overdue: OverduePolicy,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub reports_dir: Option<PathBuf>,
    pub dry_run: bool,
    pub fetch_backoff: BackoffPolicy,
    pub clear_backoff: BackoffPolicy,
}

impl RunConfig {
    pub fn for_endpoints(adv: RemoteEndpoint, formd: RemoteEndpoint) -> Self {
        Self {
            adv,
            formd,
            page_size: 1000,
            insert_batch: 500,
            clear_batch: 5000,
            similarity: None,
            overdue: OverduePolicy::default(),
            http_timeout_secs: 60,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            reports_dir: None,
            dry_run: false,
            fetch_backoff: BackoffPolicy::default(),
            clear_backoff: BackoffPolicy::fixed(5, Duration::from_secs(1)),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::for_endpoints(
            required_endpoint(&lookup, "ADV")?,
            required_endpoint(&lookup, "FORMD")?,
        );
        config.page_size = lookup_number(&lookup, "XREF_PAGE_SIZE", config.page_size).max(1);
        config.insert_batch = lookup_number(&lookup, "XREF_INSERT_BATCH", config.insert_batch).max(1);
        config.clear_batch = lookup_number(&lookup, "XREF_CLEAR_BATCH", config.clear_batch).max(1);
        config.http_timeout_secs =
            lookup_number(&lookup, "XREF_HTTP_TIMEOUT_SECS", config.http_timeout_secs);
        if let Some(year) = lookup("XREF_REPORTING_YEAR").and_then(|v| v.trim().parse().ok()) {
            config.overdue = OverduePolicy::for_reporting_year(year);
        }
        if lookup("XREF_SIMILARITY")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
        {
            config.similarity = Some(SimilarityConfig::default());
        }
        if let Some(agent) = lookup("XREF_USER_AGENT") {
            config.user_agent = agent;
        }
        config.reports_dir = lookup("XREF_REPORTS_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Ok(config)
    }

    fn store_config(&self, endpoint: &RemoteEndpoint) -> StoreConfig {
        StoreConfig {
            base_url: endpoint.url.clone(),
            api_key: endpoint.key.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn required_endpoint(
    lookup: &impl Fn(&str) -> Option<String>,
    prefix: &str,
) -> Result<RemoteEndpoint> {
    let required = |name: String| {
        lookup(&name)
            .filter(|v| !v.trim().is_empty())
            .with_context(|| format!("{name} is not set"))
    };
    Ok(RemoteEndpoint {
        url: required(format!("{prefix}_URL"))?,
        key: required(format!("{prefix}_KEY"))?,
    })
}

fn lookup_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> T {
    lookup(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Client settings for the offering store alone. Only `FORMD_URL` and
/// `FORMD_KEY` are required.
pub fn output_store_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<StoreConfig> {
    let endpoint = required_endpoint(&lookup, "FORMD")?;
    Ok(StoreConfig {
        base_url: endpoint.url,
        api_key: endpoint.key,
        timeout: Duration::from_secs(lookup_number(&lookup, "XREF_HTTP_TIMEOUT_SECS", 60)),
        user_agent: Some(
            lookup("XREF_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        ),
    })
}

/// One matched fund, borrowing both sides for the duration of the run.
#[derive(Debug, Clone)]
pub struct MatchResult<'a> {
    pub fund: &'a FundFiling,
    pub found: Match<'a>,
    pub adviser: Option<&'a Adviser>,
    pub issues: Vec<&'static str>,
    pub overdue: OverdueStatus,
    pub computed_at: DateTime<Utc>,
}

impl MatchResult<'_> {
    pub fn to_record(&self) -> MatchRecord {
        let filing = self.found.filing;
        MatchRecord {
            formd_accession: filing.accession_number.clone(),
            formd_entity_name: filing.entity_name.clone(),
            formd_filing_date: filing.filing_date.clone(),
            formd_offering_amount: filing.offering_amount,
            adv_fund_id: self.fund.fund_id.clone(),
            adv_fund_name: self.fund.fund_name.clone(),
            adv_filing_date: self.fund.updated_at.clone(),
            adv_gav: self.fund.latest_gross_asset_value,
            adviser_entity_crd: self.fund.adviser_entity_crd.clone(),
            adviser_entity_legal_name: self.adviser.and_then(|a| a.adviser_name.clone()),
            match_score: self.found.confidence,
            issues: join_issues(&self.issues),
            overdue_adv_flag: self.overdue.overdue,
            latest_adv_year: self.overdue.latest_year,
            computed_at: self.computed_at,
        }
    }
}

pub fn record_to_row(record: &MatchRecord) -> Result<Row> {
    match serde_json::to_value(record).context("serializing match record")? {
        JsonValue::Object(row) => Ok(row),
        other => bail!("match record serialized to a non-object: {other}"),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub deleted: usize,
    pub clear_complete: bool,
    pub inserted: usize,
    pub failed_batches: usize,
    pub final_count: Option<usize>,
}

/// Replaces the contents of the output table: batched clear, then batched
/// insert. The two phases are not transactional.
pub struct RefreshStore<'a> {
    store: &'a dyn RemoteStore,
    table: &'a str,
    key_column: &'a str,
    clear_batch: usize,
    insert_batch: usize,
    clear_backoff: BackoffPolicy,
}

impl<'a> RefreshStore<'a> {
    pub fn new(store: &'a dyn RemoteStore, table: &'a str, key_column: &'a str) -> Self {
        Self {
            store,
            table,
            key_column,
            clear_batch: 5000,
            insert_batch: 500,
            clear_backoff: BackoffPolicy::fixed(5, Duration::from_secs(1)),
        }
    }

    pub fn with_batches(mut self, clear_batch: usize, insert_batch: usize) -> Self {
        self.clear_batch = clear_batch.max(1);
        self.insert_batch = insert_batch.max(1);
        self
    }

    pub fn with_clear_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.clear_backoff = backoff;
        self
    }

    pub async fn replace_all(&self, rows: &[Row]) -> RefreshReport {
        let span = info_span!("refresh", table = self.table);
        async move {
            let (deleted, clear_complete) = self.clear().await;
            info!(deleted, clear_complete, "cleared old matches");

            let (inserted, failed_batches) = self.insert(rows).await;
            let final_count = match self.store.count_rows(self.table).await {
                Ok(count) => Some(count),
                Err(err) => {
                    warn!(error = %err, "could not count output rows");
                    None
                }
            };
            info!(inserted, failed_batches, rows = ?final_count, "stored matches");

            RefreshReport {
                deleted,
                clear_complete,
                inserted,
                failed_batches,
                final_count,
            }
        }
        .instrument(span)
        .await
    }

    /// Deletes the lowest `clear_batch` keys per step until none remain.
    /// Returns rows deleted and whether the table was emptied.
    async fn clear(&self) -> (usize, bool) {
        let mut deleted = 0usize;
        let mut previous_first: Option<JsonValue> = None;

        loop {
            let mut attempt = 0usize;
            let batch = loop {
                match self.delete_lowest_keys().await {
                    Ok(batch) => break Some(batch),
                    Err(err)
                        if err.disposition() == RetryDisposition::Retryable
                            && attempt < self.clear_backoff.max_retries =>
                    {
                        let delay = self.clear_backoff.delay_for_attempt(attempt);
                        attempt += 1;
                        warn!(attempt, error = %err, "clear batch failed; retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => {
                        warn!(deleted, error = %err, "abandoning clear");
                        break None;
                    }
                }
            };

            match batch {
                None => return (deleted, false),
                Some(None) => return (deleted, true),
                Some(Some((first, count))) => {
                    if previous_first.as_ref() == Some(&first) {
                        warn!(deleted, "delete made no progress; abandoning clear");
                        return (deleted, false);
                    }
                    previous_first = Some(first);
                    deleted += count;
                    debug!(deleted, "deleted batch");
                }
            }
        }
    }

    /// Deletes the key range covering the next batch. `None` when empty.
    async fn delete_lowest_keys(&self) -> Result<Option<(JsonValue, usize)>, StoreError> {
        let query = PageQuery {
            table: self.table,
            select: Some(self.key_column),
            order_column: self.key_column,
            after: None,
            limit: self.clear_batch,
        };
        let keys: Vec<JsonValue> = self
            .store
            .fetch_page(&query)
            .await?
            .into_iter()
            .filter_map(|mut row| row.remove(self.key_column))
            .filter(|v| !v.is_null())
            .collect();

        let (Some(first), Some(last)) = (keys.first(), keys.last()) else {
            return Ok(None);
        };
        self.store
            .delete_range(self.table, self.key_column, first, last)
            .await?;
        Ok(Some((first.clone(), keys.len())))
    }

    async fn insert(&self, rows: &[Row]) -> (usize, usize) {
        let mut inserted = 0usize;
        let mut failed = 0usize;
        for (index, batch) in rows.chunks(self.insert_batch).enumerate() {
            match self.store.insert_rows(self.table, batch).await {
                Ok(()) => {
                    inserted += batch.len();
                    if (index + 1) % 10 == 0 {
                        info!(inserted, total = rows.len(), "inserting");
                    }
                }
                Err(err) => {
                    failed += 1;
                    warn!(batch = index + 1, error = %err, "insert batch failed; skipping");
                }
            }
        }
        (inserted, failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub offering_rows: usize,
    pub offering_fetch_complete: bool,
    pub indexed_keys: usize,
    pub indexed_names: usize,
    pub fund_rows: usize,
    pub fund_fetch_complete: bool,
    pub advisers: usize,
    pub undecodable_rows: usize,
    pub cascade: CascadeStats,
    pub overdue: usize,
    pub with_issues: usize,
    pub refresh: Option<RefreshReport>,
}

pub struct CrossRefPipeline {
    config: RunConfig,
    adv: Arc<dyn RemoteStore>,
    formd: Arc<dyn RemoteStore>,
}

impl CrossRefPipeline {
    pub fn new(config: RunConfig) -> Result<Self> {
        let adv = PostgrestStore::new(config.store_config(&config.adv))
            .context("building adviser store client")?;
        let formd = PostgrestStore::new(config.store_config(&config.formd))
            .context("building offering store client")?;
        Ok(Self::with_stores(config, Arc::new(adv), Arc::new(formd)))
    }

    pub fn with_stores(
        config: RunConfig,
        adv: Arc<dyn RemoteStore>,
        formd: Arc<dyn RemoteStore>,
    ) -> Self {
        Self { config, adv, formd }
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("xref_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let config = &self.config;
        info!(
            dry_run = config.dry_run,
            similarity = config.similarity.is_some(),
            "cross-reference run started"
        );

        let offerings = self
            .fetch_table(
                self.formd.as_ref(),
                TableRequest::new(FORMD_TABLE, FORMD_ORDER_COLUMN).with_select(FORMD_COLUMNS),
            )
            .await?;
        let offering_fetch_complete = offerings.complete;
        let (filings, bad_filings) = decode_rows::<OfferingFiling>(offerings.rows, FORMD_TABLE);
        let index = OfferingIndex::build(&filings);
        info!(
            filings = filings.len(),
            keys = index.key_count(),
            names = index.name_count(),
            key_collisions = index.key_collisions(),
            name_collisions = index.name_collisions(),
            "indexed offering filings"
        );

        let fund_outcome = self
            .fetch_table(
                self.adv.as_ref(),
                TableRequest::new(FUNDS_TABLE, FUNDS_ORDER_COLUMN),
            )
            .await?;
        let fund_fetch_complete = fund_outcome.complete;
        let (funds, bad_funds) = decode_rows::<FundFiling>(fund_outcome.rows, FUNDS_TABLE);

        let adviser_outcome = self
            .fetch_table(
                self.adv.as_ref(),
                TableRequest::new(ADVISERS_TABLE, ADVISERS_ORDER_COLUMN).with_select(ADVISERS_COLUMNS),
            )
            .await?;
        let (advisers, bad_advisers) = decode_rows::<Adviser>(adviser_outcome.rows, ADVISERS_TABLE);
        let advisers_by_crd: HashMap<&str, &Adviser> = advisers
            .iter()
            .filter_map(|a| a.crd.as_deref().map(|crd| (crd, a)))
            .collect();
        info!(advisers = advisers_by_crd.len(), "indexed advisers");

        let mut cascade = MatchCascade::new(&index);
        if let Some(similarity) = config.similarity {
            cascade = cascade.with_similarity(similarity);
        }

        let computed_at = Utc::now();
        let mut stats = CascadeStats::default();
        let mut results = Vec::new();
        for (position, fund) in funds.iter().enumerate() {
            let resolution = cascade.resolve(fund);
            stats.record(&resolution);
            if (position + 1) % 10_000 == 0 {
                info!(
                    processed = position + 1,
                    total = funds.len(),
                    matched = stats.matched(),
                    "matching"
                );
            }

            let Resolution::Matched(found) = resolution else {
                continue;
            };
            debug!(
                fund_id = fund.fund_id.as_deref().unwrap_or_default(),
                method = found.method.as_str(),
                confidence = found.confidence,
                "matched"
            );
            results.push(MatchResult {
                fund,
                found,
                adviser: fund
                    .adviser_entity_crd
                    .as_deref()
                    .and_then(|crd| advisers_by_crd.get(crd).copied()),
                issues: check_discrepancies(fund, found.filing),
                overdue: config.overdue.evaluate(fund),
                computed_at,
            });
        }

        let overdue = results.iter().filter(|r| r.overdue.overdue).count();
        let with_issues = results.iter().filter(|r| !r.issues.is_empty()).count();
        info!(
            processed = stats.processed,
            by_key = stats.matched_by_key,
            by_name = stats.matched_by_name,
            by_similarity = stats.matched_by_similarity,
            unmatched = stats.unmatched,
            skipped = stats.unusable,
            overdue,
            with_issues,
            "matching finished"
        );

        let refresh = if config.dry_run {
            info!(matches = results.len(), "dry run; output table left untouched");
            None
        } else {
            let rows = results
                .iter()
                .map(|r| record_to_row(&r.to_record()))
                .collect::<Result<Vec<_>>>()?;
            let store = RefreshStore::new(self.formd.as_ref(), MATCHES_TABLE, MATCHES_KEY_COLUMN)
                .with_batches(config.clear_batch, config.insert_batch)
                .with_clear_backoff(config.clear_backoff);
            Some(store.replace_all(&rows).await)
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: config.dry_run,
            offering_rows: filings.len(),
            offering_fetch_complete,
            indexed_keys: index.key_count(),
            indexed_names: index.name_count(),
            fund_rows: funds.len(),
            fund_fetch_complete,
            advisers: advisers_by_crd.len(),
            undecodable_rows: bad_filings + bad_funds + bad_advisers,
            cascade: stats,
            overdue,
            with_issues,
            refresh,
        };

        if let Some(dir) = &config.reports_dir {
            let written = write_run_report(dir, &summary).await?;
            info!(report = %written.display(), "wrote run report");
        }

        Ok(summary)
    }

    async fn fetch_table(
        &self,
        store: &dyn RemoteStore,
        request: TableRequest,
    ) -> Result<FetchOutcome> {
        let request = request.with_page_size(self.config.page_size);
        let outcome = fetch_all(store, &request, &self.config.fetch_backoff)
            .await
            .with_context(|| format!("fetching {}", request.table))?;

        if !outcome.complete {
            if outcome.rows.is_empty() {
                bail!(
                    "{} is unavailable: {}",
                    request.table,
                    outcome.last_error.as_deref().unwrap_or("no rows returned")
                );
            }
            warn!(
                table = %request.table,
                rows = outcome.rows.len(),
                "continuing with a partial table"
            );
        }
        info!(table = %request.table, rows = outcome.rows.len(), "fetched");
        Ok(outcome)
    }
}

/// Decodes rows into `T`, dropping and counting the ones that do not fit.
fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>, table: &str) -> (Vec<T>, usize) {
    let mut decoded = Vec::with_capacity(rows.len());
    let mut failed = 0usize;
    for row in rows {
        match serde_json::from_value(JsonValue::Object(row)) {
            Ok(value) => decoded.push(value),
            Err(err) => {
                failed += 1;
                debug!(table, error = %err, "skipping undecodable row");
            }
        }
    }
    if failed > 0 {
        warn!(table, failed, "skipped undecodable rows");
    }
    (decoded, failed)
}

/// Writes `{dir}/{run_id}/summary.json` and `brief.md`; returns the run
/// directory.
pub async fn write_run_report(dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    fs::write(run_dir.join("brief.md"), brief_markdown(summary))
        .await
        .context("writing brief.md")?;
    Ok(run_dir)
}

fn brief_markdown(summary: &RunSummary) -> String {
    let completeness = |complete: bool| if complete { "complete" } else { "partial" };
    let stats = &summary.cascade;
    let by_method: String = [MatchMethod::Key, MatchMethod::Name, MatchMethod::Similarity]
        .into_iter()
        .map(|method| format!("- By {}: {}\n", method.as_str(), stats.matched_by(method)))
        .collect();
    let output = match &summary.refresh {
        Some(r) => format!(
            "- Deleted: {}{}\n- Inserted: {}\n- Failed insert batches: {}\n- Rows after refresh: {}",
            r.deleted,
            if r.clear_complete { "" } else { " (clear incomplete)" },
            r.inserted,
            r.failed_batches,
            r.final_count.map_or_else(|| "unknown".to_string(), |c| c.to_string())
        ),
        None => "- Dry run; output table not written".to_string(),
    };

    format!(
        "# Cross-Reference Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Offering filings: {} ({})\n- Fund filings: {} ({})\n- Advisers: {}\n- Undecodable rows: {}\n\n## Matching\n- Processed: {}\n{}- Unmatched: {}\n- Skipped (no key or name): {}\n- Overdue: {}\n- With discrepancies: {}\n\n## Output\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.offering_rows,
        completeness(summary.offering_fetch_complete),
        summary.fund_rows,
        completeness(summary.fund_fetch_complete),
        summary.advisers,
        summary.undecodable_rows,
        stats.processed,
        by_method,
        stats.unmatched,
        stats.unusable,
        summary.overdue,
        summary.with_issues,
        output
    )
}

pub async fn output_row_count(store: &dyn RemoteStore) -> Result<usize> {
    store
        .count_rows(MATCHES_TABLE)
        .await
        .with_context(|| format!("counting {MATCHES_TABLE}"))
}

pub async fn output_row_count_from_env() -> Result<usize> {
    let config = output_store_config_from_lookup(|name| std::env::var(name).ok())?;
    let store = PostgrestStore::new(config).context("building offering store client")?;
    output_row_count(&store).await
}

pub async fn run_once(config: RunConfig) -> Result<RunSummary> {
    CrossRefPipeline::new(config)?.run_once().await
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    run_once(RunConfig::from_env()?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xref_storage::MemoryStore;

    fn rows(values: Vec<JsonValue>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().expect("object"))
            .collect()
    }

    fn match_rows(count: usize) -> Vec<Row> {
        (0..count)
            .map(|i| {
                json!({ "adv_fund_name": format!("fund {i}"), "match_score": 1.0 })
                    .as_object()
                    .cloned()
                    .expect("object")
            })
            .collect()
    }

    fn refresh(store: &MemoryStore) -> RefreshStore<'_> {
        RefreshStore::new(store, MATCHES_TABLE, MATCHES_KEY_COLUMN)
            .with_batches(2, 2)
            .with_clear_backoff(BackoffPolicy::immediate(3))
    }

    #[tokio::test]
    async fn replace_all_twice_leaves_exactly_one_copy() {
        let store = MemoryStore::new().with_table(MATCHES_TABLE, match_rows(5));
        let new_rows = match_rows(3);

        let first = refresh(&store).replace_all(&new_rows).await;
        let second = refresh(&store).replace_all(&new_rows).await;

        assert_eq!(first.deleted, 5);
        assert_eq!(second.deleted, 3);
        assert!(second.clear_complete);
        assert_eq!(second.final_count, Some(3));
        let names: Vec<_> = store
            .rows(MATCHES_TABLE)
            .await
            .iter()
            .map(|r| r["adv_fund_name"].clone())
            .collect();
        assert_eq!(names, vec![json!("fund 0"), json!("fund 1"), json!("fund 2")]);
    }

    #[tokio::test]
    async fn failed_insert_batch_is_skipped() {
        let store = MemoryStore::new();
        // call 0 reads keys, calls 1..=3 insert; the second insert fails
        store.inject_failures(2, 1).await;

        let report = refresh(&store).replace_all(&match_rows(5)).await;

        assert_eq!(report.inserted, 3);
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.final_count, Some(3));
    }

    #[tokio::test]
    async fn clear_retries_transient_failures() {
        let store = MemoryStore::new().with_table(MATCHES_TABLE, match_rows(5));
        store.inject_failures(0, 2).await;

        let report = refresh(&store).replace_all(&[]).await;

        assert_eq!(report.deleted, 5);
        assert!(report.clear_complete);
        assert_eq!(report.final_count, Some(0));
    }

    #[tokio::test]
    async fn clear_gives_up_after_bounded_retries_and_still_inserts() {
        let store = MemoryStore::new().with_table(MATCHES_TABLE, match_rows(2));
        store.inject_failures(0, 4).await;

        let report = refresh(&store).replace_all(&match_rows(1)).await;

        assert_eq!(report.deleted, 0);
        assert!(!report.clear_complete);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.final_count, Some(3));
    }

    #[test]
    fn config_requires_endpoints() {
        let err = RunConfig::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains("ADV_URL"));
    }

    #[test]
    fn config_reads_tuning_variables() {
        let env: HashMap<&str, &str> = [
            ("ADV_URL", "https://adv.example"),
            ("ADV_KEY", "adv-key"),
            ("FORMD_URL", "https://formd.example"),
            ("FORMD_KEY", "formd-key"),
            ("XREF_PAGE_SIZE", "250"),
            ("XREF_SIMILARITY", "true"),
            ("XREF_REPORTING_YEAR", "2026"),
            ("XREF_INSERT_BATCH", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = RunConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).expect("config");

        assert_eq!(config.page_size, 250);
        assert_eq!(config.insert_batch, 500);
        assert_eq!(config.similarity, Some(SimilarityConfig::default()));
        assert_eq!(config.overdue.reporting_year, 2026);
        assert!(config.reports_dir.is_none());
        assert!(!format!("{config:?}").contains("adv-key"));
    }

    #[tokio::test]
    async fn counting_needs_only_the_offering_endpoint() {
        let env: HashMap<&str, &str> = [
            ("FORMD_URL", "https://formd.example"),
            ("FORMD_KEY", "formd-key"),
            ("XREF_HTTP_TIMEOUT_SECS", "15"),
        ]
        .into_iter()
        .collect();
        let lookup = |k: &str| env.get(k).map(|v| v.to_string());

        assert!(RunConfig::from_lookup(lookup).is_err());
        let store_config = output_store_config_from_lookup(lookup).expect("offering config");
        assert_eq!(store_config.base_url, "https://formd.example");
        assert_eq!(store_config.timeout, Duration::from_secs(15));

        let store = MemoryStore::new().with_table(MATCHES_TABLE, match_rows(4));
        assert_eq!(output_row_count(&store).await.expect("count"), 4);
    }

    #[test]
    fn match_result_serializes_to_output_row_shape() {
        let filing = OfferingFiling {
            accession_number: Some("0001".into()),
            entity_name: Some("ACME VENTURES LP".into()),
            offering_amount: Some(5_000_000.0),
            ..Default::default()
        };
        let fund = FundFiling {
            fund_id: Some("805-1".into()),
            fund_name: Some("Acme Ventures, L.P.".into()),
            adviser_entity_crd: Some("42".into()),
            ..Default::default()
        };
        let adviser = Adviser {
            crd: Some("42".into()),
            adviser_name: Some("ACME ADVISERS LLC".into()),
            ..Default::default()
        };
        let result = MatchResult {
            fund: &fund,
            found: Match {
                filing: &filing,
                method: MatchMethod::Key,
                confidence: 1.0,
            },
            adviser: Some(&adviser),
            issues: vec![xref_match::PE_VC_MISMATCH, xref_match::HEDGE_MISMATCH],
            overdue: OverdueStatus {
                latest_year: Some(2022),
                overdue: true,
            },
            computed_at: Utc::now(),
        };

        let row = record_to_row(&result.to_record()).expect("row");

        assert_eq!(row["formd_accession"], json!("0001"));
        assert_eq!(row["adviser_entity_legal_name"], json!("ACME ADVISERS LLC"));
        assert_eq!(row["match_score"], json!(1.0));
        assert_eq!(
            row["issues"],
            json!("Fund type mismatch: PE vs VC | Hedge fund classification mismatch")
        );
        assert_eq!(row["overdue_adv_flag"], json!(true));
        assert_eq!(row["latest_adv_year"], json!(2022));
        assert!(row["computed_at"].is_string());
        assert_eq!(row.len(), 15);
    }

    #[test]
    fn undecodable_rows_are_counted() {
        let (advisers, failed) = decode_rows::<Adviser>(
            rows(vec![json!({"crd": 1, "adviser_name": "A"}), json!({"crd": {"nested": true}})]),
            ADVISERS_TABLE,
        );
        assert_eq!(advisers.len(), 1);
        assert_eq!(failed, 1);
    }
}
