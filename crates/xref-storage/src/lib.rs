//! Remote table access for the cross-reference run: the store seam, its
//! PostgREST and in-memory implementations, retry policy and keyset paging.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "xref-storage";

pub type Row = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry policy. Attempt `n` (zero-based) waits `base_delay * 2^n`,
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl BackoffPolicy {
    /// Same delay before every retry.
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// Retries without sleeping; for tests.
    pub fn immediate(max_retries: usize) -> Self {
        Self::fixed(max_retries, Duration::ZERO)
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request to {table} failed: {source}")]
    Request {
        table: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} from {table}: {body}")]
    HttpStatus {
        table: String,
        status: u16,
        body: String,
    },
    #[error("unexpected response from {table}: {message}")]
    Decode { table: String, message: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Request { source, .. } => classify_reqwest_error(source),
            StoreError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            StoreError::Decode { .. } => RetryDisposition::NonRetryable,
            StoreError::Unavailable(_) => RetryDisposition::Retryable,
        }
    }
}

/// One keyset page request: rows with `order_column > after`, ascending.
#[derive(Debug, Clone, Copy)]
pub struct PageQuery<'a> {
    pub table: &'a str,
    pub select: Option<&'a str>,
    pub order_column: &'a str,
    pub after: Option<&'a JsonValue>,
    pub limit: usize,
}

/// Tabular store operations used by the run. Each call is a single attempt;
/// retrying is the caller's business.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Vec<Row>, StoreError>;

    /// Delete rows whose `column` lies in `from..=to`.
    async fn delete_range(
        &self,
        table: &str,
        column: &str,
        from: &JsonValue,
        to: &JsonValue,
    ) -> Result<(), StoreError>;

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<(), StoreError>;

    async fn count_rows(&self, table: &str) -> Result<usize, StoreError>;
}

/// Orders cursor values: numbers numerically, strings lexicographically.
pub fn compare_cursor(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        _ => cursor_param(a).cmp(&cursor_param(b)),
    }
}

/// Cursor value as it appears in a filter expression.
pub fn cursor_param(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// `RemoteStore` over a PostgREST endpoint (`{base_url}/rest/v1/{table}`).
#[derive(Debug)]
pub struct PostgrestStore {
    client: reqwest::Client,
    base_url: String,
}

impl PostgrestStore {
    pub fn new(config: StoreConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut api_key =
            HeaderValue::from_str(&config.api_key).context("api key is not a valid header value")?;
        api_key.set_sensitive(true);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .context("api key is not a valid header value")?;
        bearer.set_sensitive(true);
        headers.insert("apikey", api_key);
        headers.insert(AUTHORIZATION, bearer);

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Keyset page read: ordered, limited, filtered strictly above the cursor.
    /// No offset is ever sent.
    fn page_request(&self, query: &PageQuery<'_>) -> reqwest::RequestBuilder {
        let mut params = vec![
            ("select".to_string(), query.select.unwrap_or("*").to_string()),
            ("order".to_string(), format!("{}.asc", query.order_column)),
            ("limit".to_string(), query.limit.to_string()),
        ];
        if let Some(after) = query.after {
            params.push((query.order_column.to_string(), format!("gt.{}", cursor_param(after))));
        }
        self.client.get(self.table_url(query.table)).query(&params)
    }

    fn delete_range_request(
        &self,
        table: &str,
        column: &str,
        from: &JsonValue,
        to: &JsonValue,
    ) -> reqwest::RequestBuilder {
        let params = [
            (column.to_string(), format!("gte.{}", cursor_param(from))),
            (column.to_string(), format!("lte.{}", cursor_param(to))),
        ];
        self.client
            .delete(self.table_url(table))
            .query(&params)
            .header("Prefer", "return=minimal")
    }

    fn count_request(&self, table: &str) -> reqwest::RequestBuilder {
        self.client
            .head(self.table_url(table))
            .query(&[("select", "*")])
            .header("Prefer", "count=exact")
    }

    async fn send(
        &self,
        table: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let resp = request.send().await.map_err(|source| StoreError::Request {
            table: table.to_string(),
            source,
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::HttpStatus {
            table: table.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RemoteStore for PostgrestStore {
    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Vec<Row>, StoreError> {
        let resp = self.send(query.table, self.page_request(query)).await?;
        resp.json::<Vec<Row>>().await.map_err(|err| {
            if err.is_decode() {
                StoreError::Decode {
                    table: query.table.to_string(),
                    message: err.to_string(),
                }
            } else {
                StoreError::Request {
                    table: query.table.to_string(),
                    source: err,
                }
            }
        })
    }

    async fn delete_range(
        &self,
        table: &str,
        column: &str,
        from: &JsonValue,
        to: &JsonValue,
    ) -> Result<(), StoreError> {
        let request = self.delete_range_request(table, column, from, to);
        self.send(table, request).await?;
        Ok(())
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=minimal")
            .json(rows);
        self.send(table, request).await?;
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<usize, StoreError> {
        let resp = self.send(table, self.count_request(table)).await?;
        resp.headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| StoreError::Decode {
                table: table.to_string(),
                message: "missing or malformed Content-Range total".to_string(),
            })
    }
}

/// Total from a `Content-Range` value such as `0-24/3573` or `*/0`.
pub fn parse_content_range_total(value: &str) -> Option<usize> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

/// In-process `RemoteStore`. Rows inserted without an `id` get the next
/// integer id of their table. Failures can be scheduled to exercise retries.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Row>>,
    next_ids: BTreeMap<String, u64>,
    calls: usize,
    failure_window: Option<(usize, usize)>,
}

impl MemoryState {
    fn begin_call(&mut self) -> Result<(), StoreError> {
        let index = self.calls;
        self.calls += 1;
        match self.failure_window {
            Some((start, count)) if index >= start && index < start + count => Err(
                StoreError::Unavailable(format!("scheduled failure on call {index}")),
            ),
            _ => Ok(()),
        }
    }

    fn push_row(&mut self, table: &str, mut row: Row) {
        let next = self.next_ids.entry(table.to_string()).or_insert(1);
        match row.get("id").and_then(JsonValue::as_u64) {
            Some(id) => *next = (*next).max(id + 1),
            None => {
                row.insert("id".to_string(), JsonValue::from(*next));
                *next += 1;
            }
        }
        self.tables.entry(table.to_string()).or_default().push(row);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, rows: Vec<Row>) -> Self {
        let state = self.state.get_mut();
        state.tables.entry(table.to_string()).or_default();
        for row in rows {
            state.push_row(table, row);
        }
        self
    }

    /// Calls `after_calls .. after_calls + count` (zero-based, counting every
    /// operation) fail with a retryable error.
    pub async fn inject_failures(&self, after_calls: usize, count: usize) {
        self.state.lock().await.failure_window = Some((after_calls, count));
    }

    pub async fn calls(&self) -> usize {
        self.state.lock().await.calls
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Vec<Row>, StoreError> {
        let mut state = self.state.lock().await;
        state.begin_call()?;

        let columns: Option<Vec<&str>> = query
            .select
            .filter(|s| s.trim() != "*")
            .map(|s| s.split(',').map(str::trim).collect());

        let mut rows: Vec<&Row> = state
            .tables
            .get(query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| match row.get(query.order_column) {
                        None | Some(JsonValue::Null) => false,
                        Some(value) => query
                            .after
                            .map_or(true, |after| compare_cursor(value, after) == Ordering::Greater),
                    })
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            compare_cursor(
                a.get(query.order_column).unwrap_or(&JsonValue::Null),
                b.get(query.order_column).unwrap_or(&JsonValue::Null),
            )
        });

        Ok(rows
            .into_iter()
            .take(query.limit)
            .map(|row| match &columns {
                Some(columns) => row
                    .iter()
                    .filter(|(k, _)| columns.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                None => row.clone(),
            })
            .collect())
    }

    async fn delete_range(
        &self,
        table: &str,
        column: &str,
        from: &JsonValue,
        to: &JsonValue,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.begin_call()?;
        if let Some(rows) = state.tables.get_mut(table) {
            rows.retain(|row| match row.get(column) {
                Some(value) => {
                    compare_cursor(value, from) == Ordering::Less
                        || compare_cursor(value, to) == Ordering::Greater
                }
                None => true,
            });
        }
        Ok(())
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.begin_call()?;
        for row in rows {
            state.push_row(table, row.clone());
        }
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.begin_call()?;
        Ok(state.tables.get(table).map_or(0, Vec::len))
    }
}

/// Full-table read description for [`fetch_all`].
#[derive(Debug, Clone)]
pub struct TableRequest {
    pub table: String,
    pub select: Option<String>,
    pub order_column: String,
    pub page_size: usize,
}

impl TableRequest {
    pub fn new(table: impl Into<String>, order_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            select: None,
            order_column: order_column.into(),
            page_size: 1000,
        }
    }

    pub fn with_select(mut self, columns: impl Into<String>) -> Self {
        self.select = Some(columns.into());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Column list sent to the store; an explicit list always carries the
    /// ordering column so the cursor can advance.
    pub fn effective_select(&self) -> Option<String> {
        let select = self.select.as_deref()?;
        if select.trim() == "*"
            || select
                .split(',')
                .any(|c| c.trim() == self.order_column)
        {
            Some(select.to_string())
        } else {
            Some(format!("{},{}", self.order_column, select))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub rows: Vec<Row>,
    /// False when retries ran out and `rows` is a prefix of the table.
    pub complete: bool,
    pub pages: usize,
    pub retries: usize,
    pub last_error: Option<String>,
}

/// Reads a whole table with keyset pagination. Retryable failures back off
/// per `backoff`; once a page exhausts its retries the rows gathered so far
/// are returned with `complete == false`. Non-retryable failures are errors.
pub async fn fetch_all(
    store: &dyn RemoteStore,
    request: &TableRequest,
    backoff: &BackoffPolicy,
) -> Result<FetchOutcome, StoreError> {
    let span = info_span!(
        "keyset_fetch",
        table = %request.table,
        order_column = %request.order_column
    );

    async move {
        let page_size = request.page_size.max(1);
        let select = request.effective_select();
        let mut cursor: Option<JsonValue> = None;
        let mut outcome = FetchOutcome::default();
        let mut attempt = 0usize;

        loop {
            let query = PageQuery {
                table: &request.table,
                select: select.as_deref(),
                order_column: &request.order_column,
                after: cursor.as_ref(),
                limit: page_size,
            };

            let result = store.fetch_page(&query).await;
            match result {
                Ok(page) => {
                    attempt = 0;
                    outcome.pages += 1;
                    let page_len = page.len();
                    if page_len == 0 {
                        outcome.complete = true;
                        break;
                    }

                    let last = page
                        .last()
                        .and_then(|row| row.get(&request.order_column))
                        .filter(|v| !v.is_null())
                        .cloned()
                        .ok_or_else(|| StoreError::Decode {
                            table: request.table.clone(),
                            message: format!("row without ordering column {}", request.order_column),
                        })?;
                    outcome.rows.extend(page);
                    cursor = Some(last);

                    if outcome.pages % 10 == 0 {
                        info!(rows = outcome.rows.len(), "loading");
                    }
                    if page_len < page_size {
                        outcome.complete = true;
                        break;
                    }
                }
                Err(err) if err.disposition() == RetryDisposition::Retryable => {
                    if attempt >= backoff.max_retries {
                        warn!(
                            after = %cursor.as_ref().map(cursor_param).unwrap_or_default(),
                            rows = outcome.rows.len(),
                            error = %err,
                            "retries exhausted; keeping partial result"
                        );
                        outcome.last_error = Some(err.to_string());
                        break;
                    }
                    let delay = backoff.delay_for_attempt(attempt);
                    attempt += 1;
                    outcome.retries += 1;
                    warn!(
                        attempt,
                        max_retries = backoff.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "page fetch failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            rows = outcome.rows.len(),
            pages = outcome.pages,
            complete = outcome.complete,
            "fetch finished"
        );
        Ok(outcome)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().expect("object row")
    }

    fn numbered(table_len: u64) -> Vec<Row> {
        (1..=table_len)
            .map(|id| row(json!({ "id": id, "name": format!("fund {id}") })))
            .collect()
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn default_backoff_waits_two_to_thirty_two_seconds() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..policy.max_retries)
            .map(|a| policy.delay_for_attempt(a).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let policy = BackoffPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(500));
        assert_eq!(BackoffPolicy::immediate(2).delay_for_attempt(4), Duration::ZERO);
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);

        let err = StoreError::HttpStatus {
            table: "t".into(),
            status: 404,
            body: String::new(),
        };
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
        assert_eq!(
            StoreError::Unavailable("down".into()).disposition(),
            RetryDisposition::Retryable
        );
    }

    #[test]
    fn explicit_selection_always_carries_ordering_column() {
        let req = TableRequest::new("advisers_enriched", "crd").with_select("adviser_name, type");
        assert_eq!(req.effective_select().as_deref(), Some("crd,adviser_name, type"));

        let req = TableRequest::new("advisers_enriched", "crd").with_select("crd,adviser_name");
        assert_eq!(req.effective_select().as_deref(), Some("crd,adviser_name"));

        assert_eq!(TableRequest::new("funds", "reference_id").effective_select(), None);
    }

    #[test]
    fn cursor_ordering_is_numeric_for_numbers() {
        assert_eq!(compare_cursor(&json!(9), &json!(10)), Ordering::Less);
        assert_eq!(compare_cursor(&json!("9"), &json!("10")), Ordering::Greater);
        assert_eq!(cursor_param(&json!("abc")), "abc");
        assert_eq!(cursor_param(&json!(12)), "12");
    }

    #[test]
    fn content_range_total_is_parsed() {
        assert_eq!(parse_content_range_total("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-24/*"), None);
    }

    #[tokio::test]
    async fn keyset_fetch_reads_every_row_in_order() {
        let mut rows = numbered(5);
        rows.reverse();
        let store = MemoryStore::new().with_table("funds", rows);
        let req = TableRequest::new("funds", "id").with_page_size(2);

        let outcome = fetch_all(&store, &req, &BackoffPolicy::immediate(5))
            .await
            .expect("fetch");

        let ids: Vec<u64> = outcome.rows.iter().map(|r| r["id"].as_u64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(outcome.complete);
        assert_eq!(outcome.pages, 3);
    }

    #[tokio::test]
    async fn keyset_fetch_stops_on_empty_page_when_table_is_a_page_multiple() {
        let store = MemoryStore::new().with_table("funds", numbered(4));
        let req = TableRequest::new("funds", "id").with_page_size(2);

        let outcome = fetch_all(&store, &req, &BackoffPolicy::immediate(5))
            .await
            .expect("fetch");

        assert_eq!(outcome.rows.len(), 4);
        assert_eq!(outcome.pages, 3);
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = MemoryStore::new().with_table("funds", numbered(3));
        store.inject_failures(1, 2).await;
        let req = TableRequest::new("funds", "id").with_page_size(2);

        let outcome = fetch_all(&store, &req, &BackoffPolicy::immediate(5))
            .await
            .expect("fetch");

        assert_eq!(outcome.rows.len(), 3);
        assert_eq!(outcome.retries, 2);
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn exhausted_retries_return_partial_rows() {
        let store = MemoryStore::new().with_table("funds", numbered(6));
        store.inject_failures(1, 100).await;
        let req = TableRequest::new("funds", "id").with_page_size(2);

        let outcome = fetch_all(&store, &req, &BackoffPolicy::immediate(5))
            .await
            .expect("partial fetch is not an error");

        assert_eq!(outcome.rows.len(), 2);
        assert!(!outcome.complete);
        assert_eq!(outcome.retries, 5);
        assert!(outcome.last_error.is_some());
        assert_eq!(store.calls().await, 1 + 6);
    }

    #[tokio::test]
    async fn ordering_column_drives_selection_and_paging() {
        let store = MemoryStore::new().with_table("funds", numbered(2));
        let req = TableRequest::new("funds", "id").with_select("name");
        let result = fetch_all(&store, &req, &BackoffPolicy::immediate(0)).await;
        assert!(result.is_ok(), "ordering column is added to the selection");

        let req = TableRequest::new("funds", "reference_id");
        let outcome = fetch_all(&store, &req, &BackoffPolicy::immediate(0))
            .await
            .expect("rows without the column are not paged");
        assert!(outcome.rows.is_empty());
    }

    #[tokio::test]
    async fn memory_store_assigns_ids_and_deletes_ranges() {
        let store = MemoryStore::new();
        store
            .insert_rows("out", &[row(json!({"v": 1})), row(json!({"v": 2})), row(json!({"v": 3}))])
            .await
            .expect("insert");
        store
            .delete_range("out", "id", &json!(1), &json!(2))
            .await
            .expect("delete");

        let rows = store.rows("out").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(3));
        assert_eq!(store.count_rows("out").await.expect("count"), 1);
    }

    fn postgrest() -> PostgrestStore {
        PostgrestStore::new(StoreConfig {
            base_url: "https://db.example/".to_string(),
            api_key: "secret".to_string(),
            timeout: Duration::from_secs(5),
            user_agent: None,
        })
        .expect("client")
    }

    fn query_pairs(request: &reqwest::Request) -> Vec<(String, String)> {
        request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn page_requests_filter_above_the_cursor_without_offset() {
        let store = postgrest();
        let first = PageQuery {
            table: "funds_enriched",
            select: Some("reference_id,fund_name"),
            order_column: "reference_id",
            after: None,
            limit: 1000,
        };
        let request = store.page_request(&first).build().expect("request");
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/rest/v1/funds_enriched");
        assert_eq!(
            query_pairs(&request),
            vec![
                ("select".to_string(), "reference_id,fund_name".to_string()),
                ("order".to_string(), "reference_id.asc".to_string()),
                ("limit".to_string(), "1000".to_string()),
            ]
        );

        let cursor = json!(1000);
        let next = PageQuery {
            after: Some(&cursor),
            ..first
        };
        let pairs = query_pairs(&store.page_request(&next).build().expect("request"));
        assert!(pairs.contains(&("reference_id".to_string(), "gt.1000".to_string())));
        assert!(pairs.iter().all(|(k, _)| k != "offset"));
    }

    #[test]
    fn delete_and_count_requests_use_range_filters_and_exact_count() {
        let store = postgrest();

        let delete = store
            .delete_range_request("cross_reference_matches", "id", &json!(7), &json!(42))
            .build()
            .expect("request");
        assert_eq!(delete.method(), reqwest::Method::DELETE);
        assert_eq!(
            query_pairs(&delete),
            vec![
                ("id".to_string(), "gte.7".to_string()),
                ("id".to_string(), "lte.42".to_string()),
            ]
        );
        assert_eq!(delete.headers()["Prefer"], "return=minimal");

        let count = store
            .count_request("cross_reference_matches")
            .build()
            .expect("request");
        assert_eq!(count.method(), reqwest::Method::HEAD);
        assert_eq!(count.headers()["Prefer"], "count=exact");
    }
}
