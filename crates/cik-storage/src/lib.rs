//! Reference-record persistence + HTTP fetch utilities for the CIK sync.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cik_core::{ExternalId, PersistedRecord, RunMetadata};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "cik-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
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

/// Exponential backoff between attempts. `max_retries == 0` means a single attempt.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
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

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

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

    /// GET `url` and read the whole body. Non-2xx responses are errors.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched body");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(status = status.as_u16(), attempt, "retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(HttpError::Status {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(sqlx::Error),
    #[error("write rejected for {external_id}: {reason}")]
    Rejected {
        external_id: ExternalId,
        reason: String,
    },
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => PersistenceError::Unavailable(err.to_string()),
            other => PersistenceError::Query(other),
        }
    }
}

/// Read/write interface the reconciler drives. Each call is an independent, atomic write.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn ping(&self) -> Result<(), PersistenceError>;

    async fn find_by_id(
        &self,
        external_id: ExternalId,
    ) -> Result<Option<PersistedRecord>, PersistenceError>;

    async fn save(&self, record: &PersistedRecord) -> Result<(), PersistenceError>;

    async fn upsert_run_metadata(
        &self,
        process_name: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn run_metadata(&self, process_name: &str)
        -> Result<Option<RunMetadata>, PersistenceError>;
}

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn ping(&self) -> Result<(), PersistenceError> {
        sqlx::query("select 1")
            .execute(&self.pool)
            .await
            .map_err(|err| PersistenceError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn find_by_id(
        &self,
        external_id: ExternalId,
    ) -> Result<Option<PersistedRecord>, PersistenceError> {
        let row = sqlx::query(
            r#"
            select cik, ticker, title, updated_at
              from stock_cik
             where cik = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<PersistedRecord, PersistenceError> {
            Ok(PersistedRecord {
                external_id: row.try_get("cik")?,
                ticker: row.try_get("ticker")?,
                title: row.try_get("title")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn save(&self, record: &PersistedRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            insert into stock_cik (cik, ticker, title, updated_at)
            values ($1, $2, $3, $4)
            on conflict (cik) do update
               set ticker = excluded.ticker,
                   title = excluded.title,
                   updated_at = excluded.updated_at
            "#,
        )
        .bind(record.external_id)
        .bind(&record.ticker)
        .bind(&record.title)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) => PersistenceError::Rejected {
                external_id: record.external_id,
                reason: db.message().to_string(),
            },
            other => other.into(),
        })?;
        Ok(())
    }

    async fn upsert_run_metadata(
        &self,
        process_name: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            insert into process_runs (process_name, last_executed_at)
            values ($1, $2)
            on conflict (process_name) do update
               set last_executed_at = excluded.last_executed_at
            "#,
        )
        .bind(process_name)
        .bind(executed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn run_metadata(
        &self,
        process_name: &str,
    ) -> Result<Option<RunMetadata>, PersistenceError> {
        let row = sqlx::query(
            r#"
            select process_name, last_executed_at
              from process_runs
             where process_name = $1
            "#,
        )
        .bind(process_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<RunMetadata, PersistenceError> {
            Ok(RunMetadata {
                process_name: row.try_get("process_name")?,
                last_executed_at: row.try_get("last_executed_at")?,
            })
        })
        .transpose()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<ExternalId, PersistedRecord>,
    runs: BTreeMap<String, DateTime<Utc>>,
    failing_ids: HashSet<ExternalId>,
    unavailable: bool,
    fail_run_metadata: bool,
    save_calls: usize,
}

/// In-process store with injectable failures; backs tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = PersistedRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.external_id, r))
            .collect::<BTreeMap<_, _>>();
        Self {
            state: Mutex::new(MemoryState {
                records,
                ..Default::default()
            }),
        }
    }

    /// Make every `save` for `external_id` fail with `PersistenceError::Rejected`.
    pub async fn fail_saves_for(&self, external_id: ExternalId) {
        self.state.lock().await.failing_ids.insert(external_id);
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Fail only `upsert_run_metadata`; record reads and writes keep working.
    pub async fn fail_run_metadata(&self, fail: bool) {
        self.state.lock().await.fail_run_metadata = fail;
    }

    pub async fn get(&self, external_id: ExternalId) -> Option<PersistedRecord> {
        self.state.lock().await.records.get(&external_id).cloned()
    }

    pub async fn records(&self) -> BTreeMap<ExternalId, PersistedRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn save_calls(&self) -> usize {
        self.state.lock().await.save_calls
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn ping(&self) -> Result<(), PersistenceError> {
        if self.state.lock().await.unavailable {
            return Err(PersistenceError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    async fn find_by_id(
        &self,
        external_id: ExternalId,
    ) -> Result<Option<PersistedRecord>, PersistenceError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(PersistenceError::Unavailable("memory store offline".into()));
        }
        Ok(state.records.get(&external_id).cloned())
    }

    async fn save(&self, record: &PersistedRecord) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.save_calls += 1;
        if state.unavailable {
            return Err(PersistenceError::Unavailable("memory store offline".into()));
        }
        if state.failing_ids.contains(&record.external_id) {
            return Err(PersistenceError::Rejected {
                external_id: record.external_id,
                reason: "injected failure".into(),
            });
        }
        state.records.insert(record.external_id, record.clone());
        Ok(())
    }

    async fn upsert_run_metadata(
        &self,
        process_name: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(PersistenceError::Unavailable("memory store offline".into()));
        }
        if state.fail_run_metadata {
            return Err(PersistenceError::Unavailable(
                "run metadata write failed".into(),
            ));
        }
        state.runs.insert(process_name.to_string(), executed_at);
        Ok(())
    }

    async fn run_metadata(
        &self,
        process_name: &str,
    ) -> Result<Option<RunMetadata>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state.runs.get(process_name).map(|at| RunMetadata {
            process_name: process_name.to_string(),
            last_executed_at: *at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn record(id: ExternalId, ticker: &str, title: &str) -> PersistedRecord {
        PersistedRecord {
            external_id: id,
            ticker: ticker.into(),
            title: title.into(),
            updated_at: None,
        }
    }

    #[test]
    fn body_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
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
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn fetch_sends_user_agent_and_reads_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/files/company_tickers.json")
                    .header("user-agent", "cik-test/1.0");
                then.status(200)
                    .header("content-type", "application/json")
                    .body("{}");
            })
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("cik-test/1.0".into()),
            ..Default::default()
        })
        .unwrap();
        let resp = fetcher
            .fetch_bytes(&server.url("/files/company_tickers.json"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"{}");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error_without_retries_by_default() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/down");
                then.status(503);
            })
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher.fetch_bytes(&server.url("/down")).await.unwrap_err();

        mock.assert_hits_async(1).await;
        assert!(matches!(err, HttpError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn retryable_status_is_retried_when_configured() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/flaky");
                then.status(502);
            })
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .unwrap();
        let err = fetcher.fetch_bytes(&server.url("/flaky")).await.unwrap_err();

        mock.assert_hits_async(3).await;
        assert!(matches!(err, HttpError::Status { status: 502, .. }));
    }

    #[tokio::test]
    async fn slow_response_is_bounded_by_client_timeout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slow");
                then.status(200).delay(Duration::from_secs(2)).body("{}");
            })
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .unwrap();
        let err = fetcher.fetch_bytes(&server.url("/slow")).await.unwrap_err();

        match err {
            HttpError::Request(inner) => assert!(inner.is_timeout()),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn memory_store_round_trips_records_and_run_metadata() {
        let store = MemoryRecordStore::new();
        assert!(store.find_by_id(1).await.unwrap().is_none());

        store.save(&record(1, "ABC", "Alpha Inc")).await.unwrap();
        let found = store.find_by_id(1).await.unwrap().unwrap();
        assert_eq!(found.ticker, "ABC");

        let at = Utc::now();
        store.upsert_run_metadata("JOB", at).await.unwrap();
        store.upsert_run_metadata("JOB", at).await.unwrap();
        let meta = store.run_metadata("JOB").await.unwrap().unwrap();
        assert_eq!(meta.last_executed_at, at);
        assert!(store.run_metadata("OTHER").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_injected_failures() {
        let store = MemoryRecordStore::with_records([record(1, "ABC", "Alpha Inc")]);
        store.fail_saves_for(2).await;

        let err = store.save(&record(2, "XYZ", "Xyz Corp")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Rejected { external_id: 2, .. }));
        assert!(store.get(2).await.is_none());
        assert_eq!(store.save_calls().await, 1);

        store.set_unavailable(true).await;
        assert!(matches!(
            store.ping().await,
            Err(PersistenceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_can_fail_only_run_metadata() {
        let store = MemoryRecordStore::new();
        store.fail_run_metadata(true).await;

        store.ping().await.unwrap();
        store.save(&record(1, "ABC", "Alpha Inc")).await.unwrap();
        assert!(store.find_by_id(1).await.unwrap().is_some());

        let err = store.upsert_run_metadata("JOB", Utc::now()).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Unavailable(_)));
        assert!(store.run_metadata("JOB").await.unwrap().is_none());

        store.fail_run_metadata(false).await;
        store.upsert_run_metadata("JOB", Utc::now()).await.unwrap();
        assert!(store.run_metadata("JOB").await.unwrap().is_some());
    }
}
