//! Reporting API adapters and the paginated, retrying day fetcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use pulse_core::{RawAnalyticsRow, DIMENSIONS};
use pulse_storage::{
    classify_reqwest_error, classify_status, AuthError, BackoffPolicy, RetryDisposition, Sleeper,
    TokenProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "pulse-adapters";

/// Largest page the reporting API serves.
pub const DEFAULT_ROW_LIMIT: usize = 25_000;
pub const SEARCH_TYPE_WEB: &str = "web";
pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com";

/// Body of one "query analytics" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsQuery {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub dimensions: Vec<String>,
    pub row_limit: usize,
    pub start_row: usize,
    #[serde(rename = "type")]
    pub search_type: String,
}

impl AnalyticsQuery {
    pub fn for_day(date: NaiveDate, row_limit: usize, start_row: usize) -> Self {
        Self {
            start_date: date,
            end_date: date,
            dimensions: DIMENSIONS.iter().map(|d| d.to_string()).collect(),
            row_limit,
            start_row,
            search_type: SEARCH_TYPE_WEB.to_string(),
        }
    }
}

/// Failure of a single API call. Unclassified failures are retryable.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    pub disposition: RetryDisposition,
    pub message: String,
}

impl ApiError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            disposition: RetryDisposition::Retryable,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            disposition: RetryDisposition::NonRetryable,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition == RetryDisposition::Retryable
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let disposition = match &err {
            AuthError::Http(_) => RetryDisposition::Retryable,
            AuthError::Rejected { status, .. } => reqwest::StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Retryable),
            AuthError::Sign(_) => RetryDisposition::NonRetryable,
        };
        Self {
            disposition,
            message: format!("authorization failed: {err}"),
        }
    }
}

/// Capability: "query one window of analytics for a site property".
#[async_trait]
pub trait AnalyticsApi: Send + Sync {
    async fn query(
        &self,
        site_property: &str,
        query: &AnalyticsQuery,
    ) -> Result<Vec<RawAnalyticsRow>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    rows: Vec<RawAnalyticsRow>,
}

/// Search Console `searchAnalytics.query` over REST.
pub struct SearchConsoleClient {
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    base_url: String,
}

impl SearchConsoleClient {
    pub fn new(client: reqwest::Client, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_base_url(client, tokens, DEFAULT_API_BASE_URL)
    }

    pub fn with_base_url(
        client: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            tokens,
            base_url: base_url.into(),
        }
    }

    pub fn endpoint(&self, site_property: &str) -> String {
        let site: String = url::form_urlencoded::byte_serialize(site_property.as_bytes()).collect();
        format!(
            "{}/webmasters/v3/sites/{site}/searchAnalytics/query",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl AnalyticsApi for SearchConsoleClient {
    async fn query(
        &self,
        site_property: &str,
        query: &AnalyticsQuery,
    ) -> Result<Vec<RawAnalyticsRow>, ApiError> {
        let token = self.tokens.access_token().await?;
        let resp = self
            .client
            .post(self.endpoint(site_property))
            .bearer_auth(token)
            .json(query)
            .send()
            .await
            .map_err(|err| ApiError {
                disposition: classify_reqwest_error(&err),
                message: format!("search analytics request failed: {err}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError {
                disposition: classify_status(status),
                message: format!("search analytics returned {status}: {body}"),
            });
        }

        let payload: QueryResponse = resp
            .json()
            .await
            .map_err(|err| ApiError::retryable(format!("decoding search analytics response: {err}")))?;
        Ok(payload.rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetcherConfig {
    pub row_limit: usize,
    pub backoff: BackoffPolicy,
    /// Deadline for one page request; expiry counts as a failed attempt.
    pub request_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            row_limit: DEFAULT_ROW_LIMIT,
            backoff: BackoffPolicy::default(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch for {date} failed at start row {start_row}: exhausted {attempts} of {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        date: NaiveDate,
        start_row: usize,
        attempts: u32,
        #[source]
        last_error: ApiError,
    },
    #[error("fetch for {date} was rejected at start row {start_row}: {source}")]
    Rejected {
        date: NaiveDate,
        start_row: usize,
        source: ApiError,
    },
}

impl FetchError {
    pub fn date(&self) -> NaiveDate {
        match self {
            FetchError::AttemptsExhausted { date, .. } | FetchError::Rejected { date, .. } => *date,
        }
    }
}

/// Pulls every row of one day, page by page, retrying each page on its own budget.
pub struct PaginatedFetcher {
    api: Arc<dyn AnalyticsApi>,
    sleeper: Arc<dyn Sleeper>,
    config: FetcherConfig,
}

impl PaginatedFetcher {
    pub fn new(api: Arc<dyn AnalyticsApi>, sleeper: Arc<dyn Sleeper>, config: FetcherConfig) -> Self {
        Self {
            api,
            sleeper,
            config,
        }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// All rows for `date`, concatenated in request order. A full page means more may follow;
    /// a short or empty page ends the day.
    pub async fn fetch(
        &self,
        site_property: &str,
        date: NaiveDate,
    ) -> Result<Vec<RawAnalyticsRow>, FetchError> {
        let row_limit = self.config.row_limit.max(1);
        let mut rows = Vec::new();
        let mut start_row = 0usize;

        loop {
            let span = info_span!("fetch_page", site_property, %date, start_row);
            let page = self
                .fetch_page(site_property, date, start_row, row_limit)
                .instrument(span)
                .await?;
            let page_len = page.len();
            rows.extend(page);
            start_row += page_len;
            debug!(%date, page_len, total = rows.len(), "fetched page");

            if page_len < row_limit {
                break;
            }
        }

        Ok(rows)
    }

    async fn fetch_page(
        &self,
        site_property: &str,
        date: NaiveDate,
        start_row: usize,
        row_limit: usize,
    ) -> Result<Vec<RawAnalyticsRow>, FetchError> {
        let query = AnalyticsQuery::for_day(date, row_limit, start_row);
        let backoff = self.config.backoff;
        let mut failures = 0u32;

        loop {
            let outcome = match tokio::time::timeout(
                self.config.request_timeout,
                self.api.query(site_property, &query),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ApiError::retryable(format!(
                    "request timed out after {:?}",
                    self.config.request_timeout
                ))),
            };

            let err = match outcome {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(FetchError::Rejected {
                    date,
                    start_row,
                    source: err,
                });
            }

            failures += 1;
            if backoff.is_exhausted(failures) {
                return Err(FetchError::AttemptsExhausted {
                    date,
                    start_row,
                    attempts: failures,
                    last_error: err,
                });
            }

            let delay = backoff.jittered_delay(failures, &mut rand::thread_rng());
            warn!(attempt = failures, delay_ms = delay.as_millis() as u64, error = %err, "page request failed; backing off");
            self.sleeper.sleep(delay).await;
        }
    }
}
