//! Document persistence, credentials and retry utilities for Search Pulse.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use pulse_core::NormalizedRecord;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pulse-storage";

/// Per-batch write cap shared by every backend.
pub const MAX_BATCH_SIZE: usize = 500;

pub const WEBMASTERS_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/webmasters.readonly";
pub const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;
const INGESTED_AT_FIELD: &str = "ingestedAt";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

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
    if err.is_builder() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

/// Exponential backoff with additive jitter.
///
/// `attempt` counts the consecutive failures of one request; the wait before the next try is
/// `2^attempt * base_delay` plus a jitter drawn from `[0, jitter_ceiling)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter_ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            jitter_ceiling: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn jittered_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = u64::try_from(self.jitter_ceiling.as_millis()).unwrap_or(u64::MAX);
        let jitter = if ceiling == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..ceiling))
        };
        self.delay_for_attempt(attempt).saturating_add(jitter)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts.max(1)
    }
}

/// Suspension point used between retries; swapped out in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: std::sync::Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.delays().into_iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: Some(format!("search-pulse/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("credentials variable {0} is not set")]
    Missing(String),
    #[error("credentials are not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("credentials are not a valid service account key: {0}")]
    Json(#[from] serde_json::Error),
    #[error("service account key is missing {0}")]
    Incomplete(&'static str),
    #[error("service account private key is unusable: {0}")]
    Key(#[from] jsonwebtoken::errors::Error),
}

/// Service-account key as downloaded from the cloud console.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("project_id", &self.project_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub fn from_env(var: &str) -> Result<Self, CredentialsError> {
        let encoded = std::env::var(var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| CredentialsError::Missing(var.to_string()))?;
        Self::from_base64(&encoded)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CredentialsError> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = base64::engine::general_purpose::STANDARD.decode(compact)?;
        let key: Self = serde_json::from_slice(&bytes)?;
        if key.client_email.trim().is_empty() {
            return Err(CredentialsError::Incomplete("client_email"));
        }
        if key.private_key.trim().is_empty() {
            return Err(CredentialsError::Incomplete("private_key"));
        }
        Ok(key)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("signing token assertion: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, AuthError>;
}

/// Fixed bearer token, for local emulators and tests.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    TOKEN_LIFETIME_SECS
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// OAuth2 JWT-bearer exchange for a service account, cached until shortly before expiry.
pub struct ServiceAccountTokenProvider {
    client: reqwest::Client,
    client_email: String,
    token_uri: String,
    scope: String,
    encoding_key: EncodingKey,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokenProvider {
    pub fn new(
        client: reqwest::Client,
        key: &ServiceAccountKey,
        scopes: &[&str],
    ) -> Result<Self, CredentialsError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
        Ok(Self {
            client,
            client_email: key.client_email.clone(),
            token_uri: key.token_uri.clone(),
            scope: scopes.join(" "),
            encoding_key,
            cached: Mutex::new(None),
        })
    }

    fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, AuthError> {
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: &self.scope,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + TOKEN_LIFETIME_SECS,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.encoding_key,
        )?)
    }

    async fn exchange(&self) -> Result<CachedToken, AuthError> {
        let now = Utc::now();
        let assertion = self.signed_assertion(now)?;
        let resp = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = resp.json().await?;
        Ok(CachedToken {
            value: token.access_token,
            expires_at: now + TimeDelta::seconds(token.expires_in),
        })
    }
}

#[async_trait]
impl TokenProvider for ServiceAccountTokenProvider {
    async fn access_token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at - TimeDelta::seconds(TOKEN_REFRESH_MARGIN_SECS) > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.exchange().await?;
        debug!(client_email = %self.client_email, expires_at = %fresh.expires_at, "refreshed access token");
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Document stores
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("store authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("encoding document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("batch of {size} documents exceeds the store limit of {max}")]
    BatchTooLarge { size: usize, max: usize },
}

/// Write-once document store with atomic batched creation.
///
/// Implementations assign document ids themselves and stamp `ingestedAt` at commit time.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend(&self) -> &'static str;

    fn max_batch_size(&self) -> usize {
        MAX_BATCH_SIZE
    }

    async fn commit_batch(
        &self,
        collection_path: &str,
        records: &[NormalizedRecord],
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    pub id: String,
    pub ingested_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: NormalizedRecord,
}

/// Process-local store for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<BTreeMap<String, Vec<StoredDocument>>>,
    commits: Mutex<Vec<usize>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn documents(&self, collection_path: &str) -> Vec<StoredDocument> {
        self.collections
            .lock()
            .await
            .get(collection_path)
            .cloned()
            .unwrap_or_default()
    }

    /// Sizes of every committed batch, in commit order.
    pub async fn commit_sizes(&self) -> Vec<usize> {
        self.commits.lock().await.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn commit_batch(
        &self,
        collection_path: &str,
        records: &[NormalizedRecord],
    ) -> Result<(), StoreError> {
        if records.len() > self.max_batch_size() {
            return Err(StoreError::BatchTooLarge {
                size: records.len(),
                max: self.max_batch_size(),
            });
        }
        let ingested_at = Utc::now();
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(collection_path.to_string()).or_default();
        docs.extend(records.iter().map(|record| StoredDocument {
            id: Uuid::new_v4().to_string(),
            ingested_at,
            record: record.clone(),
        }));
        self.commits.lock().await.push(records.len());
        Ok(())
    }
}

/// Postgres-backed store keeping each record as a JSONB document.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("applying analytics_documents migrations")
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn commit_batch(
        &self,
        collection_path: &str,
        records: &[NormalizedRecord],
    ) -> Result<(), StoreError> {
        let documents = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<JsonValue>, _>>()?;

        sqlx::query(
            r#"
            INSERT INTO analytics_documents (collection_path, document)
            SELECT $1, doc FROM UNNEST($2::jsonb[]) AS doc
            "#,
        )
        .bind(collection_path)
        .bind(documents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub database_id: String,
    pub base_url: String,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: "(default)".to_string(),
            base_url: "https://firestore.googleapis.com".to_string(),
        }
    }

    fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.project_id, self.database_id
        )
    }
}

/// Firestore REST backend; one `documents:commit` call per batch.
pub struct FirestoreDocumentStore {
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    config: FirestoreConfig,
}

impl FirestoreDocumentStore {
    pub fn new(client: reqwest::Client, tokens: Arc<dyn TokenProvider>, config: FirestoreConfig) -> Self {
        Self {
            client,
            tokens,
            config,
        }
    }

    fn commit_url(&self) -> String {
        format!(
            "{}/v1/{}:commit",
            self.config.base_url.trim_end_matches('/'),
            self.config.documents_root()
        )
    }

    fn commit_body(&self, collection_path: &str, records: &[NormalizedRecord]) -> JsonValue {
        let root = self.config.documents_root();
        let collection = collection_path.trim_matches('/');
        let writes = records
            .iter()
            .map(|record| {
                json!({
                    "update": {
                        "name": format!("{root}/{collection}/{}", auto_document_id()),
                        "fields": firestore_fields(record),
                    },
                    "updateTransforms": [
                        { "fieldPath": INGESTED_AT_FIELD, "setToServerValue": "REQUEST_TIME" }
                    ],
                    "currentDocument": { "exists": false },
                })
            })
            .collect::<Vec<_>>();
        json!({ "writes": writes })
    }
}

#[async_trait]
impl DocumentStore for FirestoreDocumentStore {
    fn backend(&self) -> &'static str {
        "firestore"
    }

    async fn commit_batch(
        &self,
        collection_path: &str,
        records: &[NormalizedRecord],
    ) -> Result<(), StoreError> {
        if records.len() > self.max_batch_size() {
            return Err(StoreError::BatchTooLarge {
                size: records.len(),
                max: self.max_batch_size(),
            });
        }
        let token = self.tokens.access_token().await?;
        let resp = self
            .client
            .post(self.commit_url())
            .bearer_auth(token)
            .json(&self.commit_body(collection_path, records))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Firestore typed-value encoding of a record.
pub fn firestore_fields(record: &NormalizedRecord) -> JsonValue {
    json!({
        "siteProperty": { "stringValue": record.site_property },
        "normalizedUrl": { "stringValue": record.normalized_url },
        "query": { "stringValue": record.query },
        "date": { "stringValue": record.date.format("%Y-%m-%d").to_string() },
        "impressions": { "doubleValue": record.impressions },
        "clicks": { "doubleValue": record.clicks },
        "position": { "doubleValue": record.position },
        "ctr": { "doubleValue": record.ctr },
        "device": { "stringValue": record.device },
        "country": { "stringValue": record.country },
        "searchAppearance": { "stringValue": record.search_appearance },
    })
}

fn auto_document_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

// ---------------------------------------------------------------------------
// Batch persistence
// ---------------------------------------------------------------------------

/// Writes records in ordered, fixed-size atomic batches.
#[derive(Clone)]
pub struct BatchPersister {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
}

impl BatchPersister {
    pub fn new(store: Arc<dyn DocumentStore>, batch_size: usize) -> Self {
        let batch_size = batch_size.clamp(1, store.max_batch_size().max(1));
        Self { store, batch_size }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Commit `records` batch by batch. The first failing commit stops the run and its error is
    /// returned as the store produced it; later batches are never attempted.
    pub async fn persist(
        &self,
        collection_path: &str,
        records: &[NormalizedRecord],
    ) -> Result<usize, StoreError> {
        let mut written = 0usize;
        for (index, chunk) in records.chunks(self.batch_size).enumerate() {
            let span = info_span!("commit_batch", backend = self.store.backend(), collection_path, batch = index);
            if let Err(err) = self
                .store
                .commit_batch(collection_path, chunk)
                .instrument(span)
                .await
            {
                warn!(batch = index, written, error = %err, "batch commit failed; aborting remaining batches");
                return Err(err);
            }
            written += chunk.len();
            debug!(batch = index, size = chunk.len(), written, "committed batch");
        }
        Ok(written)
    }
}
