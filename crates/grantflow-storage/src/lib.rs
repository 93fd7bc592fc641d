//! External collaborators for grantflow: raw-payload archive, retrying HTTP
//! fetcher, key-value store, work queue and their Postgres backings.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grantflow_core::{AttemptStatus, FetchAttempt, RawPayload};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod kv;
mod postgres;
mod queue;

pub use kv::{DeadLetterStore, FieldMap, MemoryStore, OpportunityStore, StoreError, WatermarkStore};
pub use postgres::{PgQueue, PgStore, MIGRATOR};
pub use queue::{Delivery, MemoryQueue, QueueError, WorkQueue};

pub const CRATE_NAME: &str = "grantflow-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub key: String,
    pub content_hash: String,
    pub byte_size: usize,
    /// The key already existed; the existing object was left untouched.
    pub deduplicated: bool,
}

/// Write-once archive for raw upstream payloads.
#[async_trait]
pub trait BlobArchive: Send + Sync {
    async fn put(&self, payload: &RawPayload) -> anyhow::Result<StoredBlob>;
}

/// `{id}/{fetched_at}`; one object per fetch.
pub fn blob_key(id: &str, fetched_at: DateTime<Utc>) -> String {
    let safe_id: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe_id = safe_id.trim_start_matches('.');
    let safe_id = if safe_id.is_empty() { "_" } else { safe_id };
    format!("{}/{}", safe_id, fetched_at.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// Filesystem archive rooted at a directory; objects land at `{root}/{key}.json`.
#[derive(Debug, Clone)]
pub struct FsBlobArchive {
    root: PathBuf,
}

impl FsBlobArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for_key(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

#[async_trait]
impl BlobArchive for FsBlobArchive {
    /// Atomic temp-file rename; an existing object is never overwritten.
    async fn put(&self, payload: &RawPayload) -> anyhow::Result<StoredBlob> {
        let key = blob_key(&payload.id, payload.fetched_at);
        let absolute_path = self.path_for_key(&key);
        let stored = |deduplicated| StoredBlob {
            key: key.clone(),
            content_hash: payload.content_hash.clone(),
            byte_size: payload.bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), payload.bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(&payload.bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        // rename(2) replaces silently on unix, so re-check right before moving into place.
        if fs::try_exists(&absolute_path).await.unwrap_or(false) {
            let _ = fs::remove_file(&temp_path).await;
            return Ok(stored(true));
        }

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Delay(Duration),
    /// Retry budget used up; the unit of work has failed.
    Exhausted,
}

#[derive(Debug, Error, PartialEq)]
pub enum BackoffPolicyError {
    #[error("initial_delay must be > 0")]
    InitialDelay,
    #[error("multiplier must be > 1 (got {0})")]
    Multiplier(f64),
    #[error("max_attempts must be > 0")]
    MaxAttempts,
    #[error("jitter_fraction must be in [0, 1) (got {0})")]
    Jitter(f64),
    #[error("max_delay must be >= initial_delay")]
    MaxDelay,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    /// Number of delays handed out before the policy reports `Exhausted`.
    pub max_attempts: u32,
    pub jitter_fraction: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts: 5,
            jitter_fraction: 0.25,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<(), BackoffPolicyError> {
        if self.initial_delay.is_zero() {
            return Err(BackoffPolicyError::InitialDelay);
        }
        if self.multiplier.is_nan() || self.multiplier <= 1.0 || self.multiplier.is_infinite() {
            return Err(BackoffPolicyError::Multiplier(self.multiplier));
        }
        if self.max_attempts == 0 {
            return Err(BackoffPolicyError::MaxAttempts);
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(BackoffPolicyError::Jitter(self.jitter_fraction));
        }
        if self.max_delay < self.initial_delay {
            return Err(BackoffPolicyError::MaxDelay);
        }
        Ok(())
    }

    /// `initial_delay * multiplier^attempt`, capped at `max_delay`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay before retry number `attempt` (zero-based). Jitter only ever adds.
    pub fn next_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Backoff {
        if attempt >= self.max_attempts {
            return Backoff::Exhausted;
        }
        let base = self.base_delay(attempt);
        if self.jitter_fraction <= 0.0 {
            return Backoff::Delay(base);
        }
        let spread = base.as_secs_f64() * self.jitter_fraction;
        let offset = rng.gen_range(0.0..=spread);
        Backoff::Delay(base + Duration::from_secs_f64(offset))
    }
}

// ---------------------------------------------------------------------------
// Response classification

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    RateLimited,
    Transient,
    Permanent,
}

/// grants.gov throttles with 403 rather than 429, so 403 is a rate limit
/// unless `forbidden_is_rate_limit` is switched off.
pub fn classify_status(status: StatusCode, forbidden_is_rate_limit: bool) -> ResponseClass {
    if status == StatusCode::OK {
        ResponseClass::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && forbidden_is_rate_limit)
    {
        ResponseClass::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ResponseClass::Transient
    } else {
        ResponseClass::Permanent
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ResponseClass {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ResponseClass::Transient
    } else {
        ResponseClass::Permanent
    }
}

// ---------------------------------------------------------------------------
// HTTP fetcher

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
    pub forbidden_is_rate_limit: bool,
    /// Fixed jitter seed; `None` seeds from OS entropy.
    pub jitter_seed: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            api_key: None,
            api_key_header: "X-Api-Key".to_string(),
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
            forbidden_is_rate_limit: true,
            jitter_seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Client-side throttle so bursts of detail fetches stay under upstream limits.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis().max(1)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 || self.refill_every.is_zero() {
                state.tokens = state.tokens.saturating_sub(1);
                return;
            }

            let wait = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Short label used in logs and attempt history, e.g. `detail:350112`.
    pub target: String,
    pub url: String,
    pub query: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(target: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            url: url.into(),
            query: Vec::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
    pub json: JsonValue,
    pub fetched_at: DateTime<Utc>,
    pub attempts: Vec<FetchAttempt>,
}

impl FetchOutcome {
    pub fn rate_limited_retries(&self) -> usize {
        self.attempts.iter().filter(|a| a.status.is_rate_limited()).count()
    }

    pub fn transient_retries(&self) -> usize {
        self.attempts.iter().filter(|a| a.status.is_transient()).count()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("permanent failure for {target} (status {status:?}): {reason}")]
    Permanent {
        target: String,
        status: Option<u16>,
        reason: String,
        attempts: Vec<FetchAttempt>,
    },
    #[error("retries exhausted for {target} after {count} attempts (last status {last_status:?})", count = .attempts.len())]
    Exhausted {
        target: String,
        last_status: Option<u16>,
        attempts: Vec<FetchAttempt>,
    },
    #[error("fetch of {target} cancelled after {count} attempts", count = .attempts.len())]
    Cancelled {
        target: String,
        attempts: Vec<FetchAttempt>,
    },
}

impl FetchError {
    pub fn attempts(&self) -> &[FetchAttempt] {
        match self {
            Self::Permanent { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Short machine-readable reason stored on dead letters.
    pub fn dead_letter_reason(&self) -> String {
        match self {
            Self::Permanent {
                status: Some(status),
                ..
            } => format!("permanent:{status}"),
            Self::Permanent { reason, .. } => format!("permanent:{reason}"),
            Self::Exhausted { attempts, .. } => format!("exhausted:{}", attempts.len()),
            Self::Cancelled { .. } => "cancelled".to_string(),
        }
    }
}

struct RawResponse {
    status: StatusCode,
    has_retry_after: bool,
    final_url: String,
    body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
    forbidden_is_rate_limit: bool,
    api_key: Option<(String, String)>,
    rng: StdMutex<StdRng>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        config.backoff.validate().context("validating fetch backoff policy")?;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));
        let rng = match config.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
            forbidden_is_rate_limit: config.forbidden_is_rate_limit,
            api_key: config.api_key.map(|key| (config.api_key_header, key)),
            rng: StdMutex::new(rng),
            shutdown: None,
        })
    }

    /// Retries stop at the next attempt boundary once the channel reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    fn next_delay(&self, retry_index: u32) -> Backoff {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.backoff.next_delay(retry_index, &mut *rng)
    }

    /// Sleeps for `delay`; returns `true` if shutdown was signalled meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        let Some(rx) = &self.shutdown else {
            tokio::time::sleep(delay).await;
            return false;
        };
        let mut rx = rx.clone();
        if *rx.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            Ok(_) = rx.wait_for(|stop| *stop) => true,
        }
    }

    async fn send_once(&self, request: &FetchRequest) -> Result<RawResponse, reqwest::Error> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        if let Some((header, key)) = &self.api_key {
            builder = builder.header(header.as_str(), key.as_str());
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let has_retry_after = resp.headers().contains_key(RETRY_AFTER);
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(RawResponse {
            status,
            has_retry_after,
            final_url,
            body,
        })
    }

    /// GET `request` and parse the body as JSON, retrying rate limits and
    /// transient failures under the configured backoff policy.
    pub async fn fetch_json(&self, request: &FetchRequest) -> Result<FetchOutcome, FetchError> {
        let span = info_span!("http_fetch", unit = %request.target, url = %request.url);
        self.fetch_json_inner(request).instrument(span).await
    }

    async fn fetch_json_inner(&self, request: &FetchRequest) -> Result<FetchOutcome, FetchError> {
        let target = request.target.clone();
        let mut attempts: Vec<FetchAttempt> = Vec::new();

        let _permit = match self.global_limit.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(FetchError::Cancelled { target, attempts }),
        };

        let mut retry_index = 0u32;
        loop {
            if self.is_cancelled() {
                return Err(FetchError::Cancelled { target, attempts });
            }
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let attempt_number = attempts.len() as u32 + 1;
            let started = Instant::now();
            let result = self.send_once(request).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let (class, status) = match result {
                Ok(resp) => {
                    let class = classify_status(resp.status, self.forbidden_is_rate_limit);
                    let code = resp.status.as_u16();
                    log_attempt(&target, attempt_number, Some(code), class, latency_ms);
                    match class {
                        ResponseClass::Success => {
                            return finish_success(target, attempts, attempt_number, latency_ms, resp);
                        }
                        ResponseClass::RateLimited => {
                            if resp.status == StatusCode::FORBIDDEN && !resp.has_retry_after {
                                warn!(
                                    unit = %target,
                                    attempt = attempt_number,
                                    "403 without Retry-After treated as rate limiting; check credentials if this persists"
                                );
                            }
                            (class, AttemptStatus::RateLimited { status: code })
                        }
                        ResponseClass::Transient => (
                            class,
                            AttemptStatus::Transient {
                                status: Some(code),
                                reason: format!("http {code}"),
                            },
                        ),
                        ResponseClass::Permanent => (
                            class,
                            AttemptStatus::Permanent {
                                status: Some(code),
                                reason: format!("http {code}"),
                            },
                        ),
                    }
                }
                Err(err) => {
                    let class = classify_reqwest_error(&err);
                    log_attempt(&target, attempt_number, None, class, latency_ms);
                    let reason = err.to_string();
                    let status = if class == ResponseClass::Transient {
                        AttemptStatus::Transient {
                            status: None,
                            reason,
                        }
                    } else {
                        AttemptStatus::Permanent {
                            status: None,
                            reason,
                        }
                    };
                    (class, status)
                }
            };

            if let AttemptStatus::Permanent { status: code, reason } = &status {
                let (code, reason) = (*code, reason.clone());
                attempts.push(FetchAttempt {
                    target: target.clone(),
                    attempt_number,
                    status,
                    latency_ms,
                    next_retry_at: None,
                    retry_delay_ms: None,
                });
                return Err(FetchError::Permanent {
                    target,
                    status: code,
                    reason,
                    attempts,
                });
            }

            debug_assert!(matches!(class, ResponseClass::RateLimited | ResponseClass::Transient));
            let last_status = status.http_status();
            match self.next_delay(retry_index) {
                Backoff::Exhausted => {
                    attempts.push(FetchAttempt {
                        target: target.clone(),
                        attempt_number,
                        status,
                        latency_ms,
                        next_retry_at: None,
                        retry_delay_ms: None,
                    });
                    warn!(unit = %target, attempts = attempts.len(), "retry budget exhausted");
                    return Err(FetchError::Exhausted {
                        target,
                        last_status,
                        attempts,
                    });
                }
                Backoff::Delay(delay) => {
                    let next_retry_at = chrono::Duration::from_std(delay)
                        .ok()
                        .map(|d| Utc::now() + d);
                    let retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    attempts.push(FetchAttempt {
                        target: target.clone(),
                        attempt_number,
                        status,
                        latency_ms,
                        next_retry_at,
                        retry_delay_ms: Some(retry_delay_ms),
                    });
                    retry_index += 1;
                    if self.pause(delay).await {
                        return Err(FetchError::Cancelled { target, attempts });
                    }
                }
            }
        }
    }
}

fn log_attempt(
    target: &str,
    attempt: u32,
    status: Option<u16>,
    class: ResponseClass,
    latency_ms: u64,
) {
    info!(
        unit = target,
        attempt,
        status = ?status,
        class = ?class,
        latency_ms,
        "upstream attempt"
    );
}

fn finish_success(
    target: String,
    mut attempts: Vec<FetchAttempt>,
    attempt_number: u32,
    latency_ms: u64,
    resp: RawResponse,
) -> Result<FetchOutcome, FetchError> {
    let code = resp.status.as_u16();
    match serde_json::from_slice::<JsonValue>(&resp.body) {
        Ok(json) => {
            attempts.push(FetchAttempt {
                target,
                attempt_number,
                status: AttemptStatus::Success { status: code },
                latency_ms,
                next_retry_at: None,
                retry_delay_ms: None,
            });
            Ok(FetchOutcome {
                status: code,
                final_url: resp.final_url,
                body: resp.body,
                json,
                fetched_at: Utc::now(),
                attempts,
            })
        }
        Err(err) => {
            let reason = format!("malformed body: {err}");
            attempts.push(FetchAttempt {
                target: target.clone(),
                attempt_number,
                status: AttemptStatus::Permanent {
                    status: Some(code),
                    reason: reason.clone(),
                },
                latency_ms,
                next_retry_at: None,
                retry_delay_ms: None,
            });
            Err(FetchError::Permanent {
                target,
                status: None,
                reason,
                attempts,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_attempts,
            jitter_fraction: 0.0,
            max_delay: Duration::from_secs(1),
        }
    }

    fn fetcher(max_attempts: u32) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: fast_policy(max_attempts),
            jitter_seed: Some(7),
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[test]
    fn backoff_is_monotonic_without_jitter_and_exhausts() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts: 6,
            jitter_fraction: 0.0,
            max_delay: Duration::from_millis(1_000),
        };
        let mut rng = StdRng::seed_from_u64(1);
        let mut previous = Duration::ZERO;
        for attempt in 0..6 {
            match policy.next_delay(attempt, &mut rng) {
                Backoff::Delay(delay) => {
                    assert!(delay >= previous, "attempt {attempt} went backwards");
                    previous = delay;
                }
                Backoff::Exhausted => panic!("attempt {attempt} should still have budget"),
            }
        }
        assert_eq!(policy.next_delay(0, &mut rng), Backoff::Delay(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2, &mut rng), Backoff::Delay(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(5, &mut rng), Backoff::Delay(Duration::from_millis(1_000)));
        assert_eq!(policy.next_delay(6, &mut rng), Backoff::Exhausted);
        assert_eq!(policy.next_delay(60, &mut rng), Backoff::Exhausted);
    }

    #[test]
    fn jitter_only_adds_and_is_seed_deterministic() {
        let policy = BackoffPolicy {
            jitter_fraction: 0.5,
            ..fast_policy(4)
        };
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for attempt in 0..4 {
            let base = policy.base_delay(attempt);
            let da = policy.next_delay(attempt, &mut a);
            let db = policy.next_delay(attempt, &mut b);
            assert_eq!(da, db);
            let Backoff::Delay(delay) = da else {
                panic!("expected delay")
            };
            assert!(delay >= base);
            assert!(delay <= base + base.mul_f64(0.5));
        }
    }

    #[test]
    fn huge_attempt_numbers_stay_capped() {
        let policy = BackoffPolicy {
            max_attempts: u32::MAX,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.base_delay(10_000), policy.max_delay);
    }

    #[test]
    fn policy_validation_rejects_out_of_range_parameters() {
        let ok = BackoffPolicy::default();
        assert!(ok.validate().is_ok());
        assert_eq!(
            BackoffPolicy { multiplier: 1.0, ..ok }.validate(),
            Err(BackoffPolicyError::Multiplier(1.0))
        );
        assert_eq!(
            BackoffPolicy { jitter_fraction: 1.0, ..ok }.validate(),
            Err(BackoffPolicyError::Jitter(1.0))
        );
        assert_eq!(
            BackoffPolicy { max_attempts: 0, ..ok }.validate(),
            Err(BackoffPolicyError::MaxAttempts)
        );
        assert_eq!(
            BackoffPolicy { initial_delay: Duration::ZERO, ..ok }.validate(),
            Err(BackoffPolicyError::InitialDelay)
        );
    }

    #[test]
    fn status_classification_treats_403_as_throttle_by_default() {
        assert_eq!(classify_status(StatusCode::OK, true), ResponseClass::Success);
        assert_eq!(classify_status(StatusCode::FORBIDDEN, true), ResponseClass::RateLimited);
        assert_eq!(classify_status(StatusCode::FORBIDDEN, false), ResponseClass::Permanent);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, false),
            ResponseClass::RateLimited
        );
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY, true), ResponseClass::Transient);
        assert_eq!(classify_status(StatusCode::NOT_FOUND, true), ResponseClass::Permanent);
        assert_eq!(classify_status(StatusCode::NO_CONTENT, true), ResponseClass::Permanent);
    }

    #[test]
    fn blob_keys_are_id_then_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        assert_eq!(blob_key("350112", at), "350112/20260224T120000.000Z");
        assert_eq!(blob_key("../etc", at), "_etc/20260224T120000.000Z");
    }

    #[tokio::test]
    async fn archive_never_overwrites_an_existing_object() {
        let dir = tempdir().expect("tempdir");
        let archive = FsBlobArchive::new(dir.path());
        let fetched_at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let first = RawPayload {
            id: "350112".into(),
            fetched_at,
            content_hash: sha256_hex(b"{\"v\":1}"),
            bytes: b"{\"v\":1}".to_vec(),
        };
        let second = RawPayload {
            bytes: b"{\"v\":2}".to_vec(),
            content_hash: sha256_hex(b"{\"v\":2}"),
            ..first.clone()
        };

        let stored = archive.put(&first).await.expect("first put");
        let again = archive.put(&second).await.expect("second put");

        assert!(!stored.deduplicated);
        assert!(again.deduplicated);
        assert_eq!(stored.key, again.key);
        let on_disk = std::fs::read(archive.path_for_key(&stored.key)).expect("read back");
        assert_eq!(on_disk, b"{\"v\":1}");
    }

    #[tokio::test]
    async fn rate_limited_twice_then_success_keeps_full_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/api/fetchOpportunity/42"))
            .respond_with(ResponseTemplate::new(403))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/api/fetchOpportunity/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errorcode": 0})))
            .expect(1)
            .mount(&server)
            .await;

        let http = fetcher(3);
        let outcome = http
            .fetch_json(&FetchRequest::get(
                "detail:42",
                format!("{}/v1/api/fetchOpportunity/42", server.uri()),
            ))
            .await
            .expect("third attempt succeeds");

        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.rate_limited_retries(), 2);
        assert!(outcome.attempts[0].next_retry_at.is_some());
        let delays: Vec<_> = outcome.attempts.iter().map(|a| a.retry_delay_ms).collect();
        assert_eq!(delays, vec![Some(10), Some(20), None]);
        assert_eq!(outcome.attempts[2].status, AttemptStatus::Success { status: 200 });
        assert_eq!(outcome.json["errorcode"], 0);
    }

    #[tokio::test]
    async fn not_found_is_permanent_after_one_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/api/fetchOpportunity/404"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher(3)
            .fetch_json(&FetchRequest::get(
                "detail:404",
                format!("{}/v1/api/fetchOpportunity/404", server.uri()),
            ))
            .await
            .expect_err("404 must not succeed");

        assert!(matches!(err, FetchError::Permanent { status: Some(404), .. }));
        assert_eq!(err.attempts().len(), 1);
        assert_eq!(err.dead_letter_reason(), "permanent:404");
    }

    #[tokio::test]
    async fn server_errors_exhaust_the_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = fetcher(2)
            .fetch_json(&FetchRequest::get("search:1", format!("{}/v1/api/search2", server.uri())))
            .await
            .expect_err("503 forever");

        match &err {
            FetchError::Exhausted {
                last_status,
                attempts,
                ..
            } => {
                assert_eq!(*last_status, Some(503));
                assert_eq!(attempts.len(), 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.dead_letter_reason(), "exhausted:3");
    }

    #[tokio::test]
    async fn unparseable_success_body_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher(3)
            .fetch_json(&FetchRequest::get("detail:9", format!("{}/x", server.uri())))
            .await
            .expect_err("html is not json");
        assert!(matches!(err, FetchError::Permanent { status: None, .. }));
        assert!(err.dead_letter_reason().starts_with("permanent:malformed body"));
    }

    #[tokio::test]
    async fn query_parameters_and_api_key_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/api/search2"))
            .and(query_param("keyword", "health"))
            .and(query_param("page", "2"))
            .and(wiremock::matchers::header("X-Api-Key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig {
            api_key: Some("secret".into()),
            backoff: fast_policy(1),
            ..Default::default()
        })
        .expect("fetcher");
        let request = FetchRequest::get("search:health:2", format!("{}/v1/api/search2", server.uri()))
            .with_query("keyword", "health")
            .with_query("page", "2");
        http.fetch_json(&request).await.expect("search page");
    }

    #[tokio::test]
    async fn shutdown_cancels_between_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let (tx, rx) = watch::channel(false);
        let http = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                initial_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
                ..fast_policy(5)
            },
            ..Default::default()
        })
        .expect("fetcher")
        .with_shutdown(rx);

        let request = FetchRequest::get("detail:1", format!("{}/x", server.uri()));
        let handle = tokio::spawn(async move { http.fetch_json(&request).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).expect("send shutdown");

        let err = handle.await.expect("join").expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(err.attempts().len(), 1);
    }
}
