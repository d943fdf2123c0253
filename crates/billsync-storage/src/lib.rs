//! Remote transport (FTP + HTTP), bucket layout math and raw document archiving.

mod ftp;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use billsync_core::BillId;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use ftp::{FtpConfig, FtpFetcher};

pub const CRATE_NAME: &str = "billsync-storage";

/// Number of consecutive bill numbers per remote directory.
pub const DEFAULT_BUCKET_SIZE: u32 = 99;

/// Zero-padding width of bucket bounds in directory names.
pub const BUCKET_PAD_WIDTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRange {
    pub start: u32,
    pub end: u32,
}

impl BucketRange {
    pub fn contains(&self, number: u32) -> bool {
        self.start <= number && number <= self.end
    }
}

/// Partition `bill_number` into its remote directory range.
///
/// `start = floor((n - 1) / size) * size + 1`, `end = start + size - 1`.
/// Numbers below 1 are treated as 1; the last bucket ends at `u32::MAX`.
pub fn compute_bucket(bill_number: u32, bucket_size: u32) -> BucketRange {
    let size = bucket_size.max(1);
    let n = bill_number.max(1);
    let start = ((n - 1) / size) * size + 1;
    BucketRange {
        start,
        end: start.saturating_add(size - 1),
    }
}

/// Directory name for the bucket holding `bill_number`, e.g. `HB00001_HB00099`.
pub fn bucket_directory(bill_type: &str, bill_number: u32, bucket_size: u32) -> String {
    let range = compute_bucket(bill_number, bucket_size);
    format!(
        "{bill_type}{:0width$}_{bill_type}{:0width$}",
        range.start,
        range.end,
        width = BUCKET_PAD_WIDTH
    )
}

/// Inverse of [`bucket_directory`]; `None` for names that are not buckets of `bill_type`.
pub fn parse_bucket_directory(bill_type: &str, name: &str) -> Option<BucketRange> {
    let name = name.trim().trim_end_matches('/');
    let name = name.rsplit('/').next().unwrap_or(name);
    let (lo, hi) = name.split_once('_')?;
    let start: u32 = lo.strip_prefix(bill_type)?.parse().ok()?;
    let end: u32 = hi.strip_prefix(bill_type)?.parse().ok()?;
    (start >= 1 && start <= end).then_some(BucketRange { start, end })
}

/// Remote directory of a bill's history document, e.g.
/// `/bills/89R/billhistory/house_bills/HB00001_HB00099`.
pub fn history_directory(session: &str, type_dir: &str, bill: &BillId, bucket_size: u32) -> String {
    format!(
        "/bills/{session}/billhistory/{type_dir}/{}",
        bucket_directory(&bill.bill_type, bill.number, bucket_size)
    )
}

/// File name of a bill's history document, e.g. `HB 1.xml`.
pub fn history_document_name(bill: &BillId) -> String {
    format!("{} {}.xml", bill.bill_type, bill.number)
}

/// Inverse of [`history_document_name`].
pub fn parse_history_document_name(bill_type: &str, name: &str) -> Option<u32> {
    let name = name.rsplit('/').next().unwrap_or(name).trim();
    let stem = name.strip_suffix(".xml")?;
    let digits = stem.strip_prefix(bill_type)?.trim();
    digits.parse().ok().filter(|n| *n >= 1)
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("not found: {location}")]
    NotFound { location: String },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("ftp error at {location}: {message}")]
    Ftp { location: String, message: String },
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("fetch task aborted: {0}")]
    Task(String),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedDocument {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw remote documents.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn document_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        bill: &BillId,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(day)
            .join(&bill.bill_type)
            .join(format!("{}-{}.{ext}", bill.number, &content_hash[..16.min(content_hash.len())]))
    }

    /// Write `bytes` once per content hash, via temp file + rename.
    pub async fn store_document(
        &self,
        fetched_at: DateTime<Utc>,
        bill: &BillId,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedDocument> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.document_relative_path(fetched_at, bill, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedDocument {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
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
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn is_not_found_status(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::GONE
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
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Shortest refill interval a [`TokenBucket`] accepts.
pub const MIN_REFILL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl TokenBucketConfig {
    /// Bucket holding one second of requests at `requests_per_sec`.
    pub fn per_second(requests_per_sec: u32) -> Self {
        let rps = requests_per_sec.max(1);
        Self {
            capacity: rps,
            refill_every: Duration::from_secs_f64(1.0 / f64::from(rps)).max(MIN_REFILL_INTERVAL),
        }
    }
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every.max(MIN_REFILL_INTERVAL),
            state: Mutex::new((config.capacity.max(1), Instant::now())),
        }
    }

    /// Wait until a token is available and consume it.
    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let (tokens, last_refill) = &mut *state;
            let elapsed = last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
                let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                *tokens = tokens.saturating_add(refills).min(self.capacity);
                *last_refill = Instant::now();
            }
            if *tokens > 0 {
                *tokens -= 1;
                return;
            }
            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_host_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Rate-limited HTTP client with retries on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<TokenBucket>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            token_bucket: config.token_bucket.map(TokenBucket::new),
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// GET `url`. 404/410 map to [`FetchError::NotFound`]; 5xx, 429, connect
    /// errors and timeouts are retried with capped exponential backoff.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|e| FetchError::Task(e.to_string()))?;
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host
            .acquire()
            .await
            .map_err(|e| FetchError::Task(e.to_string()))?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        self.get_with_retries(parsed)
            .instrument(info_span!("http_fetch", host = %host, url))
            .await
    }

    async fn get_with_retries(&self, url: Url) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }
                    if is_not_found_status(status) {
                        return Err(FetchError::NotFound { location: final_url });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying http fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
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
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bucket_bounds_hold_for_every_number() {
        for n in 1..=5_000u32 {
            let range = compute_bucket(n, DEFAULT_BUCKET_SIZE);
            assert_eq!((range.start - 1) % 99, 0, "start of {n}");
            assert_eq!(range.end, range.start + 98, "end of {n}");
            assert!(range.contains(n), "{n} outside {range:?}");
        }
    }

    #[test]
    fn bucket_edges_are_exact() {
        assert_eq!(compute_bucket(1, 99), BucketRange { start: 1, end: 99 });
        assert_eq!(compute_bucket(99, 99), BucketRange { start: 1, end: 99 });
        assert_eq!(compute_bucket(100, 99), BucketRange { start: 100, end: 198 });
        assert_eq!(compute_bucket(198, 99), BucketRange { start: 100, end: 198 });
        assert_eq!(compute_bucket(199, 99), BucketRange { start: 199, end: 297 });
        assert_eq!(compute_bucket(0, 99), BucketRange { start: 1, end: 99 });
        assert_eq!(compute_bucket(7, 1), BucketRange { start: 7, end: 7 });
    }

    #[test]
    fn top_of_the_number_space_does_not_overflow() {
        let range = compute_bucket(u32::MAX, DEFAULT_BUCKET_SIZE);
        assert_eq!(range.end, u32::MAX);
        assert!(range.contains(u32::MAX));
        assert_eq!((range.start - 1) % 99, 0);
        assert_eq!(compute_bucket(u32::MAX - 1, u32::MAX).end, u32::MAX);
    }

    #[test]
    fn directory_names_are_zero_padded() {
        assert_eq!(bucket_directory("HB", 1, 99), "HB00001_HB00099");
        assert_eq!(bucket_directory("HB", 100, 99), "HB00100_HB00198");
        assert_eq!(bucket_directory("SJR", 4321, 99), "SJR04258_SJR04356");
        assert_eq!(
            history_directory("89R", "house_bills", &BillId::new("HB", 150), 99),
            "/bills/89R/billhistory/house_bills/HB00100_HB00198"
        );
        assert_eq!(history_document_name(&BillId::new("SB", 12)), "SB 12.xml");
    }

    #[test]
    fn directory_and_document_names_parse_back() {
        assert_eq!(
            parse_bucket_directory("HB", "HB00100_HB00198"),
            Some(BucketRange { start: 100, end: 198 })
        );
        assert_eq!(
            parse_bucket_directory("HB", "/bills/89R/billhistory/house_bills/HB00001_HB00099/"),
            Some(BucketRange { start: 1, end: 99 })
        );
        // HJR buckets share the directory but must not be read as HB.
        assert_eq!(parse_bucket_directory("HB", "HJR00001_HJR00099"), None);
        assert_eq!(parse_history_document_name("HB", "HB 145.xml"), Some(145));
        assert_eq!(parse_history_document_name("HB", "HJR 1.xml"), None);
        assert_eq!(parse_history_document_name("SB", "SB 3.txt"), None);
    }

    #[test]
    fn content_hash_is_hex_sha256() {
        let hash = ArtifactStore::sha256_hex(b"<billhistory/>");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash, ArtifactStore::sha256_hex(b"<billhistory />"));
    }

    #[tokio::test]
    async fn archived_documents_deduplicate_by_content() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let bill = BillId::new("HB", 12);

        let first = store
            .store_document(fetched_at, &bill, "xml", b"<billhistory/>")
            .await
            .expect("first store");
        let second = store
            .store_document(fetched_at, &bill, ".xml", b"<billhistory/>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20250301/HB"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn not_found_statuses_are_distinct_from_retryable_ones() {
        assert!(is_not_found_status(StatusCode::NOT_FOUND));
        assert!(is_not_found_status(StatusCode::GONE));
        assert!(!is_not_found_status(StatusCode::BAD_GATEWAY));
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn token_bucket_hands_out_capacity_without_waiting() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            capacity: 3,
            refill_every: Duration::from_secs(60),
        });
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn high_request_rates_keep_a_nonzero_refill_interval() {
        let config = TokenBucketConfig::per_second(2_000);
        assert_eq!(config.capacity, 2_000);
        assert_eq!(config.refill_every, MIN_REFILL_INTERVAL);
        assert_eq!(
            TokenBucketConfig::per_second(4).refill_every,
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn drained_bucket_refills_even_with_a_zero_interval() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            capacity: 2,
            refill_every: Duration::ZERO,
        });
        let third = tokio::time::timeout(Duration::from_secs(2), async {
            for _ in 0..3 {
                bucket.take().await;
            }
        })
        .await;
        assert!(third.is_ok(), "bucket never refilled");
    }
}
