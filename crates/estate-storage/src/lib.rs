//! Durable local state, retry/backoff helpers and HTTP fetch utilities.

pub mod history;
pub mod lock;
pub mod workbook;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use history::{DedupHistory, DedupHistoryStore, HistoryEntry};
pub use lock::{FileLock, LockConfig, LockError, LockGuard, LockRecord};
pub use reqwest::Url;
pub use workbook::{DurableWriter, WorkbookRow, WriteError, WriteReport};

pub const CRATE_NAME: &str = "estate-storage";

/// Sibling temp path used for write-then-rename replacement of `path`.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    parent_dir(path).join(format!(".{file_name}.{}.tmp", Uuid::new_v4()))
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Replace `path` with `bytes` using a temp file and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = temp_sibling(path);
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn always_retry<E>(_err: &E) -> RetryDisposition {
    RetryDisposition::Retryable
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
    /// 1s, 2s, 4s: three retries after the initial attempt.
    pub fn remote_write() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        }
    }

    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|i| self.delay_for_attempt(i)).collect()
    }
}

/// Successful result of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: usize,
}

/// The attempt budget ran out (or the error was not retryable).
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: usize,
    pub last_error: E,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gave up after {} attempt(s): {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryExhausted<E> {}

/// Run `op` until it succeeds, the error is classified non-retryable, or
/// `policy.max_retries` retries have been spent. `op` receives the zero-based attempt index.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &BackoffPolicy,
    classify: C,
    mut op: F,
) -> Result<Attempted<T>, RetryExhausted<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDisposition,
    E: fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt + 1,
                })
            }
            Err(err) => {
                if attempt >= policy.max_retries
                    || classify(&err) == RetryDisposition::NonRetryable
                {
                    return Err(RetryExhausted {
                        attempts: attempt + 1,
                        last_error: err,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub min_delay: Duration,
    pub error_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            error_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Per-site request pacing: a minimum gap between requests, widened
/// exponentially while consecutive errors accumulate.
#[derive(Debug)]
pub struct SiteRateLimiter {
    config: RateLimitConfig,
    state: Mutex<RateLimiterState>,
}

#[derive(Debug, Clone, Copy)]
struct RateLimiterState {
    next_slot: Option<Instant>,
    consecutive_errors: u32,
}

impl SiteRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RateLimiterState {
                next_slot: None,
                consecutive_errors: 0,
            }),
        }
    }

    pub fn spacing_for(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return self.config.min_delay;
        }
        let factor = 1u32
            .checked_shl(consecutive_errors - 1)
            .unwrap_or(u32::MAX);
        let widened = self
            .config
            .min_delay
            .saturating_add(self.config.error_backoff.saturating_mul(factor));
        widened.min(self.config.max_backoff.max(self.config.min_delay))
    }

    /// Reserve the next request slot and sleep until it opens.
    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let slot = state.next_slot.map_or(now, |t| t.max(now));
            state.next_slot = Some(slot + self.spacing_for(state.consecutive_errors));
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn record_success(&self) {
        self.state.lock().await.consecutive_errors = 0;
    }

    pub async fn record_error(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.consecutive_errors
    }

    pub async fn consecutive_errors(&self) -> u32 {
        self.state.lock().await.consecutive_errors
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_site_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_site_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_site_limit: usize,
    per_site: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Closed => RetryDisposition::NonRetryable,
        }
    }
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
            per_site_limit: config.per_site_concurrency.max(1),
            per_site: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_site_semaphore(&self, site_key: &str) -> Arc<Semaphore> {
        let mut map = self.per_site.lock().await;
        map.entry(site_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_site_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        site_key: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_site = self.per_site_semaphore(site_key).await;
        let _site = per_site.acquire().await.map_err(|_| FetchError::Closed)?;

        retry_with_backoff(&self.backoff, FetchError::disposition, |_| {
            self.fetch_once(url)
        })
        .instrument(info_span!("http_fetch", site_key, url))
        .await
        .map(|done| done.value)
        .map_err(|exhausted| exhausted.last_error)
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

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
    fn remote_write_schedule_is_one_two_four_seconds() {
        assert_eq!(
            BackoffPolicy::remote_write().schedule(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_helper_counts_attempts_until_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_with_backoff(&BackoffPolicy::remote_write(), always_retry, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("flaky #{n}"))
                } else {
                    Ok("stored")
                }
            }
        })
        .await
        .expect("third attempt succeeds");

        assert_eq!(result.value, "stored");
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_helper_gives_up_after_budget() {
        let started = Instant::now();
        let err = retry_with_backoff(&BackoffPolicy::remote_write(), always_retry, |i| async move {
            Err::<(), _>(format!("down on attempt {i}"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error, "down on attempt 3");
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test]
    async fn retry_helper_stops_on_non_retryable_error() {
        let err = retry_with_backoff(
            &BackoffPolicy::default(),
            |_: &String| RetryDisposition::NonRetryable,
            |_| async { Err::<(), _>("forbidden".to_string()) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn atomic_write_replaces_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        write_atomic(&path, b"{\"v\":1}").await.expect("first write");
        write_atomic(&path, b"{\"v\":2}").await.expect("second write");

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"v\":2}");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_requests() {
        let limiter = SiteRateLimiter::new(RateLimitConfig {
            min_delay: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        });
        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn rate_limiter_widens_after_consecutive_errors() {
        let limiter = SiteRateLimiter::new(RateLimitConfig {
            min_delay: Duration::from_millis(100),
            error_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(700),
        });
        assert_eq!(limiter.spacing_for(0), Duration::from_millis(100));
        assert_eq!(limiter.spacing_for(1), Duration::from_millis(300));
        assert_eq!(limiter.spacing_for(2), Duration::from_millis(500));
        assert_eq!(limiter.spacing_for(3), Duration::from_millis(700));

        assert_eq!(limiter.record_error().await, 1);
        assert_eq!(limiter.record_error().await, 2);
        limiter.record_success().await;
        assert_eq!(limiter.consecutive_errors().await, 0);
    }
}
