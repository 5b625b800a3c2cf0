//! Rate-limited HTTP fetch, CSV snapshot files, and the remote project store.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use doge_core::{Cell, RecordTable};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod bln;

pub use bln::{BlnClient, ProjectStorage, RemoteFile, StorageError};

pub const CRATE_NAME: &str = "doge-storage";

/// Upstream hiccups worth another try: throttling and gateway errors.
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Bounded retry for transient failures. `max_retries = 0` (the default)
/// surfaces the first non-success status as a `FetchError`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry `retries_done + 1`, or `None` once retries are spent
    /// or the failure is not transient. Doubles from `initial_delay` up to
    /// `max_delay`.
    pub fn next_delay(&self, retries_done: usize, transient: bool) -> Option<Duration> {
        if !transient || retries_done >= self.max_retries {
            return None;
        }
        let doublings = u32::try_from(retries_done).unwrap_or(u32::MAX).min(16);
        Some(self.initial_delay.saturating_mul(1 << doublings).min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(3),
        }
    }
}

/// Sliding-window limiter: at most `max_requests` acquisitions inside any
/// `window`. Callers over the ceiling wait instead of failing.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests.max(1),
            window: config.window,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut sent = self.sent.lock().await;
            let now = Instant::now();
            while let Some(&oldest) = sent.front() {
                if now.duration_since(oldest) >= self.window {
                    sent.pop_front();
                } else {
                    break;
                }
            }

            if sent.len() < self.max_requests as usize {
                sent.push_back(now);
                return;
            }

            let sleep_for = match sent.front() {
                Some(&oldest) => self.window.saturating_sub(now.duration_since(oldest)),
                None => Duration::ZERO,
            };
            drop(sent);
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Acquisitions still inside the current window.
    pub async fn in_window(&self) -> usize {
        let sent = self.sent.lock().await;
        let now = Instant::now();
        sent.iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count()
    }
}

/// Whether a request goes through the shared limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    Limited,
    Unlimited,
}

impl Throttle {
    pub fn from_flag(rate_limited: bool) -> Self {
        if rate_limited {
            Throttle::Limited
        } else {
            Throttle::Unlimited
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
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
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Outbound GET seam shared by the crawler and the enrichment lookups.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get(&self, url: &str, throttle: Throttle) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        Self::with_limiter(config, limiter)
    }

    /// Builds a fetcher over an existing limiter so several fetchers share
    /// one request window.
    pub fn with_limiter(config: HttpClientConfig, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
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
            limiter,
            retry: config.retry,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    async fn send_with_retries(&self, url: &str, throttle: Throttle) -> Result<FetchedResponse, FetchError> {
        let mut retries_done = 0;
        loop {
            if throttle == Throttle::Limited {
                self.limiter.acquire().await;
            }

            let (error, transient) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let error = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (error, is_transient_status(status))
                }
                Err(err) => {
                    let transient = is_transient_error(&err);
                    (FetchError::Request(err), transient)
                }
            };

            let Some(delay) = self.retry.next_delay(retries_done, transient) else {
                return Err(error);
            };
            debug!(url, retry = retries_done + 1, ?delay, error = %error, "retrying fetch");
            tokio::time::sleep(delay).await;
            retries_done += 1;
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get(&self, url: &str, throttle: Throttle) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, ?throttle);
        self.send_with_retries(url, throttle).instrument(span).await
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("reading snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("writing snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("snapshot io {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reads a CSV snapshot. Empty fields read back as null; a ragged row or a
/// missing header is an error.
pub async fn read_snapshot_csv(path: &Path) -> Result<RecordTable, SnapshotError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table = decode_snapshot_csv(&bytes).map_err(|source| SnapshotError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), rows = table.len(), "read snapshot");
    Ok(table)
}

fn decode_snapshot_csv(bytes: &[u8]) -> Result<RecordTable, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);
    let headers = reader.headers()?.iter().map(ToString::to_string).collect();
    let mut table = RecordTable::new(headers);
    for record in reader.records() {
        let cells: Vec<Cell> = record?
            .iter()
            .map(|field| (!field.is_empty()).then(|| field.to_string()))
            .collect();
        table.push_row(cells);
    }
    Ok(table)
}

fn encode_snapshot_csv(table: &RecordTable) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(table.columns())?;
    for row in table.rows() {
        writer.write_record(row.iter().map(|c| c.as_deref().unwrap_or("")))?;
    }
    writer.into_inner().map_err(|e| csv::Error::from(e.into_error()))
}

/// Writes a snapshot via a temp file in the same directory and a rename, so a
/// crash never leaves a half-written file under the final name.
pub async fn write_snapshot_csv(path: &Path, table: &RecordTable) -> Result<(), SnapshotError> {
    let bytes = encode_snapshot_csv(table).map_err(|source| SnapshotError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let io_err = |path: &Path, source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| io_err(parent, e))?;

    let temp_path = parent.join(format!(".{}.csv.tmp", Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&temp_path, &bytes).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io_err(&temp_path, e));
    }
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io_err(path, e));
    }
    Ok(())
}

/// Deletes local files, ignoring ones already gone. Returns how many were removed.
pub async fn remove_local_files(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to remove local file"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn sample_table() -> RecordTable {
        let mut table = RecordTable::new(vec!["vendor".into(), "value".into(), "note".into()]);
        table.push_row(vec![Some("Acme, Inc.".into()), Some("1200.5".into()), None]);
        table.push_row(vec![Some("He said \"hi\"".into()), None, Some("line\nbreak".into())]);
        table
    }

    #[tokio::test]
    async fn snapshot_csv_preserves_quoting_and_nulls() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("doge-contract_2025-01-01T000000.csv");
        write_snapshot_csv(&path, &sample_table()).await.expect("write");

        let back = read_snapshot_csv(&path).await.expect("read");
        assert_eq!(back, sample_table());
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn ragged_snapshot_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "a,b\n1,2\n3\n").unwrap();
        assert!(matches!(read_snapshot_csv(&path).await, Err(SnapshotError::Read { .. })));
    }

    #[tokio::test]
    async fn missing_snapshot_is_an_io_error() {
        let dir = tempdir().expect("tempdir");
        let err = read_snapshot_csv(&dir.path().join("absent.csv")).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Io { .. }));
    }

    #[tokio::test]
    async fn removing_missing_files_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let present = dir.path().join("present.csv");
        std::fs::write(&present, "a\n").unwrap();
        let removed = remove_local_files(&[present.clone(), dir.path().join("absent.csv")]).await;
        assert_eq!(removed, 1);
        assert!(!present.exists());
    }

    /// Answers each connection with the next status in `statuses`, then 200.
    async fn scripted_server(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            let mut statuses = statuses.into_iter();
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let status = statuses.next().unwrap_or(200);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let body = format!("status {status}");
                let reply = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/savings/grants"), hits)
    }

    fn fetcher(retry: RetryPolicy, rate_limit: RateLimitConfig) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("doge-storage-test".to_string()),
            retry,
            rate_limit,
        })
        .expect("client")
    }

    #[tokio::test]
    async fn not_found_is_a_status_error_without_retry() {
        let (url, hits) = scripted_server(vec![404]).await;
        let fetcher = fetcher(RetryPolicy::default(), RateLimitConfig::default());

        let err = fetcher.get(&url, Throttle::Limited).await.unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_then_ok_succeeds_on_retry() {
        let (url, hits) = scripted_server(vec![503]).await;
        let retry = RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        };
        let fetcher = fetcher(retry, RateLimitConfig::default());

        let page = fetcher.get(&url, Throttle::Limited).await.expect("retried fetch");

        assert_eq!(page.status, StatusCode::OK);
        assert_eq!(page.text(), "status 200");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.limiter().in_window().await, 2);
    }

    #[tokio::test]
    async fn unlimited_fetches_bypass_the_limiter() {
        let (url, hits) = scripted_server(vec![]).await;
        let fetcher = fetcher(
            RetryPolicy::default(),
            RateLimitConfig {
                max_requests: 1,
                window: Duration::from_secs(60),
            },
        );

        for _ in 0..3 {
            fetcher.get(&url, Throttle::Unlimited).await.expect("fetch");
        }
        assert_eq!(fetcher.limiter().in_window().await, 0);

        fetcher.get(&url, Throttle::Limited).await.expect("fetch");
        assert_eq!(fetcher.limiter().in_window().await, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn retry_delays_only_for_transient_failures() {
        let retry = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(retry.next_delay(0, true), Some(Duration::from_millis(500)));
        assert_eq!(retry.next_delay(2, true), Some(Duration::from_secs(1)));
        assert_eq!(retry.next_delay(3, true), None);
        assert_eq!(retry.next_delay(0, false), None);
        assert_eq!(RetryPolicy::default().next_delay(0, true), None);

        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_delays_requests_over_the_ceiling() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 10,
            window: Duration::from_secs(3),
        });
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
        assert_eq!(limiter.in_window().await, 10);

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_window_slides() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 2,
            window: Duration::from_secs(1),
        });
        let start = Instant::now();
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        limiter.acquire().await;
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1));
        assert!(waited < Duration::from_millis(1500));
    }
}
