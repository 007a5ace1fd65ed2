//! Feed retrieval with retry/backoff, plus an optional on-disk archive of the
//! raw feed bodies each run consumed.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "imd-storage";

/// Hex digits of the digest kept in archive file names.
const NAME_DIGEST_LEN: usize = 16;

/// Lowercase hex SHA-256 of a payload body.
pub fn payload_sha256(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where a payload landed and whether an earlier copy was reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub path: PathBuf,
    pub sha256: String,
    pub reused: bool,
}

/// Raw feed bodies kept as `<root>/YYYY/MM/DD/HHMMSS-<digest>.json`.
///
/// The feed is republished every few hours with mostly identical content, so
/// a body whose digest already sits in the same day directory is not written
/// again; the earlier file is returned instead.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn day_dir(&self, fetched_at: DateTime<Utc>) -> PathBuf {
        self.root.join(fetched_at.format("%Y/%m/%d").to_string())
    }

    pub fn file_name(fetched_at: DateTime<Utc>, sha256: &str) -> String {
        let short = sha256.get(..NAME_DIGEST_LEN).unwrap_or(sha256);
        format!("{}-{short}.json", fetched_at.format("%H%M%S"))
    }

    pub async fn store(&self, fetched_at: DateTime<Utc>, body: &[u8]) -> Result<StoredPayload, ArchiveError> {
        let sha256 = payload_sha256(body);
        let dir = self.day_dir(fetched_at);
        fs::create_dir_all(&dir).await.map_err(io_at(&dir))?;

        if let Some(path) = same_day_copy(&dir, &sha256).await? {
            debug!(path = %path.display(), "payload already archived today");
            return Ok(StoredPayload {
                path,
                sha256,
                reused: true,
            });
        }

        let name = Self::file_name(fetched_at, &sha256);
        let path = dir.join(&name);
        let partial = dir.join(format!(".{name}.partial"));
        fs::write(&partial, body).await.map_err(io_at(&partial))?;
        if let Err(source) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(ArchiveError::Io { path, source });
        }

        Ok(StoredPayload {
            path,
            sha256,
            reused: false,
        })
    }
}

async fn same_day_copy(dir: &Path, sha256: &str) -> Result<Option<PathBuf>, ArchiveError> {
    let suffix = format!("-{}.json", sha256.get(..NAME_DIGEST_LEN).unwrap_or(sha256));
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_at(dir)(err)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(io_at(dir))? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with('.') && name.ends_with(&suffix) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and 429 are worth another attempt; everything else is final.
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

/// Doubling delay from `base_delay`, never above `max_delay`.
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt)
            .ok()
            .and_then(|n| 2u32.checked_pow(n))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
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
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => classify_status(*status),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    pub fn from_client(client: reqwest::Client, backoff: BackoffPolicy) -> Self {
        Self { client, backoff }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// GET `url`. Transient failures are retried up to `max_retries` times.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let failure = match self.get_once(url).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };
            if failure.disposition() == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(failure);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %failure, "feed fetch failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn get_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus { status, url: final_url });
        }

        let body = response.bytes().await?.to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "feed fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            fetched_at: Utc::now(),
            body,
        })
    }
}
