//! Record sources: the live IMD JSON feed, local JSON files and fixed record lists.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imd_core::{PayloadInfo, RawRecord};
use imd_storage::{payload_sha256, ArchiveError, FetchError, HttpFetcher, PayloadArchive};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "imd-adapters";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl SourceContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("feed payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected feed shape: {0}")]
    Shape(String),
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Records for one run plus the identity of the payload they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceBatch {
    pub records: Vec<RawRecord>,
    pub payload: Option<PayloadInfo>,
}

impl SourceBatch {
    fn from_payload(bytes: &[u8], archived_to: Option<PathBuf>) -> Result<Self, SourceError> {
        Ok(Self {
            records: records_from_json(bytes)?,
            payload: Some(PayloadInfo {
                sha256: payload_sha256(bytes),
                byte_size: bytes.len(),
                archived_to,
            }),
        })
    }
}

/// Yields the finite batch of raw records for one run.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_records(&self, ctx: &SourceContext) -> Result<SourceBatch, SourceError>;
}

/// Decode a feed body: a single object becomes a one-element batch.
///
/// The whole body is decoded before any record is looked at, so a number
/// outside the f64 range anywhere in it fails the payload, not one record.
pub fn records_from_json(bytes: &[u8]) -> Result<Vec<RawRecord>, SourceError> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    records_from_value(value)
}

pub fn records_from_value(value: JsonValue) -> Result<Vec<RawRecord>, SourceError> {
    match value {
        JsonValue::Object(record) => Ok(vec![record]),
        JsonValue::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| match item {
                JsonValue::Object(record) => Ok(record),
                other => Err(SourceError::Shape(format!(
                    "element {idx} is {}, expected an object",
                    kind_of(&other)
                ))),
            })
            .collect(),
        other => Err(SourceError::Shape(format!(
            "top-level {}, expected an object or an array of objects",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// The live feed, fetched over HTTP.
#[derive(Debug)]
pub struct FeedSource {
    url: String,
    http: HttpFetcher,
    archive: Option<PayloadArchive>,
}

impl FeedSource {
    pub fn new(url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            url: url.into(),
            http,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RecordSource for FeedSource {
    fn describe(&self) -> String {
        format!("feed {}", self.url)
    }

    async fn fetch_records(&self, ctx: &SourceContext) -> Result<SourceBatch, SourceError> {
        let response = self.http.fetch_bytes(ctx.run_id, &self.url).await?;

        // Archived before decoding so a malformed body is kept for inspection.
        let archived_to = match &self.archive {
            Some(archive) => {
                let stored = archive.store(response.fetched_at, &response.body).await?;
                debug!(path = %stored.path.display(), reused = stored.reused, "feed payload archived");
                Some(stored.path)
            }
            None => None,
        };

        let batch = SourceBatch::from_payload(&response.body, archived_to)?;
        info!(
            run_id = %ctx.run_id,
            records = batch.records.len(),
            url = %response.final_url,
            "feed decoded"
        );
        Ok(batch)
    }
}

/// A JSON payload saved on disk, same shape as the feed.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSource for FileSource {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn fetch_records(&self, ctx: &SourceContext) -> Result<SourceBatch, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        let batch = SourceBatch::from_payload(&bytes, None)?;
        info!(run_id = %ctx.run_id, records = batch.records.len(), path = %self.path.display(), "file decoded");
        Ok(batch)
    }
}

/// A fixed batch of records held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    records: Vec<RawRecord>,
}

impl StaticSource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }

    pub fn from_value(value: JsonValue) -> Result<Self, SourceError> {
        Ok(Self::new(records_from_value(value)?))
    }
}

#[async_trait]
impl RecordSource for StaticSource {
    fn describe(&self) -> String {
        format!("{} in-memory records", self.records.len())
    }

    async fn fetch_records(&self, _ctx: &SourceContext) -> Result<SourceBatch, SourceError> {
        Ok(SourceBatch {
            records: self.records.clone(),
            payload: None,
        })
    }
}
