//! The run loop: fetch, normalize, upsert each record, audit once.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use imd_adapters::{FeedSource, FileSource, RecordSource, SourceContext};
use imd_core::{normalize_record, NullSentinels, RunSummary};
use imd_storage::{HttpClientConfig, HttpFetcher, PayloadArchive};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::audit::{HostIdentity, RunAuditor};
use crate::config::{ConfigError, ImdConfig};
use crate::sink::{RecordOutcome, RunTally, UpsertSink};
use crate::store::{
    audit_table_ddl, observation_table_ddl, MemoryObservationStore, ObservationStore, PgObservationStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Fetching,
    Processing,
    AuditWrite,
    Cleanup,
    Terminal,
}

fn enter(phase: RunPhase) {
    debug!(?phase, "run phase");
}

pub struct ImdPipeline {
    source: Box<dyn RecordSource>,
    sentinels: NullSentinels,
    auditor: RunAuditor,
}

impl ImdPipeline {
    pub fn new(source: Box<dyn RecordSource>, sentinels: NullSentinels, auditor: RunAuditor) -> Self {
        Self {
            source,
            sentinels,
            auditor,
        }
    }

    /// Wire the source and auditor described by `config`. A local input file wins over the feed URL.
    pub fn from_config(config: &ImdConfig) -> Result<Self> {
        let source: Box<dyn RecordSource> = if let Some(path) = &config.input_path {
            Box::new(FileSource::new(path.clone()))
        } else {
            let url = config.feed_url.clone().ok_or(ConfigError::MissingSource)?;
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })?;
            let mut feed = FeedSource::new(url, http);
            if let Some(dir) = &config.archive_dir {
                feed = feed.with_archive(PayloadArchive::new(dir.clone()));
            }
            Box::new(feed)
        };

        let auditor = RunAuditor::new(config.remarks.clone(), HostIdentity::detect())
            .with_run_log(config.run_log.clone());
        Ok(Self::new(source, config.null_sentinels.clone(), auditor))
    }

    pub fn source(&self) -> &dyn RecordSource {
        self.source.as_ref()
    }

    /// One full batch. Only fetch, schema, commit and audit failures escape;
    /// record-level failures are tallied and the run carries on. The store is
    /// closed on every exit path.
    pub async fn run_once(&self, store: &mut dyn ObservationStore) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("imd_run", %run_id, source = %self.source.describe());
        let outcome = self.run_inner(run_id, store).instrument(span.clone()).await;

        let closed = async {
            enter(RunPhase::Cleanup);
            let closed = store.close().await;
            enter(RunPhase::Terminal);
            closed
        }
        .instrument(span)
        .await;
        match (outcome, closed) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Ok(_), Err(err)) => Err(err).context("closing store"),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!(error = %close_err, "store close failed after run error");
                Err(err)
            }
        }
    }

    async fn run_inner(&self, run_id: Uuid, store: &mut dyn ObservationStore) -> Result<RunSummary> {
        enter(RunPhase::Init);
        let started_at = Utc::now();
        let ctx = SourceContext::new(run_id);

        enter(RunPhase::Fetching);
        let batch = self
            .source
            .fetch_records(&ctx)
            .await
            .with_context(|| format!("fetching records from {}", self.source.describe()))?;
        store
            .ensure_schema()
            .await
            .with_context(|| format!("creating tables in {}", store.describe()))?;

        enter(RunPhase::Processing);
        let records = batch.records;
        let total = records.len();
        let mut tally = RunTally::default();
        store.begin_batch().await.context("opening write batch")?;
        {
            let mut sink = UpsertSink::new(&mut *store);
            for mut record in records {
                let replaced = normalize_record(&mut record, &self.sentinels);
                let outcome = sink.upsert(&record).await;
                match &outcome {
                    RecordOutcome::Skipped { message } => warn!("skipping record {message}"),
                    RecordOutcome::AlreadyPresent => debug!(replaced, "record already present"),
                    RecordOutcome::Inserted => debug!(replaced, "record inserted"),
                }
                tally.record(outcome);
            }
        }
        store.commit_batch().await.context("committing inserted records")?;
        debug_assert_eq!(tally.processed(), total as u64);

        enter(RunPhase::AuditWrite);
        let mut summary = self.auditor.write(store, &tally, started_at).await?;
        summary.payload = batch.payload;
        info!(
            inserted = summary.inserted(),
            skipped = summary.skipped(),
            records = total,
            payload_sha256 = summary.payload.as_ref().map(|p| p.sha256.as_str()),
            "run complete"
        );
        Ok(summary)
    }
}

/// Build everything from `config` and run once. `dry_run` swaps the database for an in-memory store.
pub async fn run_once_with_config(config: &ImdConfig, dry_run: bool) -> Result<RunSummary> {
    config.validate()?;
    let pipeline = ImdPipeline::from_config(config)?;

    if dry_run {
        let mut store = MemoryObservationStore::new();
        return pipeline.run_once(&mut store).await;
    }

    let mut store = PgObservationStore::connect(config)
        .await
        .context("connecting to database")?;
    pipeline.run_once(&mut store).await
}

/// DDL for both tables, as executed at startup.
pub fn schema_sql(config: &ImdConfig) -> String {
    format!(
        "{};\n\n{};\n",
        observation_table_ddl(&config.table_name),
        audit_table_ddl(&config.audit_table)
    )
}
