//! End-of-run audit: one summary row per run, plus an optional plain-text run log.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use imd_core::{AuditRecord, RunSummary};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::sink::RunTally;
use crate::store::ObservationStore;

/// Who ran the job and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub sys_user: String,
    pub host_name: String,
}

impl HostIdentity {
    pub fn new(sys_user: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            sys_user: sys_user.into(),
            host_name: host_name.into(),
        }
    }

    /// User from the login environment; host from the environment, then
    /// `/etc/hostname`, then the system `hostname` command.
    pub fn detect() -> Self {
        Self::resolve(env_nonempty, etc_hostname, hostname_command)
    }

    fn resolve(
        env: impl Fn(&str) -> Option<String>,
        etc_hostname: impl FnOnce() -> Option<String>,
        hostname_command: impl FnOnce() -> Option<String>,
    ) -> Self {
        let sys_user = env("USER")
            .or_else(|| env("USERNAME"))
            .or_else(|| env("LOGNAME"))
            .unwrap_or_else(|| UNKNOWN.to_string());
        let host_name = env("HOSTNAME")
            .or_else(|| env("COMPUTERNAME"))
            .or_else(etc_hostname)
            .or_else(hostname_command)
            .unwrap_or_else(|| UNKNOWN.to_string());
        Self { sys_user, host_name }
    }
}

const UNKNOWN: &str = "unknown";

fn nonempty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().as_deref().and_then(nonempty)
}

fn etc_hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname").ok().as_deref().and_then(nonempty)
}

fn hostname_command() -> Option<String> {
    let output = std::process::Command::new("hostname").output().ok()?;
    if !output.status.success() {
        return None;
    }
    nonempty(&String::from_utf8_lossy(&output.stdout))
}

#[derive(Debug, Clone)]
pub struct RunAuditor {
    remarks: String,
    identity: HostIdentity,
    run_log: Option<PathBuf>,
}

impl RunAuditor {
    pub fn new(remarks: impl Into<String>, identity: HostIdentity) -> Self {
        Self {
            remarks: remarks.into(),
            identity,
            run_log: None,
        }
    }

    pub fn with_run_log(mut self, path: Option<PathBuf>) -> Self {
        self.run_log = path;
        self
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    pub fn audit_record(&self, tally: &RunTally) -> AuditRecord {
        AuditRecord {
            records_inserted: tally.inserted,
            records_skipped: tally.skipped,
            error_messages: tally.error_text(),
            sys_user: self.identity.sys_user.clone(),
            host_name: self.identity.host_name.clone(),
            remarks: self.remarks.clone(),
        }
    }

    /// Write the audit row. Called exactly once per run, whatever the tally holds.
    pub async fn write(
        &self,
        store: &mut dyn ObservationStore,
        tally: &RunTally,
        started_at: DateTime<Utc>,
    ) -> Result<RunSummary> {
        let audit = self.audit_record(tally);
        let run_id = store
            .write_audit(&audit)
            .await
            .context("writing audit row")?;
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            already_present: tally.already_present,
            audit,
            payload: None,
        };
        info!(
            run_id,
            inserted = summary.inserted(),
            skipped = summary.skipped(),
            already_present = summary.already_present,
            "audit row written"
        );

        if let Some(path) = &self.run_log {
            let entry = format_run_log_entry(&summary, Local::now());
            if let Err(err) = append_run_log(path, &entry).await {
                warn!(path = %path.display(), error = %err, "could not append run log");
            }
        }

        Ok(summary)
    }
}

pub fn format_run_log_entry(summary: &RunSummary, at: DateTime<Local>) -> String {
    let mut entry = format!(
        "[{}] Inserted: {}, Skipped: {}\n",
        at.format("%Y-%m-%d %H:%M:%S"),
        summary.inserted(),
        summary.skipped()
    );
    for message in summary.errors() {
        entry.push_str(&format!("    Error: {message}\n"));
    }
    entry.push('\n');
    entry
}

async fn append_run_log(path: &Path, entry: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(entry.as_bytes())
        .await
        .with_context(|| format!("appending to {}", path.display()))?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordOutcome;
    use crate::store::MemoryObservationStore;
    use chrono::TimeZone;

    fn auditor() -> RunAuditor {
        RunAuditor::new("Daily IMD fetch", HostIdentity::new("imd", "wx-01"))
    }

    #[test]
    fn host_falls_back_to_hostname_command_when_env_and_file_are_silent() {
        let identity = HostIdentity::resolve(
            |name| (name == "LOGNAME").then(|| "cron".to_string()),
            || None,
            || Some("wx-02".to_string()),
        );
        assert_eq!(identity, HostIdentity::new("cron", "wx-02"));
    }

    #[test]
    fn environment_wins_over_hostname_file_and_command() {
        let identity = HostIdentity::resolve(
            |name| match name {
                "USER" => Some("imd".to_string()),
                "HOSTNAME" => Some("wx-01".to_string()),
                _ => None,
            },
            || Some("from-file".to_string()),
            || panic!("hostname command should not run"),
        );
        assert_eq!(identity, HostIdentity::new("imd", "wx-01"));

        let identity = HostIdentity::resolve(|_| None, || None, || None);
        assert_eq!(identity, HostIdentity::new("unknown", "unknown"));
    }

    #[tokio::test]
    async fn empty_run_writes_one_row_with_null_errors() {
        let mut store = MemoryObservationStore::new();
        let summary = auditor()
            .write(&mut store, &RunTally::default(), Utc::now())
            .await
            .unwrap();

        assert_eq!(store.audits().len(), 1);
        let row = &store.audits()[0].record;
        assert_eq!(row.records_inserted, 0);
        assert_eq!(row.records_skipped, 0);
        assert_eq!(row.error_messages, None);
        assert_eq!(row.sys_user, "imd");
        assert_eq!(row.host_name, "wx-01");
        assert_eq!(row.remarks, "Daily IMD fetch");
        assert_eq!(summary.run_id, store.audits()[0].run_id);
    }

    #[tokio::test]
    async fn run_log_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("imd_fetch_log.txt");
        let auditor = auditor().with_run_log(Some(log.clone()));
        let mut tally = RunTally::default();
        tally.record(RecordOutcome::Inserted);
        tally.record(RecordOutcome::Skipped {
            message: "ID=43003: bad RH".into(),
        });

        let mut store = MemoryObservationStore::new();
        auditor.write(&mut store, &tally, Utc::now()).await.unwrap();
        auditor.write(&mut store, &tally, Utc::now()).await.unwrap();

        let text = std::fs::read_to_string(&log).unwrap();
        assert_eq!(text.matches("Inserted: 1, Skipped: 1").count(), 2);
        assert!(text.contains("    Error: ID=43003: bad RH\n"));
    }

    #[test]
    fn log_entry_format() {
        let summary = RunSummary {
            run_id: 3,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            already_present: 0,
            audit: AuditRecord {
                records_inserted: 2,
                records_skipped: 0,
                error_messages: None,
                sys_user: "imd".into(),
                host_name: "wx-01".into(),
                remarks: "Daily IMD fetch".into(),
            },
            payload: None,
        };
        let at = Local.with_ymd_and_hms(2025, 8, 2, 17, 0, 5).single().unwrap();
        assert_eq!(
            format_run_log_entry(&summary, at),
            "[2025-08-02 17:00:05] Inserted: 2, Skipped: 0\n\n"
        );
    }
}
