use std::path::PathBuf;

use anyhow::Result;
use chrono::{Local, TimeZone};
use clap::{Args, Parser, Subcommand};
use imd_core::RunSummary;
use imd_sync::ImdConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "imd-fetch")]
#[command(about = "Fetch IMD weather observations into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    overrides: ConfigArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the feed, insert new observations and write the audit row.
    Run,
    /// Print the CREATE TABLE statements and exit.
    Schema,
}

/// Flags that override the `IMD_*` / `DATABASE_URL` environment.
#[derive(Debug, Args)]
struct ConfigArgs {
    #[arg(long, global = true)]
    feed_url: Option<String>,

    #[arg(long, global = true)]
    database_url: Option<String>,

    #[arg(long, global = true)]
    table: Option<String>,

    #[arg(long, global = true)]
    audit_table: Option<String>,

    /// Read records from a local JSON file instead of the feed.
    #[arg(long, global = true)]
    input: Option<PathBuf>,

    /// Use an in-memory store; nothing is written to the database.
    #[arg(long, global = true)]
    dry_run: bool,
}

impl ConfigArgs {
    fn apply(&self, config: &mut ImdConfig) {
        if let Some(url) = &self.feed_url {
            config.feed_url = Some(url.clone());
        }
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(table) = &self.table {
            config.table_name = table.clone();
        }
        if let Some(table) = &self.audit_table {
            config.audit_table = table.clone();
        }
        if let Some(path) = &self.input {
            config.input_path = Some(path.clone());
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

/// The stdout report for one run, with the finish time shown in `tz`.
fn summary_lines<Tz: TimeZone>(summary: &RunSummary, tz: &Tz, dry_run: bool) -> Vec<String>
where
    Tz::Offset: std::fmt::Display,
{
    let mut lines = vec![format!(
        "Inserted: {}, Skipped: {}",
        summary.inserted(),
        summary.skipped()
    )];
    lines.extend(summary.errors().into_iter().map(|message| format!("Error: {message}")));
    lines.push(format!(
        "Data inserted at: {}",
        summary.finished_at.with_timezone(tz).format("%Y-%m-%d %H:%M:%S")
    ));
    if dry_run {
        lines.push(format!("dry run: nothing written (run_id={})", summary.run_id));
    } else {
        lines.push(format!("audit run_id={}", summary.run_id));
    }
    lines
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = ImdConfig::from_env();
    cli.overrides.apply(&mut config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = imd_sync::run_once_with_config(&config, cli.overrides.dry_run).await?;
            for line in summary_lines(&summary, &Local, cli.overrides.dry_run) {
                println!("{line}");
            }
        }
        Commands::Schema => {
            config.validate_tables()?;
            print!("{}", imd_sync::schema_sql(&config));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};
    use imd_core::AuditRecord;

    fn summary() -> RunSummary {
        let finished_at = Utc.with_ymd_and_hms(2025, 8, 2, 6, 0, 5).unwrap();
        RunSummary {
            run_id: 12,
            started_at: finished_at,
            finished_at,
            already_present: 0,
            audit: AuditRecord {
                records_inserted: 4,
                records_skipped: 1,
                error_messages: Some("ID=9: bad RH".into()),
                sys_user: "imd".into(),
                host_name: "wx-01".into(),
                remarks: "Daily IMD fetch".into(),
            },
            payload: None,
        }
    }

    #[test]
    fn finish_time_is_printed_in_the_given_zone() {
        let ist = FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap();
        let lines = summary_lines(&summary(), &ist, false);
        assert_eq!(
            lines,
            vec![
                "Inserted: 4, Skipped: 1",
                "Error: ID=9: bad RH",
                "Data inserted at: 2025-08-02 11:30:05",
                "audit run_id=12",
            ]
        );
    }

    #[test]
    fn local_zone_matches_chrono_local() {
        let summary = summary();
        let lines = summary_lines(&summary, &Local, true);
        let expected = summary.finished_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
        assert_eq!(lines[2], format!("Data inserted at: {expected}"));
        assert_eq!(lines[3], "dry run: nothing written (run_id=12)");
    }
}
