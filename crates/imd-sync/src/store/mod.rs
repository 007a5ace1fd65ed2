//! Destination storage for observations and run audits.

mod memory;
mod postgres;

use async_trait::async_trait;
use imd_core::{AuditRecord, ObservationRow, KEY_COLUMNS, OBSERVATION_COLUMNS};
use thiserror::Error;

pub use memory::{MemoryAuditRow, MemoryObservationStore};
pub use postgres::PgObservationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The identity key was already stored; nothing was written.
    AlreadyPresent,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("no write batch is open")]
    NoBatch,
    #[error("{0}")]
    Rejected(String),
    #[error("{field} value {value} does not fit the audit table")]
    Overflow { field: &'static str, value: u64 },
}

/// Write API the pipeline needs from the relational store.
///
/// Rows go through a batch: `begin_batch`, any number of
/// `insert_observation` calls (each isolated, so a failure leaves earlier rows
/// intact), then `commit_batch`. The audit write happens outside the batch.
#[async_trait]
pub trait ObservationStore: Send {
    fn describe(&self) -> String;

    async fn ensure_schema(&mut self) -> Result<(), StoreError>;

    async fn begin_batch(&mut self) -> Result<(), StoreError>;

    async fn insert_observation(&mut self, row: &ObservationRow) -> Result<InsertOutcome, StoreError>;

    async fn commit_batch(&mut self) -> Result<(), StoreError>;

    /// Persist the run's audit row and return its run id.
    async fn write_audit(&mut self, audit: &AuditRecord) -> Result<i64, StoreError>;

    async fn close(&mut self) -> Result<(), StoreError>;
}

pub fn observation_table_ddl(table: &str) -> String {
    let columns = OBSERVATION_COLUMNS
        .iter()
        .map(|c| format!("    {} {}", c.name, c.column_type.sql_type()))
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n{columns},\n    PRIMARY KEY ({})\n)",
        KEY_COLUMNS.join(", ")
    )
}

pub fn audit_table_ddl(audit_table: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {audit_table} (
    run_id SERIAL PRIMARY KEY,
    inserted_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    records_inserted INT,
    records_skipped INT,
    error_messages TEXT,
    sys_user TEXT,
    host_name TEXT,
    remarks TEXT
)"#
    )
}

pub fn insert_observation_sql(table: &str) -> String {
    let names = OBSERVATION_COLUMNS
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ");
    let params = (1..=OBSERVATION_COLUMNS.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({names}) VALUES ({params}) ON CONFLICT ({}) DO NOTHING",
        KEY_COLUMNS.join(", ")
    )
}

pub fn insert_audit_sql(audit_table: &str) -> String {
    format!(
        "INSERT INTO {audit_table} (records_inserted, records_skipped, error_messages, sys_user, host_name, remarks) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING run_id"
    )
}
