use std::time::Duration;

use async_trait::async_trait;
use imd_core::{AuditRecord, ColumnType, ObservationRow};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Acquire, PgPool, Postgres, Row, Transaction};
use tracing::debug;

use super::{
    audit_table_ddl, insert_audit_sql, insert_observation_sql, observation_table_ddl, InsertOutcome,
    ObservationStore, StoreError,
};
use crate::config::ImdConfig;

/// PostgreSQL-backed store holding a single pooled connection for the run.
///
/// The open batch is a transaction; each row is written under its own
/// savepoint. Dropping the store without committing rolls the batch back.
pub struct PgObservationStore {
    pool: PgPool,
    table: String,
    audit_table: String,
    insert_sql: String,
    batch: Option<Transaction<'static, Postgres>>,
}

impl PgObservationStore {
    pub async fn connect(config: &ImdConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
            .connect(&config.database_url)
            .await?;
        Ok(Self::from_pool(pool, &config.table_name, &config.audit_table))
    }

    pub fn from_pool(pool: PgPool, table: &str, audit_table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
            audit_table: audit_table.to_string(),
            insert_sql: insert_observation_sql(table),
            batch: None,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_row<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    row: &ObservationRow,
) -> Query<'q, Postgres, PgArguments> {
    for (spec, value) in row.columns() {
        query = match spec.column_type {
            ColumnType::Text => query.bind(value.as_text().map(str::to_owned)),
            ColumnType::Float => query.bind(value.as_float()),
            ColumnType::Int => query.bind(value.as_int()),
            ColumnType::Date => query.bind(value.as_date()),
            ColumnType::Time => query.bind(value.as_time()),
        };
    }
    query
}

fn audit_count(field: &'static str, value: u64) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Overflow { field, value })
}

#[async_trait]
impl ObservationStore for PgObservationStore {
    fn describe(&self) -> String {
        format!("postgres table {} (audit {})", self.table, self.audit_table)
    }

    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        sqlx::query(&observation_table_ddl(&self.table))
            .execute(&self.pool)
            .await?;
        sqlx::query(&audit_table_ddl(&self.audit_table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin_batch(&mut self) -> Result<(), StoreError> {
        self.batch = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn insert_observation(&mut self, row: &ObservationRow) -> Result<InsertOutcome, StoreError> {
        let tx = self.batch.as_mut().ok_or(StoreError::NoBatch)?;
        let mut savepoint = tx.begin().await?;

        let result = bind_row(sqlx::query(&self.insert_sql), row)
            .execute(&mut *savepoint)
            .await;

        match result {
            Ok(done) => {
                savepoint.commit().await?;
                if done.rows_affected() == 0 {
                    Ok(InsertOutcome::AlreadyPresent)
                } else {
                    Ok(InsertOutcome::Inserted)
                }
            }
            Err(err) => {
                savepoint.rollback().await?;
                Err(StoreError::Database(err))
            }
        }
    }

    async fn commit_batch(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.batch.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn write_audit(&mut self, audit: &AuditRecord) -> Result<i64, StoreError> {
        let row = sqlx::query(&insert_audit_sql(&self.audit_table))
            .bind(audit_count("records_inserted", audit.records_inserted)?)
            .bind(audit_count("records_skipped", audit.records_skipped)?)
            .bind(audit.error_messages.as_deref())
            .bind(audit.sys_user.as_str())
            .bind(audit.host_name.as_str())
            .bind(audit.remarks.as_str())
            .fetch_one(&self.pool)
            .await?;
        let run_id: i32 = row.try_get("run_id")?;
        Ok(i64::from(run_id))
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.batch.take() {
            debug!("rolling back uncommitted batch on close");
            tx.rollback().await?;
        }
        self.pool.close().await;
        Ok(())
    }
}
