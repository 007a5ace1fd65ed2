use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imd_core::{AuditRecord, ObservationKey, ObservationRow};

use super::{InsertOutcome, ObservationStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAuditRow {
    pub run_id: i64,
    pub inserted_at: DateTime<Utc>,
    pub record: AuditRecord,
}

/// In-process store with the same key and batch semantics as the Postgres store.
///
/// Backs `--dry-run` and the pipeline tests. Rows written in a batch become
/// visible only on `commit_batch`.
#[derive(Debug, Default)]
pub struct MemoryObservationStore {
    rows: BTreeMap<ObservationKey, ObservationRow>,
    pending: Option<BTreeMap<ObservationKey, ObservationRow>>,
    audits: Vec<MemoryAuditRow>,
    rejected_ids: HashSet<String>,
    schema_ready: bool,
    closed: bool,
}

impl MemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make inserts for this station id fail the way a constraint violation would.
    pub fn reject_id(mut self, id: impl Into<String>) -> Self {
        self.rejected_ids.insert(id.into());
        self
    }

    pub fn rows(&self) -> impl Iterator<Item = &ObservationRow> {
        self.rows.values()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn contains(&self, key: &ObservationKey) -> bool {
        self.rows.contains_key(key)
    }

    pub fn audits(&self) -> &[MemoryAuditRow] {
        &self.audits
    }

    pub fn schema_ready(&self) -> bool {
        self.schema_ready
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl ObservationStore for MemoryObservationStore {
    fn describe(&self) -> String {
        format!("in-memory store ({} rows)", self.rows.len())
    }

    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        self.schema_ready = true;
        self.closed = false;
        Ok(())
    }

    async fn begin_batch(&mut self) -> Result<(), StoreError> {
        self.pending = Some(BTreeMap::new());
        Ok(())
    }

    async fn insert_observation(&mut self, row: &ObservationRow) -> Result<InsertOutcome, StoreError> {
        let pending = self.pending.as_mut().ok_or(StoreError::NoBatch)?;
        let key = row.key();
        if self.rejected_ids.contains(&key.id) {
            return Err(StoreError::Rejected(format!(
                "insert for station {} violates a table constraint",
                key.id
            )));
        }
        if self.rows.contains_key(key) || pending.contains_key(key) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        pending.insert(key.clone(), row.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn commit_batch(&mut self) -> Result<(), StoreError> {
        if let Some(pending) = self.pending.take() {
            self.rows.extend(pending);
        }
        Ok(())
    }

    async fn write_audit(&mut self, audit: &AuditRecord) -> Result<i64, StoreError> {
        let run_id = self.audits.len() as i64 + 1;
        self.audits.push(MemoryAuditRow {
            run_id,
            inserted_at: Utc::now(),
            record: audit.clone(),
        });
        Ok(run_id)
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.pending = None;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, time: &str) -> ObservationRow {
        let record = json!({"ID": id, "DATE": "2025-08-02", "TIME": time})
            .as_object()
            .cloned()
            .unwrap();
        ObservationRow::from_record(&record).unwrap()
    }

    #[tokio::test]
    async fn rows_are_visible_only_after_commit() {
        let mut store = MemoryObservationStore::new();
        store.begin_batch().await.unwrap();
        let r = row("42182", "11:30");
        assert_eq!(store.insert_observation(&r).await.unwrap(), InsertOutcome::Inserted);
        assert!(!store.contains(r.key()));
        store.commit_batch().await.unwrap();
        assert!(store.contains(r.key()));
    }

    #[tokio::test]
    async fn duplicate_keys_are_ignored_within_and_across_batches() {
        let mut store = MemoryObservationStore::new();
        store.begin_batch().await.unwrap();
        let r = row("42182", "11:30");
        store.insert_observation(&r).await.unwrap();
        assert_eq!(store.insert_observation(&r).await.unwrap(), InsertOutcome::AlreadyPresent);
        store.commit_batch().await.unwrap();

        store.begin_batch().await.unwrap();
        assert_eq!(store.insert_observation(&r).await.unwrap(), InsertOutcome::AlreadyPresent);
        assert_eq!(
            store.insert_observation(&row("42182", "14:30")).await.unwrap(),
            InsertOutcome::Inserted
        );
        store.commit_batch().await.unwrap();
        assert_eq!(store.row_count(), 2);
    }

    #[tokio::test]
    async fn insert_without_batch_fails() {
        let mut store = MemoryObservationStore::new();
        let err = store.insert_observation(&row("1", "00:00")).await.unwrap_err();
        assert!(matches!(err, StoreError::NoBatch));
    }

    #[tokio::test]
    async fn close_drops_uncommitted_rows() {
        let mut store = MemoryObservationStore::new();
        store.begin_batch().await.unwrap();
        store.insert_observation(&row("1", "00:00")).await.unwrap();
        store.close().await.unwrap();
        assert_eq!(store.row_count(), 0);
        assert!(store.is_closed());
    }
}
