//! Per-record insert-or-ignore with local recovery.

use std::fmt::Display;

use imd_core::{record_id, ObservationRow, RawRecord};

use crate::store::{InsertOutcome, ObservationStore};

/// What happened to one record. Only `Skipped` counts against the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    AlreadyPresent,
    Skipped { message: String },
}

/// Counters and error list owned by the run loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTally {
    pub inserted: u64,
    pub skipped: u64,
    pub already_present: u64,
    pub errors: Vec<String>,
}

impl RunTally {
    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Inserted => self.inserted += 1,
            // Ignored-by-conflict is reported as inserted; `already_present` is informational.
            RecordOutcome::AlreadyPresent => {
                self.inserted += 1;
                self.already_present += 1;
            }
            RecordOutcome::Skipped { message } => {
                self.skipped += 1;
                self.errors.push(message);
            }
        }
    }

    pub fn processed(&self) -> u64 {
        self.inserted + self.skipped
    }

    /// Newline-joined errors, or `None` when the run had none.
    pub fn error_text(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("\n"))
        }
    }
}

pub fn skip_message(id: &str, err: impl Display) -> String {
    format!("ID={id}: {err}")
}

pub struct UpsertSink<'a> {
    store: &'a mut dyn ObservationStore,
}

impl<'a> UpsertSink<'a> {
    pub fn new(store: &'a mut dyn ObservationStore) -> Self {
        Self { store }
    }

    /// Type and write one normalized record. Never fails: errors become `Skipped`.
    pub async fn upsert(&mut self, record: &RawRecord) -> RecordOutcome {
        let id = record_id(record);
        let row = match ObservationRow::from_record(record) {
            Ok(row) => row,
            Err(err) => {
                return RecordOutcome::Skipped {
                    message: skip_message(&id, err),
                }
            }
        };

        match self.store.insert_observation(&row).await {
            Ok(InsertOutcome::Inserted) => RecordOutcome::Inserted,
            Ok(InsertOutcome::AlreadyPresent) => RecordOutcome::AlreadyPresent,
            Err(err) => RecordOutcome::Skipped {
                message: skip_message(&id, err),
            },
        }
    }
}
