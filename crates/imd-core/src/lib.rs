//! Core domain model for the IMD weather fetch: raw feed records, the
//! destination column schema, sentinel normalization and run summaries.

pub mod normalize;
pub mod observation;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub use normalize::{normalize_record, NullSentinels};
pub use observation::{FieldError, FieldValue, ObservationKey, ObservationRow, RowError};

pub const CRATE_NAME: &str = "imd-core";

/// One feed record as delivered: field name to scalar JSON value.
pub type RawRecord = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Date,
    Time,
    Float,
    Int,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Date => "DATE",
            ColumnType::Time => "TIME",
            ColumnType::Float => "FLOAT",
            ColumnType::Int => "INT",
        }
    }

    /// Type name as reported in storage-layer input errors.
    pub fn display_name(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Time => "time without time zone",
            ColumnType::Float => "double precision",
            ColumnType::Int => "integer",
        }
    }
}

/// Destination column with the feed field(s) it is read from, in lookup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub feed_keys: &'static [&'static str],
    pub column_type: ColumnType,
    pub key: bool,
}

const fn col(name: &'static str, feed_keys: &'static [&'static str], column_type: ColumnType) -> ColumnSpec {
    ColumnSpec {
        name,
        feed_keys,
        column_type,
        key: false,
    }
}

const fn key_col(name: &'static str, feed_keys: &'static [&'static str], column_type: ColumnType) -> ColumnSpec {
    ColumnSpec {
        name,
        feed_keys,
        column_type,
        key: true,
    }
}

/// Destination table layout. Order is the insert order.
pub const OBSERVATION_COLUMNS: [ColumnSpec; 26] = [
    key_col("ID", &["ID"], ColumnType::Text),
    col("CALL_SIGN", &["CALL_SIGN"], ColumnType::Text),
    col("DISTRICT", &["DISTRICT"], ColumnType::Text),
    col("STATE", &["STATE"], ColumnType::Text),
    col("STATION", &["STATION"], ColumnType::Text),
    key_col("DATE", &["DATE"], ColumnType::Date),
    key_col("TIME", &["TIME"], ColumnType::Time),
    col("CURR_TEMP", &["CURR_TEMP"], ColumnType::Float),
    col("DEW_POINT_TEMP", &["DEW_POINT_TEMP"], ColumnType::Float),
    col("RH", &["RH"], ColumnType::Float),
    col("WIND_DIRECTION", &["WIND_DIRECTION"], ColumnType::Int),
    col("WIND_SPEED", &["WIND_SPEED"], ColumnType::Float),
    col("MSLP", &["MSLP"], ColumnType::Float),
    col("MIN_TEMP", &["MIN_TEMP"], ColumnType::Float),
    col("MAX_TEMP", &["MAX_TEMP"], ColumnType::Float),
    col("Latitude", &["Latitude"], ColumnType::Float),
    col("Longitude", &["Longitude"], ColumnType::Float),
    col("WEATHER_CODE", &["WEATHER_CODE"], ColumnType::Text),
    col("NEBULOSITY", &["NEBULOSITY"], ColumnType::Text),
    col("RAINFALL_SEL", &["RAINFALL_SEL"], ColumnType::Text),
    col("RAINFALL", &["RAINFALL"], ColumnType::Float),
    col("FEEL_LIKE", &["Feel Like", "FEEL_LIKE"], ColumnType::Float),
    col("WEATHER_ICON", &["WEATHER_ICON"], ColumnType::Text),
    col("WEATHER_MESSAGE", &["WEATHER_MESSAGE"], ColumnType::Text),
    col("BACKGROUND", &["BACKGROUND"], ColumnType::Text),
    col("BACKGROUND_URL", &["BACKGROUND_URL"], ColumnType::Text),
];

pub const KEY_COLUMNS: [&str; 3] = ["ID", "DATE", "TIME"];

pub fn column(name: &str) -> Option<&'static ColumnSpec> {
    OBSERVATION_COLUMNS.iter().find(|c| c.name == name)
}

/// Identifier used to tag per-record errors (`ID=<this>`).
pub fn record_id(record: &RawRecord) -> String {
    match record.get("ID") {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Null) | None => "null".to_string(),
        Some(other) => other.to_string(),
    }
}

/// The row persisted to the audit table, once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub records_inserted: u64,
    pub records_skipped: u64,
    pub error_messages: Option<String>,
    pub sys_user: String,
    pub host_name: String,
    pub remarks: String,
}

/// The payload a run consumed, identified by content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadInfo {
    pub sha256: String,
    pub byte_size: usize,
    /// Set when the raw body was kept in the payload archive.
    pub archived_to: Option<PathBuf>,
}

/// Outcome of one completed run, including the audit row as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Conflicting keys ignored by the store; already included in `records_inserted`.
    pub already_present: u64,
    pub audit: AuditRecord,
    pub payload: Option<PayloadInfo>,
}

impl RunSummary {
    pub fn inserted(&self) -> u64 {
        self.audit.records_inserted
    }

    pub fn skipped(&self) -> u64 {
        self.audit.records_skipped
    }

    pub fn processed(&self) -> u64 {
        self.audit.records_inserted + self.audit.records_skipped
    }

    pub fn errors(&self) -> Vec<&str> {
        self.audit
            .error_messages
            .as_deref()
            .map(|text| text.lines().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_has_fixed_key_and_column_order() {
        let names = OBSERVATION_COLUMNS.iter().map(|c| c.name).collect::<Vec<_>>();
        assert_eq!(names.len(), 26);
        assert_eq!(names.first(), Some(&"ID"));
        assert_eq!(names.last(), Some(&"BACKGROUND_URL"));

        let keys = OBSERVATION_COLUMNS
            .iter()
            .filter(|c| c.key)
            .map(|c| c.name)
            .collect::<Vec<_>>();
        assert_eq!(keys, KEY_COLUMNS.to_vec());
    }

    #[test]
    fn feel_like_reads_spaced_feed_key_first() {
        let spec = column("FEEL_LIKE").expect("column");
        assert_eq!(spec.feed_keys, &["Feel Like", "FEEL_LIKE"]);
        assert_eq!(spec.column_type, ColumnType::Float);
    }

    #[test]
    fn record_id_labels_strings_numbers_and_missing() {
        let rec = |v: serde_json::Value| v.as_object().cloned().unwrap();
        assert_eq!(record_id(&rec(json!({"ID": "42182"}))), "42182");
        assert_eq!(record_id(&rec(json!({"ID": 42182}))), "42182");
        assert_eq!(record_id(&rec(json!({"ID": null}))), "null");
        assert_eq!(record_id(&rec(json!({"STATION": "Delhi"}))), "null");
    }

    #[test]
    fn summary_splits_error_lines() {
        let summary = RunSummary {
            run_id: 7,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            already_present: 1,
            audit: AuditRecord {
                records_inserted: 3,
                records_skipped: 2,
                error_messages: Some("ID=1: bad\nID=2: worse".into()),
                sys_user: "imd".into(),
                host_name: "box".into(),
                remarks: "Daily IMD fetch".into(),
            },
            payload: None,
        };
        assert_eq!(summary.processed(), 5);
        assert_eq!(summary.errors(), vec!["ID=1: bad", "ID=2: worse"]);
    }
}
