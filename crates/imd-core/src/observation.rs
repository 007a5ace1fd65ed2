//! Typed observation rows built from normalized feed records.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{ColumnSpec, ColumnType, RawRecord, OBSERVATION_COLUMNS};

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];
const TIME_FORMATS: [&str; 5] = ["%H:%M:%S", "%H:%M:%S%.f", "%H:%M", "%H%M%S", "%H%M"];

static ABSENT: JsonValue = JsonValue::Null;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Float(f64),
    Int(i32),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<NaiveTime> {
        match self {
            FieldValue::Time(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("invalid input syntax for type {expected}: \"{value}\"")]
    InvalidSyntax { expected: &'static str, value: String },
    #[error("value of type {found} cannot be stored as {expected}")]
    Unsupported {
        expected: &'static str,
        found: &'static str,
    },
    #[error("value \"{value}\" is out of range for type {expected}")]
    OutOfRange { expected: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("column {column}: {source}")]
    Field {
        column: &'static str,
        #[source]
        source: FieldError,
    },
    #[error("null value in column {column} violates not-null constraint")]
    MissingKey { column: &'static str },
}

/// Identity of an observation in the destination table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObservationKey {
    pub id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

/// A record typed against [`OBSERVATION_COLUMNS`], one value per column in order.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationRow {
    key: ObservationKey,
    values: Vec<FieldValue>,
}

impl ObservationRow {
    pub fn from_record(record: &RawRecord) -> Result<Self, RowError> {
        let mut values = Vec::with_capacity(OBSERVATION_COLUMNS.len());
        for spec in &OBSERVATION_COLUMNS {
            let value = type_value(spec.column_type, lookup(record, spec))
                .map_err(|source| RowError::Field {
                    column: spec.name,
                    source,
                })?;
            if spec.key && value.is_null() {
                return Err(RowError::MissingKey { column: spec.name });
            }
            values.push(value);
        }

        let value_of = |name: &str| {
            OBSERVATION_COLUMNS
                .iter()
                .zip(values.iter())
                .find(|(spec, _)| spec.name == name)
                .map(|(_, value)| value)
        };
        let key = match (value_of("ID"), value_of("DATE"), value_of("TIME")) {
            (Some(FieldValue::Text(id)), Some(FieldValue::Date(date)), Some(FieldValue::Time(time))) => {
                ObservationKey {
                    id: id.clone(),
                    date: *date,
                    time: *time,
                }
            }
            _ => return Err(RowError::MissingKey { column: "ID" }),
        };

        Ok(Self { key, values })
    }

    pub fn key(&self) -> &ObservationKey {
        &self.key
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn columns(&self) -> impl Iterator<Item = (&'static ColumnSpec, &FieldValue)> {
        OBSERVATION_COLUMNS.iter().zip(self.values.iter())
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.columns()
            .find(|(spec, _)| spec.name == column)
            .map(|(_, value)| value)
    }
}

fn lookup<'a>(record: &'a RawRecord, spec: &ColumnSpec) -> &'a JsonValue {
    spec.feed_keys
        .iter()
        .filter_map(|key| record.get(*key))
        .find(|value| !value.is_null())
        .unwrap_or(&ABSENT)
}

/// `inf`, `infinity` and `nan` spelled out, as double precision input accepts them.
fn is_special_float(text: &str) -> bool {
    let lowered = text.trim().to_ascii_lowercase();
    let unsigned = lowered
        .strip_prefix(|c: char| c == '+' || c == '-')
        .unwrap_or(lowered.as_str());
    matches!(unsigned, "inf" | "infinity" | "nan")
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn type_value(column_type: ColumnType, value: &JsonValue) -> Result<FieldValue, FieldError> {
    if value.is_null() {
        return Ok(FieldValue::Null);
    }
    let expected = column_type.display_name();
    let unsupported = || FieldError::Unsupported {
        expected,
        found: json_kind(value),
    };

    match column_type {
        ColumnType::Text => match value {
            JsonValue::String(s) => Ok(FieldValue::Text(s.clone())),
            JsonValue::Number(n) => Ok(FieldValue::Text(n.to_string())),
            JsonValue::Bool(b) => Ok(FieldValue::Text(b.to_string())),
            _ => Err(unsupported()),
        },
        ColumnType::Float => match value {
            JsonValue::Number(n) => n.as_f64().map(FieldValue::Float).ok_or_else(unsupported),
            JsonValue::String(s) => match s.trim().parse::<f64>() {
                Ok(v) if v.is_finite() || is_special_float(s) => Ok(FieldValue::Float(v)),
                Ok(_) => Err(FieldError::OutOfRange {
                    expected,
                    value: s.clone(),
                }),
                Err(_) => Err(FieldError::InvalidSyntax {
                    expected,
                    value: s.clone(),
                }),
            },
            _ => Err(unsupported()),
        },
        ColumnType::Int => match value {
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i32::try_from(i)
                        .map(FieldValue::Int)
                        .map_err(|_| FieldError::OutOfRange {
                            expected,
                            value: n.to_string(),
                        })
                } else {
                    let rounded = n.as_f64().ok_or_else(unsupported)?.round();
                    if rounded >= f64::from(i32::MIN) && rounded <= f64::from(i32::MAX) {
                        Ok(FieldValue::Int(rounded as i32))
                    } else {
                        Err(FieldError::OutOfRange {
                            expected,
                            value: n.to_string(),
                        })
                    }
                }
            }
            JsonValue::String(s) => match s.trim().parse::<i64>() {
                Ok(i) => i32::try_from(i)
                    .map(FieldValue::Int)
                    .map_err(|_| FieldError::OutOfRange {
                        expected,
                        value: s.clone(),
                    }),
                Err(_) => Err(FieldError::InvalidSyntax {
                    expected,
                    value: s.clone(),
                }),
            },
            _ => Err(unsupported()),
        },
        ColumnType::Date => match value {
            JsonValue::String(s) => DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s.trim(), fmt).ok())
                .map(FieldValue::Date)
                .ok_or_else(|| FieldError::InvalidSyntax {
                    expected,
                    value: s.clone(),
                }),
            _ => Err(unsupported()),
        },
        ColumnType::Time => match value {
            JsonValue::String(s) => TIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveTime::parse_from_str(s.trim(), fmt).ok())
                .map(FieldValue::Time)
                .ok_or_else(|| FieldError::InvalidSyntax {
                    expected,
                    value: s.clone(),
                }),
            _ => Err(unsupported()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: JsonValue) -> RawRecord {
        v.as_object().cloned().expect("object")
    }

    fn base() -> RawRecord {
        record(json!({
            "ID": "42182",
            "CALL_SIGN": "VIDD",
            "DISTRICT": "New Delhi",
            "STATE": "Delhi",
            "STATION": "Safdarjung",
            "DATE": "2025-08-02",
            "TIME": "11:30:00",
            "CURR_TEMP": "31.4",
            "RH": 78,
            "WIND_DIRECTION": "270",
            "Latitude": 28.58,
            "Feel Like": "38.2",
            "WEATHER_MESSAGE": "Haze"
        }))
    }

    #[test]
    fn types_a_complete_record() {
        let row = ObservationRow::from_record(&base()).expect("row");
        assert_eq!(row.values().len(), OBSERVATION_COLUMNS.len());
        assert_eq!(row.key().id, "42182");
        assert_eq!(row.key().date, NaiveDate::from_ymd_opt(2025, 8, 2).unwrap());
        assert_eq!(row.key().time, NaiveTime::from_hms_opt(11, 30, 0).unwrap());
        assert_eq!(row.get("CURR_TEMP"), Some(&FieldValue::Float(31.4)));
        assert_eq!(row.get("RH"), Some(&FieldValue::Float(78.0)));
        assert_eq!(row.get("WIND_DIRECTION"), Some(&FieldValue::Int(270)));
        assert_eq!(row.get("FEEL_LIKE"), Some(&FieldValue::Float(38.2)));
        assert_eq!(row.get("MSLP"), Some(&FieldValue::Null));
    }

    #[test]
    fn non_numeric_text_in_float_column_is_rejected() {
        let mut rec = base();
        rec.insert("CURR_TEMP".into(), json!("warm"));
        let err = ObservationRow::from_record(&rec).unwrap_err();
        assert_eq!(
            err,
            RowError::Field {
                column: "CURR_TEMP",
                source: FieldError::InvalidSyntax {
                    expected: "double precision",
                    value: "warm".into()
                }
            }
        );
        assert!(err.to_string().contains("double precision"));
    }

    #[test]
    fn integer_column_rounds_floats_and_rejects_decimal_text() {
        let mut rec = base();
        rec.insert("WIND_DIRECTION".into(), json!(269.6));
        let row = ObservationRow::from_record(&rec).expect("row");
        assert_eq!(row.get("WIND_DIRECTION"), Some(&FieldValue::Int(270)));

        rec.insert("WIND_DIRECTION".into(), json!("269.6"));
        assert!(matches!(
            ObservationRow::from_record(&rec),
            Err(RowError::Field {
                column: "WIND_DIRECTION",
                source: FieldError::InvalidSyntax { .. }
            })
        ));

        rec.insert("WIND_DIRECTION".into(), json!(9_000_000_000i64));
        assert!(matches!(
            ObservationRow::from_record(&rec),
            Err(RowError::Field {
                source: FieldError::OutOfRange { expected: "integer", .. },
                ..
            })
        ));
    }

    #[test]
    fn overflowing_float_text_is_out_of_range() {
        let mut rec = base();
        rec.insert("MSLP".into(), json!("1e400"));
        assert_eq!(
            ObservationRow::from_record(&rec).unwrap_err(),
            RowError::Field {
                column: "MSLP",
                source: FieldError::OutOfRange {
                    expected: "double precision",
                    value: "1e400".into()
                }
            }
        );

        rec.insert("MSLP".into(), json!("-Infinity"));
        let row = ObservationRow::from_record(&rec).expect("row");
        assert_eq!(row.get("MSLP").and_then(FieldValue::as_float), Some(f64::NEG_INFINITY));

        rec.insert("MSLP".into(), json!("NaN"));
        let row = ObservationRow::from_record(&rec).expect("row");
        assert!(row.get("MSLP").and_then(FieldValue::as_float).is_some_and(f64::is_nan));
    }

    #[test]
    fn missing_or_null_key_column_is_rejected() {
        let mut rec = base();
        rec.remove("TIME");
        assert_eq!(
            ObservationRow::from_record(&rec).unwrap_err(),
            RowError::MissingKey { column: "TIME" }
        );

        let mut rec = base();
        rec.insert("ID".into(), JsonValue::Null);
        assert_eq!(
            ObservationRow::from_record(&rec).unwrap_err(),
            RowError::MissingKey { column: "ID" }
        );
    }

    #[test]
    fn numeric_id_is_stored_as_text() {
        let mut rec = base();
        rec.insert("ID".into(), json!(42182));
        let row = ObservationRow::from_record(&rec).expect("row");
        assert_eq!(row.key().id, "42182");
    }

    #[test]
    fn accepts_compact_and_short_time_forms() {
        for (input, expected) in [("1130", (11, 30, 0)), ("113015", (11, 30, 15)), ("08:45", (8, 45, 0))] {
            let mut rec = base();
            rec.insert("TIME".into(), json!(input));
            let row = ObservationRow::from_record(&rec).expect(input);
            let (h, m, s) = expected;
            assert_eq!(row.key().time, NaiveTime::from_hms_opt(h, m, s).unwrap());
        }
    }

    #[test]
    fn bad_date_and_structured_values_are_rejected() {
        let mut rec = base();
        rec.insert("DATE".into(), json!("02-08-2025"));
        assert!(matches!(
            ObservationRow::from_record(&rec),
            Err(RowError::Field { column: "DATE", .. })
        ));

        let mut rec = base();
        rec.insert("STATION".into(), json!({"name": "Safdarjung"}));
        assert!(matches!(
            ObservationRow::from_record(&rec),
            Err(RowError::Field {
                column: "STATION",
                source: FieldError::Unsupported { found: "object", .. }
            })
        ));
    }

    #[test]
    fn feel_like_falls_back_to_column_name() {
        let mut rec = base();
        rec.remove("Feel Like");
        rec.insert("FEEL_LIKE".into(), json!(36.0));
        let row = ObservationRow::from_record(&rec).expect("row");
        assert_eq!(row.get("FEEL_LIKE"), Some(&FieldValue::Float(36.0)));
    }
}
