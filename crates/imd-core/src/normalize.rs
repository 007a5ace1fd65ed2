//! Sentinel normalization for raw feed records.

use serde_json::Value as JsonValue;

use crate::RawRecord;

/// Text placeholders the feed uses to mean "no data". JSON null always counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullSentinels(Vec<String>);

impl Default for NullSentinels {
    fn default() -> Self {
        Self(vec!["NULL".to_string()])
    }
}

impl NullSentinels {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    /// Parse a comma-separated list; blank entries are dropped.
    pub fn parse_list(input: &str) -> Self {
        Self::new(
            input
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        )
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn is_sentinel(&self, value: &JsonValue) -> bool {
        match value {
            JsonValue::Null => true,
            JsonValue::String(s) => self.0.iter().any(|sentinel| sentinel == s),
            _ => false,
        }
    }
}

/// Replace sentinel values with JSON null in place and return how many were replaced.
///
/// The key set is left untouched, and a second pass is a no-op.
pub fn normalize_record(record: &mut RawRecord, sentinels: &NullSentinels) -> usize {
    let mut replaced = 0;
    for value in record.values_mut() {
        if !value.is_null() && sentinels.is_sentinel(value) {
            *value = JsonValue::Null;
            replaced += 1;
        }
    }
    replaced
}
