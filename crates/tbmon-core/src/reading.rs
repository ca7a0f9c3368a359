//! Telemetry readings

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A single timestamped set of telemetry values produced by one sensor read.
///
/// Timestamps are kept at millisecond precision so a reading that is cached
/// and replayed later round-trips without drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Capture time
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Telemetry key -> value
    pub values: BTreeMap<String, Value>,
}

impl Reading {
    /// Create an empty reading stamped with the current time
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Create an empty reading stamped with the given time (truncated to ms)
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        let millis = timestamp.timestamp_millis();
        let timestamp = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or(timestamp);
        Self {
            timestamp,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style insert
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Capture time as Unix milliseconds
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// JSON body for the telemetry endpoint.
    ///
    /// The explicit `ts` keeps server-side ordering correct for readings that
    /// are delivered late from the cache.
    pub fn to_payload(&self) -> Value {
        json!({
            "ts": self.timestamp_millis(),
            "values": self.values,
        })
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self::new()
    }
}
