//! Eventlog entry codec.
//!
//! Persisted form is one newline-terminated record per event:
//! `"<timestamp> <name> <context-json>"`, where the context is compact JSON
//! and may be omitted entirely when empty.

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EntryError {
    #[error("eventlog entry is malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventEntry {
    pub timestamp: f64,
    pub name: String,
    pub context: Value,
}

impl EventEntry {
    pub fn new(name: impl Into<String>, context: Value) -> Self {
        Self {
            timestamp: now_timestamp(),
            name: name.into(),
            context,
        }
    }

    pub fn at(timestamp: f64, name: impl Into<String>, context: Value) -> Self {
        Self {
            timestamp,
            name: name.into(),
            context,
        }
    }

    fn context_is_empty(&self) -> bool {
        match &self.context {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Render the newline-terminated persisted record.
    pub fn encode(&self) -> String {
        if self.context_is_empty() {
            format!("{:.6} {}\n", self.timestamp, self.name)
        } else {
            format!("{:.6} {} {}\n", self.timestamp, self.name, self.context)
        }
    }

    /// Parse one record (with or without trailing newline).
    pub fn decode(line: &str) -> Result<Self, EntryError> {
        let line = line.trim_end_matches('\n');
        let mut parts = line.splitn(3, ' ');
        let ts = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EntryError::Malformed("empty record".to_string()))?;
        let timestamp: f64 = ts
            .parse()
            .map_err(|_| EntryError::Malformed(format!("bad timestamp '{ts}'")))?;
        let name = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EntryError::Malformed("missing event name".to_string()))?
            .to_string();
        let context = match parts.next() {
            None | Some("") => Value::Object(Map::new()),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| EntryError::Malformed(format!("bad context: {e}")))?,
        };
        Ok(Self {
            timestamp,
            name,
            context,
        })
    }

    /// Parse a whole eventlog value into entries, in order.
    pub fn decode_log(log: &str) -> Result<Vec<Self>, EntryError> {
        log.lines()
            .filter(|line| !line.trim().is_empty())
            .map(Self::decode)
            .collect()
    }

    /// JSON form used by the journal and by `getattr eventlog`.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "timestamp": self.timestamp,
            "name": self.name,
            "context": self.context,
        })
    }
}

pub fn now_timestamp() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}
