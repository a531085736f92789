use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::event_types;
use crate::stream::StreamError;

/// A typed, timestamped fact about a server-side state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Dot-namespaced tag, e.g. `worker.completed`.
    pub kind: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Generic-channel frame body: `{type, data, timestamp}`.
#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<Value>,
}

impl ChangeNotification {
    pub fn new(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Decode the JSON body of a generic-channel frame.
    pub fn from_json(raw: &str) -> Result<Self, StreamError> {
        let wire: WireMessage = serde_json::from_str(raw)
            .map_err(|e| StreamError::SseParse(format!("invalid notification: {e}")))?;

        if wire.kind.trim().is_empty() {
            return Err(StreamError::SseParse("notification without type".to_string()));
        }

        let payload = match wire.data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        Ok(Self {
            kind: wire.kind,
            payload,
            timestamp: wire
                .timestamp
                .as_ref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
        })
    }

    /// Part of the kind before the first dot.
    pub fn namespace(&self) -> &str {
        self.kind.split('.').next().unwrap_or(&self.kind)
    }

    pub fn is_heartbeat(&self) -> bool {
        event_types::is_heartbeat(&self.kind)
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// RFC 3339 strings, or epoch numbers in seconds or milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(number) => {
            let raw = number.as_f64()?;
            let millis = if raw.abs() >= 1e12 { raw } else { raw * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}
