use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const KIND_SESSION_BOUNDARY: &str = "session_boundary";

/// One entry of a conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Backend session that produced the event. On a boundary marker this
    /// is the session taking over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl TranscriptEvent {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            timestamp: None,
            session_id: None,
            body: Map::new(),
        }
    }

    pub fn session_boundary(id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let mut event = Self::new(id, KIND_SESSION_BOUNDARY);
        event.session_id = Some(session_id.into());
        event
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    pub fn is_session_boundary(&self) -> bool {
        self.kind == KIND_SESSION_BOUNDARY
    }
}
