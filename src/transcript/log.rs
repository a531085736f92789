use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use super::TranscriptEvent;

/// Ordered, deduplicated transcript of one conversation.
///
/// `events` only ever grows: live events are appended, older history is
/// prepended. The cursor is always the id of the last event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationLog {
    conversation_id: String,
    events: Vec<TranscriptEvent>,
    #[serde(skip)]
    ids: HashSet<String>,
    /// Session new input should be sent to. Moves on every boundary marker.
    pub active_session: Option<String>,
    pub history_loaded: bool,
    pub has_more_earlier: bool,
    /// Last history fetch failure for this conversation only.
    pub load_error: Option<String>,
    pub ended: bool,
    pub activity: Option<Value>,
    pub tasks: Option<Value>,
    pub session_meta: Option<Value>,
    pub last_stream_error: Option<String>,
}

impl ConversationLog {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Self::default()
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn events(&self) -> &[TranscriptEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Id of the newest event, sent as the resume marker on reconnect.
    pub fn cursor(&self) -> Option<&str> {
        self.events.last().map(|event| event.id.as_str())
    }

    pub fn earliest_id(&self) -> Option<&str> {
        self.events.first().map(|event| event.id.as_str())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.events.iter().map(|event| event.id.as_str()).collect()
    }

    /// Append a live event. Returns false (and changes nothing) when the id
    /// is already present.
    pub fn append(&mut self, event: TranscriptEvent) -> bool {
        if !self.ids.insert(event.id.clone()) {
            return false;
        }
        if event.is_session_boundary() {
            if let Some(session) = &event.session_id {
                self.active_session = Some(session.clone());
            }
        }
        self.events.push(event);
        true
    }

    /// Append in order, skipping duplicates. Returns how many were added.
    pub fn extend(&mut self, events: impl IntoIterator<Item = TranscriptEvent>) -> usize {
        events
            .into_iter()
            .map(|event| self.append(event))
            .filter(|added| *added)
            .count()
    }

    /// Insert an older page (oldest first) in front of the current events.
    /// Ids already present are dropped. Boundaries in older history do not
    /// move the active session.
    pub fn prepend(&mut self, older: Vec<TranscriptEvent>) -> usize {
        let mut fresh = Vec::with_capacity(older.len());
        for event in older {
            if self.ids.insert(event.id.clone()) {
                fresh.push(event);
            }
        }
        let added = fresh.len();
        if added > 0 {
            fresh.append(&mut self.events);
            self.events = fresh;
        }
        added
    }
}
