// tests/common/mock_apis.rs
//! In-memory file and transcript servers.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use livesync_lib::files::{FileApi, FileApiError, FileSnapshot, Revision, SaveOutcome};
use livesync_lib::transcript::{
    HistoryPage, HistoryQuery, TranscriptApi, TranscriptError, TranscriptEvent,
};

#[derive(Default)]
pub struct MemoryFileApi {
    files: Mutex<HashMap<String, (String, u64)>>,
}

impl MemoryFileApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write as another client would. Returns the new revision.
    pub async fn write(&self, path: &str, content: &str) -> Revision {
        let mut files = self.files.lock().await;
        let revision = files.get(path).map(|(_, revision)| revision + 1).unwrap_or(1);
        files.insert(path.to_string(), (content.to_string(), revision));
        Revision::new(revision.to_string())
    }

    pub async fn content(&self, path: &str) -> Option<String> {
        self.files.lock().await.get(path).map(|(content, _)| content.clone())
    }
}

#[async_trait]
impl FileApi for MemoryFileApi {
    async fn load(&self, path: &str) -> Result<FileSnapshot, FileApiError> {
        let files = self.files.lock().await;
        let (content, revision) = files
            .get(path)
            .ok_or_else(|| FileApiError::NotFound(path.to_string()))?;
        Ok(FileSnapshot {
            content: content.clone(),
            revision: Revision::new(revision.to_string()),
        })
    }

    async fn save(
        &self,
        path: &str,
        content: &str,
        expected_revision: Option<&Revision>,
    ) -> Result<SaveOutcome, FileApiError> {
        let mut files = self.files.lock().await;
        let current = files.get(path).map(|(_, revision)| *revision).unwrap_or(0);
        if let Some(expected) = expected_revision {
            if expected.as_str() != current.to_string() {
                return Ok(SaveOutcome::Conflict {
                    current_revision: Some(Revision::new(current.to_string())),
                });
            }
        }
        files.insert(path.to_string(), (content.to_string(), current + 1));
        Ok(SaveOutcome::Saved {
            revision: Revision::new((current + 1).to_string()),
        })
    }
}

#[derive(Default)]
pub struct MemoryTranscriptApi {
    events: Mutex<HashMap<String, Vec<TranscriptEvent>>>,
}

impl MemoryTranscriptApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, conversation_id: &str, event: TranscriptEvent) {
        self.events
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .push(event);
    }
}

#[async_trait]
impl TranscriptApi for MemoryTranscriptApi {
    async fn history(
        &self,
        conversation_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, TranscriptError> {
        let all = self.events.lock().await;
        let events = all.get(conversation_id).cloned().unwrap_or_default();
        let end = query
            .before
            .as_ref()
            .and_then(|before| events.iter().position(|event| &event.id == before))
            .unwrap_or(events.len());
        let start = end.saturating_sub(query.limit);
        Ok(HistoryPage {
            events: events[start..end].to_vec(),
            has_more: start > 0,
            active_session: None,
        })
    }
}
