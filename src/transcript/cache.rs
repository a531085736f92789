use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{ConversationLog, HistoryQuery, TranscriptApi, TranscriptError, TranscriptEvent};
use crate::config::SyncConfig;

const CHANGE_CAPACITY: usize = 256;

struct CacheInner {
    api: Arc<dyn TranscriptApi>,
    logs: DashMap<String, ConversationLog>,
    page_size: usize,
    changes: broadcast::Sender<String>,
}

/// Conversation logs keyed by conversation id.
#[derive(Clone)]
pub struct TranscriptCache {
    inner: Arc<CacheInner>,
}

impl TranscriptCache {
    pub fn new(api: Arc<dyn TranscriptApi>, page_size: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(CacheInner {
                api,
                logs: DashMap::new(),
                page_size,
                changes,
            }),
        }
    }

    pub fn from_config(api: Arc<dyn TranscriptApi>, config: &SyncConfig) -> Self {
        Self::new(api, config.history_page_size)
    }

    /// Snapshot of the log, creating an empty one on first use.
    pub fn get_or_create(&self, conversation_id: &str) -> ConversationLog {
        self.inner
            .logs
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationLog::new(conversation_id))
            .clone()
    }

    pub fn get(&self, conversation_id: &str) -> Option<ConversationLog> {
        self.inner.logs.get(conversation_id).map(|log| log.clone())
    }

    pub fn cursor(&self, conversation_id: &str) -> Option<String> {
        self.inner
            .logs
            .get(conversation_id)
            .and_then(|log| log.cursor().map(str::to_string))
    }

    pub fn remove(&self, conversation_id: &str) -> bool {
        self.inner.logs.remove(conversation_id).is_some()
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.inner.logs.iter().map(|log| log.key().clone()).collect()
    }

    /// Ids of conversations whose log changed.
    pub fn changes(&self) -> broadcast::Receiver<String> {
        self.inner.changes.subscribe()
    }

    /// Append a live event; duplicates are ignored. Returns whether it was new.
    pub fn append(&self, conversation_id: &str, event: TranscriptEvent) -> bool {
        self.update(conversation_id, |log| log.append(event))
    }

    /// Cold-start backfill. Fetches the newest page only while the log has
    /// no cursor, and returns the cursor to resume the live stream from.
    pub async fn load_history(&self, conversation_id: &str) -> Result<Option<String>, TranscriptError> {
        if let Some(cursor) = self.cursor(conversation_id) {
            return Ok(Some(cursor));
        }

        let query = HistoryQuery {
            limit: self.inner.page_size,
            before: None,
        };
        let page = match self.inner.api.history(conversation_id, &query).await {
            Ok(page) => page,
            Err(error) => {
                self.record_load_error(conversation_id, &error);
                return Err(error);
            }
        };

        let cursor = self.update(conversation_id, |log| {
            let added = log.extend(page.events);
            if log.active_session.is_none() {
                log.active_session = page.active_session;
            }
            log.history_loaded = true;
            log.has_more_earlier = page.has_more;
            log.load_error = None;
            debug!(conversation_id, added, "history loaded");
            log.cursor().map(str::to_string)
        });
        Ok(cursor)
    }

    /// Fetch the page before `before` (defaults to the earliest loaded id)
    /// and prepend it. Returns how many events were new.
    pub async fn load_earlier(
        &self,
        conversation_id: &str,
        before: Option<&str>,
    ) -> Result<usize, TranscriptError> {
        let before = match before {
            Some(before) => before.to_string(),
            None => match self
                .get(conversation_id)
                .and_then(|log| log.earliest_id().map(str::to_string))
            {
                Some(earliest) => earliest,
                None => {
                    debug!(conversation_id, "nothing loaded yet, no earlier page to fetch");
                    return Ok(0);
                }
            },
        };

        let query = HistoryQuery {
            limit: self.inner.page_size,
            before: Some(before),
        };
        let page = match self.inner.api.history(conversation_id, &query).await {
            Ok(page) => page,
            Err(error) => {
                self.record_load_error(conversation_id, &error);
                return Err(error);
            }
        };

        Ok(self.update(conversation_id, |log| {
            log.has_more_earlier = page.has_more;
            log.load_error = None;
            log.prepend(page.events)
        }))
    }

    /// Mutate one log, creating it if needed, and announce the change.
    pub(crate) fn update<R>(&self, conversation_id: &str, f: impl FnOnce(&mut ConversationLog) -> R) -> R {
        let result = {
            let mut log = self
                .inner
                .logs
                .entry(conversation_id.to_string())
                .or_insert_with(|| ConversationLog::new(conversation_id));
            f(log.value_mut())
        };
        let _ = self.inner.changes.send(conversation_id.to_string());
        result
    }

    fn record_load_error(&self, conversation_id: &str, error: &TranscriptError) {
        warn!(conversation_id, "history fetch failed: {error}");
        let message = error.to_string();
        self.update(conversation_id, |log| log.load_error = Some(message));
    }
}
