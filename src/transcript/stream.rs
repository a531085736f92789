use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::api::conversation_path;
use super::{TranscriptCache, TranscriptEvent, KIND_SESSION_BOUNDARY};
use crate::config::SyncConfig;
use crate::stream::{
    BackoffPolicy, ConnectionState, EventSource, SseEvent, StreamController, StreamError,
    StreamHandler, StreamRequest, Visibility,
};

pub const FRAME_CONNECTED: &str = "connected";
pub const FRAME_TRANSCRIPT: &str = "transcript";
pub const FRAME_ACTIVITY: &str = "activity";
pub const FRAME_TASKS: &str = "tasks";
pub const FRAME_SESSION_META: &str = "session_meta";
pub const FRAME_SESSION_BOUNDARY: &str = "session_boundary";
pub const FRAME_CONVERSATION_ENDED: &str = "conversation_ended";
pub const FRAME_ERROR: &str = "error";

/// Feeds one conversation's named-frame stream into the cache.
struct ConversationHandler {
    conversation_id: String,
    cache: TranscriptCache,
    ended: bool,
}

impl ConversationHandler {
    /// Append one event or an array of them. `frame_kind`, when set, is the
    /// kind implied by the frame name and overrides the body's `type`.
    fn append_events(&self, data: Value, frame_kind: Option<&str>) -> Result<(), serde_json::Error> {
        let items = match data {
            Value::Array(items) => items,
            other => vec![other],
        };
        let events = items
            .into_iter()
            .map(|mut item| {
                if let (Some(kind), Value::Object(fields)) = (frame_kind, &mut item) {
                    fields.insert("type".to_string(), Value::String(kind.to_string()));
                }
                serde_json::from_value(item)
            })
            .collect::<Result<Vec<TranscriptEvent>, _>>()?;
        let added = self.cache.update(&self.conversation_id, |log| log.extend(events));
        trace!(conversation_id = %self.conversation_id, added, "transcript frame");
        Ok(())
    }

    fn handle(&mut self, frame: &SseEvent) -> Result<(), serde_json::Error> {
        let data: Value = if frame.data.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&frame.data)?
        };

        match frame.event_type.as_str() {
            FRAME_CONNECTED => {
                if let Some(session) = data.get("session_id").and_then(Value::as_str) {
                    let session = session.to_string();
                    self.cache.update(&self.conversation_id, |log| {
                        log.active_session.get_or_insert(session);
                    });
                }
            }
            FRAME_TRANSCRIPT => self.append_events(data, None)?,
            FRAME_SESSION_BOUNDARY => self.append_events(data, Some(KIND_SESSION_BOUNDARY))?,
            FRAME_ACTIVITY => self.cache.update(&self.conversation_id, |log| log.activity = Some(data)),
            FRAME_TASKS => self.cache.update(&self.conversation_id, |log| log.tasks = Some(data)),
            FRAME_SESSION_META => {
                self.cache.update(&self.conversation_id, |log| log.session_meta = Some(data))
            }
            FRAME_CONVERSATION_ENDED => {
                info!(conversation_id = %self.conversation_id, "conversation ended");
                self.ended = true;
                self.cache.update(&self.conversation_id, |log| log.ended = true);
            }
            FRAME_ERROR => {
                let message = match &data {
                    Value::String(message) => message.clone(),
                    other => other
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| other.to_string()),
                };
                warn!(conversation_id = %self.conversation_id, "stream reported error: {message}");
                self.cache
                    .update(&self.conversation_id, |log| log.last_stream_error = Some(message));
            }
            other => trace!(event = other, "ignoring unknown conversation frame"),
        }
        Ok(())
    }
}

#[async_trait]
impl StreamHandler for ConversationHandler {
    /// Resume after the cursor; with no cursor yet, backfill history first so
    /// live events can never land ahead of older ones.
    async fn prepare(&mut self) -> Result<StreamRequest, StreamError> {
        let cursor = self
            .cache
            .load_history(&self.conversation_id)
            .await
            .map_err(|error| StreamError::Prepare(error.to_string()))?;

        let mut request = StreamRequest::new(conversation_path(&self.conversation_id, "stream"));
        if let Some(cursor) = &cursor {
            request = request.with_query("after", cursor.clone());
        }
        debug!(conversation_id = %self.conversation_id, after = ?cursor, "opening conversation stream");
        Ok(request.with_last_event_id(cursor))
    }

    fn on_frame(&mut self, frame: SseEvent) {
        if let Err(e) = self.handle(&frame) {
            warn!(
                conversation_id = %self.conversation_id,
                event = %frame.event_type,
                "dropping malformed conversation frame: {e}"
            );
        }
    }

    fn on_lost(&mut self, error: &StreamError) {
        let message = error.to_string();
        self.cache
            .update(&self.conversation_id, |log| log.last_stream_error = Some(message));
    }

    fn is_finished(&self) -> bool {
        self.ended
    }
}

/// Live subscription to one conversation. Dropping it closes the transport.
pub struct ConversationStream {
    id: u64,
    conversation_id: String,
    controller: Arc<StreamController>,
    registry: Weak<DashMap<u64, Weak<StreamController>>>,
}

impl ConversationStream {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.controller.watch_state()
    }

    pub fn reconnect(&self) {
        self.controller.reconnect();
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    pub fn close(self) {}
}

impl Drop for ConversationStream {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        self.controller.close();
        debug!(conversation_id = %self.conversation_id, "conversation stream closed");
    }
}

/// Opens per-conversation streams and forwards visibility to all of them.
pub struct TranscriptSync {
    cache: TranscriptCache,
    source: Arc<dyn EventSource>,
    policy: BackoffPolicy,
    streams: Arc<DashMap<u64, Weak<StreamController>>>,
    next_id: AtomicU64,
    visibility: Mutex<Visibility>,
}

impl TranscriptSync {
    pub fn new(config: &SyncConfig, source: Arc<dyn EventSource>, cache: TranscriptCache) -> Self {
        Self {
            cache,
            source,
            policy: BackoffPolicy::from(&config.backoff),
            streams: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            visibility: Mutex::new(Visibility::Visible),
        }
    }

    pub fn cache(&self) -> &TranscriptCache {
        &self.cache
    }

    /// Start following `conversation_id`.
    pub fn watch(&self, conversation_id: &str) -> ConversationStream {
        self.cache.get_or_create(conversation_id);
        let handler = ConversationHandler {
            conversation_id: conversation_id.to_string(),
            cache: self.cache.clone(),
            ended: false,
        };
        let controller = Arc::new(StreamController::spawn(
            format!("conversation:{conversation_id}"),
            self.source.clone(),
            self.policy,
            handler,
        ));
        if *self.visibility.lock() == Visibility::Hidden {
            controller.set_visibility(Visibility::Hidden);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.streams.insert(id, Arc::downgrade(&controller));
        info!(conversation_id, "watching conversation");

        ConversationStream {
            id,
            conversation_id: conversation_id.to_string(),
            controller,
            registry: Arc::downgrade(&self.streams),
        }
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        *self.visibility.lock() = visibility;
        for stream in self.streams.iter() {
            if let Some(controller) = stream.value().upgrade() {
                controller.set_visibility(visibility);
            }
        }
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }
}
