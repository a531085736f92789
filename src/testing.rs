//! Scripted fakes for the crate's I/O seams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio::sync::Notify;

use crate::files::{FileApi, FileApiError, FileSnapshot, Revision, SaveOutcome};
use crate::stream::{EventSource, FrameStream, SseEvent, StreamError, StreamRequest};
use crate::transcript::{HistoryPage, HistoryQuery, TranscriptApi, TranscriptError, TranscriptEvent};

/// Poll `condition` until it holds. Works under paused time.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

enum Script {
    Open { frames: Vec<Result<SseEvent, StreamError>>, then_end: bool },
    Fail(StreamError),
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Event source that plays back queued opens. With nothing queued, an open
/// fails with a connection error.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
    opens: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next open succeeds, yields `frames` and then stays open.
    pub fn push_open(&self, frames: Vec<Result<SseEvent, StreamError>>) {
        self.push(Script::Open {
            frames,
            then_end: false,
        });
    }

    /// Next open succeeds, yields `frames` and then the server closes it.
    pub fn push_closing(&self, frames: Vec<Result<SseEvent, StreamError>>) {
        self.push(Script::Open {
            frames,
            then_end: true,
        });
    }

    pub fn push_failure(&self, error: StreamError) {
        self.push(Script::Fail(error));
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Streams handed out and not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn open(&self, request: &StreamRequest) -> Result<FrameStream, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            None => Err(StreamError::Connection("connection refused".to_string())),
            Some(Script::Fail(error)) => Err(error),
            Some(Script::Open { frames, then_end }) => {
                self.live.fetch_add(1, Ordering::SeqCst);
                let guard = LiveGuard(self.live.clone());
                let frames = stream::iter(frames);
                let frames: FrameStream = if then_end {
                    Box::pin(frames)
                } else {
                    Box::pin(frames.chain(stream::pending()))
                };
                Ok(Box::pin(frames.map(move |frame| {
                    let _ = &guard;
                    frame
                })))
            }
        }
    }
}

/// In-memory file server with numeric revisions.
#[derive(Default)]
pub struct FakeFileApi {
    files: Mutex<HashMap<String, (String, u64)>>,
    next_revision: AtomicU64,
    saves: Mutex<Vec<(String, String, Option<Revision>)>>,
    failures: Mutex<VecDeque<FileApiError>>,
    gate: Mutex<Option<Arc<Notify>>>,
    load_gate: Mutex<Option<Arc<Notify>>>,
    loads: AtomicUsize,
}

impl FakeFileApi {
    pub fn new() -> Self {
        Self {
            next_revision: AtomicU64::new(1),
            ..Self::default()
        }
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.server_write(path, content);
        self
    }

    /// Another writer changes the file. Returns the new revision.
    pub fn server_write(&self, path: &str, content: &str) -> Revision {
        let revision = self.next_revision.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), (content.to_string(), revision));
        Revision::new(revision.to_string())
    }

    /// Another writer deletes the file.
    pub fn server_delete(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).map(|(content, _)| content.clone())
    }

    pub fn revision(&self, path: &str) -> Option<Revision> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(_, revision)| Revision::new(revision.to_string()))
    }

    /// Every save received: path, content, expected revision.
    pub fn saves(&self) -> Vec<(String, String, Option<Revision>)> {
        self.saves.lock().unwrap().clone()
    }

    pub fn fail_next_save(&self, error: FileApiError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Hold every following save until the returned handle is notified.
    pub fn hold_saves(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn release_saves(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.notify_waiters();
        }
    }

    /// Hold every following load until `release_loads`.
    pub fn hold_loads(&self) {
        *self.load_gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    pub fn release_loads(&self) {
        if let Some(gate) = self.load_gate.lock().unwrap().take() {
            gate.notify_waiters();
        }
    }

    /// Loads started so far, held ones included.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileApi for FakeFileApi {
    async fn load(&self, path: &str) -> Result<FileSnapshot, FileApiError> {
        let gate = self.load_gate.lock().unwrap().clone();
        let held = gate.as_ref().map(|gate| gate.notified());
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(held) = held {
            held.await;
        }

        let files = self.files.lock().unwrap();
        match files.get(path) {
            Some((content, revision)) => Ok(FileSnapshot {
                content: content.clone(),
                revision: Revision::new(revision.to_string()),
            }),
            None => Err(FileApiError::NotFound(path.to_string())),
        }
    }

    async fn save(
        &self,
        path: &str,
        content: &str,
        expected_revision: Option<&Revision>,
    ) -> Result<SaveOutcome, FileApiError> {
        self.saves.lock().unwrap().push((
            path.to_string(),
            content.to_string(),
            expected_revision.cloned(),
        ));

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        if let Some(expected) = expected_revision {
            let current = self.revision(path);
            if current.as_ref() != Some(expected) {
                return Ok(SaveOutcome::Conflict {
                    current_revision: current,
                });
            }
        }
        Ok(SaveOutcome::Saved {
            revision: self.server_write(path, content),
        })
    }
}

/// Transcript history served from a fixed event list per conversation.
#[derive(Default)]
pub struct FakeTranscriptApi {
    conversations: Mutex<HashMap<String, Vec<TranscriptEvent>>>,
    active_session: Mutex<Option<String>>,
    queries: Mutex<Vec<(String, HistoryQuery)>>,
    failures: Mutex<VecDeque<TranscriptError>>,
}

impl FakeTranscriptApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(self, conversation_id: &str, ids: &[&str]) -> Self {
        let events = ids
            .iter()
            .map(|id| TranscriptEvent::new(*id, "message"))
            .collect();
        self.conversations
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), events);
        self
    }

    pub fn with_active_session(self, session: &str) -> Self {
        *self.active_session.lock().unwrap() = Some(session.to_string());
        self
    }

    pub fn fail_next(&self, error: TranscriptError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn queries(&self) -> Vec<(String, HistoryQuery)> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl TranscriptApi for FakeTranscriptApi {
    async fn history(
        &self,
        conversation_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, TranscriptError> {
        self.queries
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), query.clone()));
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let conversations = self.conversations.lock().unwrap();
        let events = conversations.get(conversation_id).cloned().unwrap_or_default();
        let end = match &query.before {
            Some(before) => events
                .iter()
                .position(|event| &event.id == before)
                .unwrap_or(events.len()),
            None => events.len(),
        };
        let start = end.saturating_sub(query.limit);

        Ok(HistoryPage {
            events: events[start..end].to_vec(),
            has_more: start > 0,
            active_session: self.active_session.lock().unwrap().clone(),
        })
    }
}
