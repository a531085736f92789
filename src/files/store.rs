//! Per-path optimistic-concurrency editing.
//!
//! Transitions:
//! ```text
//! clean    --edit-->                    dirty
//! dirty    --debounce / save_now-->     saving
//! saving   --server accepts-->          clean (or dirty if edited meanwhile)
//! saving   --revision mismatch-->       conflict
//! saving   --transport failure-->       error
//! dirty/saving/error --external change--> conflict
//! clean    --external change-->         clean (auto-reload)
//! conflict --resolve(keep_mine)-->      saving (forced) --> clean
//! conflict --resolve(use_external)-->   clean
//! ```
//! Keystrokes never clear `conflict` or `error`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    FileApi, FileApiError, FileRecord, FileStatus, FileStatusKind, FileSyncError, Resolution,
    Revision, SaveOutcome,
};
use crate::bus::event_types::is_external_file_change;
use crate::bus::{ChangeNotification, EventBus};
use crate::config::SyncConfig;

const CHANGE_CAPACITY: usize = 256;
const MAX_RELOAD_PASSES: usize = 3;

/// Status transition notice for UI consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatusChange {
    pub path: String,
    pub status: FileStatusKind,
}

enum EditEffect {
    ArmDebounce,
    CancelDebounce,
    Nothing,
}

enum ExternalAction {
    Ignore,
    Conflicted,
    Reload { baseline: String },
}

enum ReloadOutcome {
    Applied,
    Conflicted,
    /// Still clean but holding other content than when the load started.
    Superseded(String),
    Skipped,
}

struct StoreInner {
    api: Arc<dyn FileApi>,
    records: DashMap<String, FileRecord>,
    timers: DashMap<String, (u64, JoinHandle<()>)>,
    debounce: Duration,
    next_token: AtomicU64,
    changes: broadcast::Sender<FileStatusChange>,
}

#[derive(Clone)]
pub struct FileSyncStore {
    inner: Arc<StoreInner>,
}

impl FileSyncStore {
    pub fn new(api: Arc<dyn FileApi>, debounce: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                api,
                records: DashMap::new(),
                timers: DashMap::new(),
                debounce,
                next_token: AtomicU64::new(1),
                changes,
            }),
        }
    }

    pub fn from_config(api: Arc<dyn FileApi>, config: &SyncConfig) -> Self {
        Self::new(api, Duration::from_millis(config.autosave_debounce_ms))
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    pub fn get(&self, path: &str) -> Option<FileRecord> {
        self.inner.records.get(path).map(|record| record.clone())
    }

    pub fn status(&self, path: &str) -> Option<FileStatusKind> {
        self.inner.records.get(path).map(|record| record.status_kind())
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.records.iter().map(|r| r.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn changes(&self) -> broadcast::Receiver<FileStatusChange> {
        self.inner.changes.subscribe()
    }

    pub fn has_pending_autosave(&self, path: &str) -> bool {
        self.inner.timers.contains_key(path)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Load `path` and start tracking it. Returns the existing record when
    /// the path is already open.
    pub async fn open(&self, path: &str) -> Result<FileRecord, FileSyncError> {
        if let Some(record) = self.get(path) {
            return Ok(record);
        }

        let snapshot = self.inner.api.load(path).await?;
        let record = self
            .inner
            .records
            .entry(path.to_string())
            .or_insert_with(|| FileRecord::new(path, snapshot.content, snapshot.revision))
            .clone();
        debug!(path, revision = %record.server_revision, "file opened");
        Ok(record)
    }

    /// Stop tracking `path`: cancels the pending autosave and drops the record.
    pub fn close(&self, path: &str) -> bool {
        self.cancel_debounce(path);
        let removed = self.inner.records.remove(path).is_some();
        if removed {
            debug!(path, "file closed");
        }
        removed
    }

    /// Close every open file.
    pub fn close_all(&self) {
        for path in self.paths() {
            self.close(&path);
        }
    }

    // -----------------------------------------------------------------------
    // Local edits
    // -----------------------------------------------------------------------

    /// Replace the buffer contents.
    pub fn edit(&self, path: &str, content: impl Into<String>) -> Result<FileStatusKind, FileSyncError> {
        let content = content.into();
        let (effect, status) = self
            .update(path, |record| {
                if record.content == content {
                    return EditEffect::Nothing;
                }
                let previous = std::mem::replace(&mut record.content, content);
                match &record.status {
                    FileStatus::Clean => {
                        record.status = FileStatus::Dirty { original: previous };
                        EditEffect::ArmDebounce
                    }
                    FileStatus::Dirty { original } => {
                        if *original == record.content {
                            record.status = FileStatus::Clean;
                            EditEffect::CancelDebounce
                        } else {
                            EditEffect::ArmDebounce
                        }
                    }
                    // The running save re-dirties the record if the content moved on.
                    FileStatus::Saving { .. } => EditEffect::Nothing,
                    FileStatus::Conflict { .. } => EditEffect::Nothing,
                    FileStatus::Error { .. } => EditEffect::ArmDebounce,
                }
            })
            .ok_or_else(|| FileSyncError::NotOpen(path.to_string()))?;

        match effect {
            EditEffect::ArmDebounce => self.arm_debounce(path),
            EditEffect::CancelDebounce => self.cancel_debounce(path),
            EditEffect::Nothing => {}
        }
        Ok(status)
    }

    /// Discard local edits and return to the last loaded content.
    pub fn rollback(&self, path: &str) -> Result<FileStatusKind, FileSyncError> {
        let outcome = self
            .update(path, |record| match &record.status {
                FileStatus::Clean => Ok(()),
                FileStatus::Dirty { original } | FileStatus::Error { original, .. } => {
                    record.content = original.clone();
                    record.status = FileStatus::Clean;
                    Ok(())
                }
                other => Err(other.kind()),
            })
            .ok_or_else(|| FileSyncError::NotOpen(path.to_string()))?;

        match outcome {
            (Ok(()), status) => {
                self.cancel_debounce(path);
                Ok(status)
            }
            (Err(status), _) => Err(FileSyncError::invalid_state(path, status, "rollback")),
        }
    }

    // -----------------------------------------------------------------------
    // Saving
    // -----------------------------------------------------------------------

    /// Save immediately instead of waiting for the debounce. Only dirty and
    /// error records are written; any other status is returned unchanged.
    pub async fn save_now(&self, path: &str) -> Result<FileStatusKind, FileSyncError> {
        self.cancel_debounce(path);
        let token = self.next_token();

        let (prepared, status) = self
            .update(path, |record| {
                let (original, forced) = match &record.status {
                    FileStatus::Dirty { original } => (original.clone(), false),
                    FileStatus::Error {
                        original, forced, ..
                    } => (original.clone(), *forced),
                    _ => return None,
                };
                record.status = FileStatus::Saving {
                    original,
                    token,
                    forced,
                };
                let expected = (!forced).then(|| record.server_revision.clone());
                Some((record.content.clone(), expected))
            })
            .ok_or_else(|| FileSyncError::NotOpen(path.to_string()))?;

        let Some((content, expected)) = prepared else {
            debug!(path, %status, "nothing to save");
            return Ok(status);
        };

        let result = self
            .inner
            .api
            .save(path, &content, expected.as_ref())
            .await;
        self.complete_save(path, token, &content, result)
    }

    /// Retry a save that failed on transport.
    pub async fn retry(&self, path: &str) -> Result<FileStatusKind, FileSyncError> {
        match self.status(path) {
            None => Err(FileSyncError::NotOpen(path.to_string())),
            Some(FileStatusKind::Error) => self.save_now(path).await,
            Some(status) => Err(FileSyncError::invalid_state(path, status, "retry")),
        }
    }

    /// Apply a save result, unless the record moved to another state (or
    /// another save) while the request was in flight.
    fn complete_save(
        &self,
        path: &str,
        token: u64,
        sent: &str,
        result: Result<SaveOutcome, FileApiError>,
    ) -> Result<FileStatusKind, FileSyncError> {
        let applied = self.update(path, |record| {
            let (original, forced) = match &record.status {
                FileStatus::Saving {
                    original,
                    token: current,
                    forced,
                } if *current == token => (original.clone(), *forced),
                other => {
                    info!(path, status = %other.kind(), "save finished after status changed, keeping current status");
                    return false;
                }
            };

            match result {
                Ok(SaveOutcome::Saved { revision }) => {
                    debug!(path, %revision, "file saved");
                    record.server_revision = revision;
                    if record.content == sent {
                        record.status = FileStatus::Clean;
                        false
                    } else {
                        record.status = FileStatus::Dirty {
                            original: sent.to_string(),
                        };
                        true
                    }
                }
                Ok(SaveOutcome::Conflict { current_revision }) => {
                    warn!(path, "save rejected, server revision moved on");
                    record.status = FileStatus::Conflict {
                        original,
                        external_revision: current_revision,
                    };
                    false
                }
                Err(error) => {
                    warn!(path, "save failed: {error}");
                    record.status = FileStatus::Error {
                        original,
                        message: error.to_string(),
                        forced,
                    };
                    false
                }
            }
        });

        match applied {
            Some((rearm, status)) => {
                if rearm {
                    self.arm_debounce(path);
                }
                Ok(status)
            }
            None => {
                debug!(path, "save finished for a closed file");
                Err(FileSyncError::NotOpen(path.to_string()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Conflicts and external changes
    // -----------------------------------------------------------------------

    /// Settle a conflict. The only way out of `conflict` besides `reload`.
    pub async fn resolve(&self, path: &str, resolution: Resolution) -> Result<FileStatusKind, FileSyncError> {
        match self.status(path) {
            None => return Err(FileSyncError::NotOpen(path.to_string())),
            Some(FileStatusKind::Conflict) => {}
            Some(status) => return Err(FileSyncError::invalid_state(path, status, "resolve")),
        }

        info!(path, ?resolution, "resolving conflict");
        match resolution {
            Resolution::KeepMine => self.force_save(path).await,
            Resolution::UseExternal => self.replace_from_server(path).await,
        }
    }

    /// Refetch from the server, discarding local edits. In `conflict` this is
    /// the same as `resolve(UseExternal)`.
    pub async fn reload(&self, path: &str) -> Result<FileStatusKind, FileSyncError> {
        match self.status(path) {
            None => Err(FileSyncError::NotOpen(path.to_string())),
            Some(FileStatusKind::Saving) => {
                Err(FileSyncError::invalid_state(path, FileStatusKind::Saving, "reload"))
            }
            Some(_) => self.replace_from_server(path).await,
        }
    }

    async fn force_save(&self, path: &str) -> Result<FileStatusKind, FileSyncError> {
        self.cancel_debounce(path);
        let token = self.next_token();
        let (content, status) = self
            .update(path, |record| match &record.status {
                FileStatus::Conflict { original, .. } => {
                    record.status = FileStatus::Saving {
                        original: original.clone(),
                        token,
                        forced: true,
                    };
                    Ok(record.content.clone())
                }
                other => Err(other.kind()),
            })
            .ok_or_else(|| FileSyncError::NotOpen(path.to_string()))?;

        let content = content.map_err(|_| FileSyncError::invalid_state(path, status, "resolve"))?;
        let result = self.inner.api.save(path, &content, None).await;
        self.complete_save(path, token, &content, result)
    }

    async fn replace_from_server(&self, path: &str) -> Result<FileStatusKind, FileSyncError> {
        self.cancel_debounce(path);
        let snapshot = self.inner.api.load(path).await?;
        let (_, status) = self
            .update(path, |record| {
                record.content = snapshot.content;
                record.server_revision = snapshot.revision;
                record.status = FileStatus::Clean;
            })
            .ok_or_else(|| FileSyncError::NotOpen(path.to_string()))?;
        Ok(status)
    }

    /// React to the server reporting that `path` changed. `revision`, when
    /// known, is the server's new revision.
    pub async fn external_change(&self, path: &str, revision: Option<Revision>) {
        let action = self.update(path, |record| {
            if revision.as_ref() == Some(&record.server_revision) {
                return ExternalAction::Ignore;
            }
            match &record.status {
                FileStatus::Clean => ExternalAction::Reload {
                    baseline: record.content.clone(),
                },
                FileStatus::Dirty { original }
                | FileStatus::Saving { original, .. }
                | FileStatus::Error { original, .. } => {
                    record.status = FileStatus::Conflict {
                        original: original.clone(),
                        external_revision: revision.clone(),
                    };
                    ExternalAction::Conflicted
                }
                FileStatus::Conflict {
                    original,
                    external_revision,
                } => {
                    let external_revision = revision.clone().or_else(|| external_revision.clone());
                    record.status = FileStatus::Conflict {
                        original: original.clone(),
                        external_revision,
                    };
                    ExternalAction::Conflicted
                }
            }
        });

        match action {
            None => {}
            Some((ExternalAction::Ignore, _)) => {
                debug!(path, "change notification matches known revision, ignoring");
            }
            Some((ExternalAction::Conflicted, _)) => {
                self.cancel_debounce(path);
                warn!(path, "file changed on server while local edits are pending");
            }
            Some((ExternalAction::Reload { baseline }, _)) => self.auto_reload(path, baseline).await,
        }
    }

    /// Refetch a clean record whose buffer still reads `baseline`. If the
    /// user has unsaved edits by the time the load returns, the fetched copy
    /// is not applied and the record becomes a conflict.
    async fn auto_reload(&self, path: &str, mut baseline: String) {
        for _ in 0..MAX_RELOAD_PASSES {
            let snapshot = match self.inner.api.load(path).await {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!(path, "auto-reload failed: {error}");
                    return;
                }
            };

            let outcome = self.update(path, |record| match &record.status {
                FileStatus::Clean if record.content == baseline => {
                    record.content = snapshot.content;
                    record.server_revision = snapshot.revision;
                    ReloadOutcome::Applied
                }
                FileStatus::Clean => ReloadOutcome::Superseded(record.content.clone()),
                FileStatus::Dirty { original } | FileStatus::Error { original, .. } => {
                    record.status = FileStatus::Conflict {
                        original: original.clone(),
                        external_revision: Some(snapshot.revision),
                    };
                    ReloadOutcome::Conflicted
                }
                FileStatus::Saving { .. } | FileStatus::Conflict { .. } => ReloadOutcome::Skipped,
            });

            match outcome {
                Some((ReloadOutcome::Applied, _)) => {
                    debug!(path, "file auto-reloaded");
                    return;
                }
                Some((ReloadOutcome::Conflicted, _)) => {
                    self.cancel_debounce(path);
                    warn!(path, "local edit raced an auto-reload, marking conflict");
                    return;
                }
                Some((ReloadOutcome::Superseded(content), _)) => {
                    debug!(path, "buffer replaced during auto-reload, loading again");
                    baseline = content;
                }
                Some((ReloadOutcome::Skipped, status)) => {
                    debug!(path, %status, "auto-reload not applied");
                    return;
                }
                None => return,
            }
        }
        warn!(path, "auto-reload kept being superseded, giving up");
    }

    /// Apply a `file.*` notification from the bus.
    pub async fn handle_notification(&self, notification: &ChangeNotification) {
        if !is_external_file_change(&notification.kind) {
            return;
        }
        let Some(path) = notification.payload_str("path") else {
            debug!(kind = %notification.kind, "file notification without path");
            return;
        };
        if !self.inner.records.contains_key(path) {
            return;
        }

        let revision = ["revision", "mtime"]
            .iter()
            .find_map(|key| notification.payload.get(*key).and_then(Revision::from_json));
        self.external_change(path, revision).await;
    }

    /// Follow the bus for file changes until the bus goes away.
    pub fn attach(&self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.receiver();
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => store.handle_notification(&notification).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("file sync lagged behind the event bus, dropped {n} notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Atomically mutate one record. Emits a change notice when the status
    /// kind changed. `None` when the path is not open.
    fn update<R>(&self, path: &str, f: impl FnOnce(&mut FileRecord) -> R) -> Option<(R, FileStatusKind)> {
        let (result, before, after) = {
            let mut record = self.inner.records.get_mut(path)?;
            let before = record.status_kind();
            let result = f(record.value_mut());
            (result, before, record.status_kind())
        };

        if before != after {
            debug!(path, from = %before, to = %after, "file status changed");
            let _ = self.inner.changes.send(FileStatusChange {
                path: path.to_string(),
                status: after,
            });
        }
        Some((result, after))
    }

    fn next_token(&self) -> u64 {
        self.inner.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn arm_debounce(&self, path: &str) {
        let timer = self.next_token();
        let store = self.clone();
        let key = path.to_string();
        let delay = self.inner.debounce;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            store.inner.timers.remove_if(&key, |_, (current, _)| *current == timer);
            // Detached so a later re-arm cannot abort a save halfway.
            tokio::spawn(async move {
                if let Err(error) = store.save_now(&key).await {
                    debug!(path = %key, "autosave skipped: {error}");
                }
            });
        });

        if let Some((_, previous)) = self.inner.timers.insert(path.to_string(), (timer, handle)) {
            previous.abort();
        }
    }

    fn cancel_debounce(&self, path: &str) {
        if let Some((_, (_, handle))) = self.inner.timers.remove(path) {
            handle.abort();
        }
    }
}
