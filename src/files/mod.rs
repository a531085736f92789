//! Open-file synchronization with optimistic concurrency.
//!
//! Each open path is a small state machine (`FileStatus`). Local edits are
//! autosaved after a debounce; a save carries the revision the edit was based
//! on so the server can refuse it when someone else wrote first. Notifications
//! from the event bus reload clean files and turn files with unsaved work
//! into conflicts.

mod api;
mod record;
mod store;


pub use api::{FileApi, FileApiError, FileSnapshot, HttpFileApi, Revision, SaveOutcome};
pub use record::{FileRecord, FileStatus, FileStatusKind, Resolution};
pub use store::{FileStatusChange, FileSyncStore};

#[derive(Debug, Clone, thiserror::Error)]
pub enum FileSyncError {
    #[error("file is not open: {0}")]
    NotOpen(String),
    #[error("cannot {operation} {path} while {status}")]
    InvalidState {
        path: String,
        status: FileStatusKind,
        operation: &'static str,
    },
    #[error(transparent)]
    Api(#[from] FileApiError),
}

impl FileSyncError {
    pub(crate) fn invalid_state(path: &str, status: FileStatusKind, operation: &'static str) -> Self {
        Self::InvalidState {
            path: path.to_string(),
            status,
            operation,
        }
    }
}
