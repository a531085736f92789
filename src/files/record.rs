use std::fmt;

use serde::{Deserialize, Serialize};

use super::Revision;

/// Per-path sync state. Carries the rollback baseline in every state that
/// holds unsaved local work, so no combination of flags can disagree.
///
/// `Error` keeps its baseline for `rollback` and `retry`, but only
/// `Dirty`, `Saving` and `Conflict` expose it through `original()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Clean,
    Dirty {
        original: String,
    },
    Saving {
        original: String,
        /// Identifies the in-flight save; a completion with another token is stale.
        token: u64,
        /// Revision check bypassed (last writer wins).
        forced: bool,
    },
    Conflict {
        original: String,
        external_revision: Option<Revision>,
    },
    Error {
        original: String,
        message: String,
        /// Retry repeats a forced write.
        forced: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatusKind {
    Clean,
    Dirty,
    Saving,
    Conflict,
    Error,
}

impl FileStatusKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Saving => "saving",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FileStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FileStatus {
    pub fn kind(&self) -> FileStatusKind {
        match self {
            FileStatus::Clean => FileStatusKind::Clean,
            FileStatus::Dirty { .. } => FileStatusKind::Dirty,
            FileStatus::Saving { .. } => FileStatusKind::Saving,
            FileStatus::Conflict { .. } => FileStatusKind::Conflict,
            FileStatus::Error { .. } => FileStatusKind::Error,
        }
    }

    pub fn original(&self) -> Option<&str> {
        match self {
            FileStatus::Clean | FileStatus::Error { .. } => None,
            FileStatus::Dirty { original }
            | FileStatus::Saving { original, .. }
            | FileStatus::Conflict { original, .. } => Some(original),
        }
    }
}

/// How the user settles a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Overwrite the server copy with the local buffer.
    KeepMine,
    /// Discard local edits and load the server copy.
    UseExternal,
}

/// One open file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub content: String,
    /// Last revision this client saw the server confirm.
    pub server_revision: Revision,
    pub status: FileStatus,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, content: String, server_revision: Revision) -> Self {
        Self {
            path: path.into(),
            content,
            server_revision,
            status: FileStatus::Clean,
        }
    }

    pub fn status_kind(&self) -> FileStatusKind {
        self.status.kind()
    }

    pub fn original_content(&self) -> Option<&str> {
        self.status.original()
    }

    pub fn external_revision(&self) -> Option<&Revision> {
        match &self.status {
            FileStatus::Conflict {
                external_revision, ..
            } => external_revision.as_ref(),
            _ => None,
        }
    }

    pub fn has_local_changes(&self) -> bool {
        self.status != FileStatus::Clean
    }
}
