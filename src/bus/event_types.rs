//! Notification kind constants and classification.
//!
//! Single source of truth for which kinds are keepalives, which are
//! synthesized locally, and which describe a file changing on the server.

// ---------------------------------------------------------------------------
// Keepalives
// ---------------------------------------------------------------------------

pub const KIND_PING: &str = "ping";
pub const KIND_HEARTBEAT: &str = "heartbeat";

// ---------------------------------------------------------------------------
// Synthesized by the bus itself
// ---------------------------------------------------------------------------

pub const KIND_CONNECTED: &str = "connected";
pub const KIND_CONNECTION_LOST: &str = "connection.lost";

// ---------------------------------------------------------------------------
// File changes
// ---------------------------------------------------------------------------

pub const KIND_FILE_MODIFIED: &str = "file.modified";
pub const KIND_FILE_CREATED: &str = "file.created";
pub const KIND_FILE_DELETED: &str = "file.deleted";
pub const KIND_FILE_RENAMED: &str = "file.renamed";

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Keepalive traffic: discarded before dispatch.
pub fn is_heartbeat(kind: &str) -> bool {
    kind == KIND_PING || kind == KIND_HEARTBEAT
}

/// Kinds generated locally rather than received from the server.
pub fn is_synthetic(kind: &str) -> bool {
    kind == KIND_CONNECTED || kind == KIND_CONNECTION_LOST
}

/// Kinds that mean a file's server-side content may differ from what an
/// open buffer was loaded from.
pub fn is_external_file_change(kind: &str) -> bool {
    matches!(
        kind,
        KIND_FILE_MODIFIED | KIND_FILE_CREATED | KIND_FILE_DELETED | KIND_FILE_RENAMED
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(is_heartbeat("ping"));
        assert!(is_heartbeat("heartbeat"));
        assert!(!is_heartbeat("worker.completed"));
        assert!(is_synthetic(KIND_CONNECTED));
        assert!(is_external_file_change("file.modified"));
        assert!(is_external_file_change("file.deleted"));
        assert!(!is_external_file_change("file.tree_refreshed"));
    }
}
