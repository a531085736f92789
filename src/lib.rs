//! Live synchronization core.
//!
//! Keeps client-side state consistent with server-side state that changes
//! outside the client's control:
//! - Cached query results are marked stale when the server announces a change
//! - Open file buffers are saved with optimistic concurrency and never
//!   silently lose local edits to an external write
//! - Conversation transcripts resume gap-free across reconnects
//!
//! # Architecture
//!
//! - `stream`: text-event-stream decoding, transports and the shared
//!   reconnect/backoff driver
//! - `bus`: the process-wide change-notification bus
//! - `cache`: the query cache and the kind → namespace invalidation router
//! - `files`: per-path save/conflict state machine
//! - `transcript`: per-conversation ordered logs and their streams
//! - `config`: settings with defaults and environment overrides
//! - `SyncClient`: owns and wires all of the above

pub mod bus;
pub mod cache;
mod client;
pub mod config;
pub mod files;
pub mod stream;
pub mod transcript;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use client::SyncClient;
pub use config::{ConfigError, SyncConfig};

const DEFAULT_LOG_FILTER: &str = "livesync=debug,info";

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Stream(#[from] stream::StreamError),
    #[error("{0}")]
    FileApi(#[from] files::FileApiError),
    #[error("{0}")]
    FileSync(#[from] files::FileSyncError),
    #[error("{0}")]
    Transcript(#[from] transcript::TranscriptError),
}

/// Install a fmt subscriber filtered by `RUST_LOG`, defaulting to
/// `livesync=debug,info`. Returns false when a global subscriber was
/// already set.
pub fn init_tracing() -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
