//! Server-push stream plumbing shared by the event bus and transcript streams.
//!
//! - `sse`: incremental text-event-stream decoding
//! - `backoff`: reconnect delay policy and per-endpoint connection state
//! - `transport`: the `EventSource` seam and its reqwest implementation
//! - `connection`: the reconnect driver that owns one live stream

mod backoff;
mod connection;
mod sse;
mod transport;

use std::fmt;
use std::time::Duration;

pub use backoff::{BackoffPolicy, ConnectionState};
pub use connection::{StreamController, StreamHandler, Visibility};
pub use sse::{SseDecoder, SseEvent};
pub use transport::{EventSource, FrameStream, HttpEventSource, StreamRequest};

/// Errors raised while opening or reading a push stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Connection could not be established or dropped mid-stream.
    #[error("connection error: {0}")]
    Connection(String),
    /// Server answered the stream request with a non-success status.
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },
    /// Open or prepare step exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    /// A single frame could not be decoded. Never fatal to the stream.
    #[error("SSE parse error: {0}")]
    SseParse(String),
    /// Server ended the stream.
    #[error("stream closed by server")]
    Closed,
    /// Work that had to happen before opening the stream failed.
    #[error("prepare failed: {0}")]
    Prepare(String),
}

impl StreamError {
    pub fn connection<E: fmt::Display>(err: E) -> Self {
        Self::Connection(err.to_string())
    }

    /// Whether the driver should schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Connection(_)
            | StreamError::Timeout(_)
            | StreamError::Closed
            | StreamError::Prepare(_) => true,
            StreamError::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            StreamError::SseParse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_retryable() {
        assert!(StreamError::Connection("reset".to_string()).is_retryable());
        assert!(StreamError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(StreamError::Closed.is_retryable());
        assert!(StreamError::Http {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!StreamError::Http {
            status: 401,
            message: "unauthorized".to_string()
        }
        .is_retryable());
        assert!(!StreamError::SseParse("bad".to_string()).is_retryable());
    }
}
