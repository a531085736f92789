use tracing::trace;

use super::StreamError;

/// Default event name for frames that carry no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// SSE event structure with full field support.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type (e.g., "message", "transcript", "session_boundary").
    pub event_type: String,
    /// Event data payload.
    pub data: String,
    /// Event ID for replay/ordering.
    pub id: Option<String>,
    /// Retry timing hint from server.
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Build an unnamed `message` frame.
    pub fn message(data: impl Into<String>) -> Self {
        Self::named(DEFAULT_EVENT_TYPE, data)
    }

    /// Build a named frame.
    pub fn named(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    /// Parse one SSE frame (the lines between two blank lines).
    ///
    /// Comment lines (leading `:`) are skipped. A frame without any
    /// `data:` line is rejected; servers use those for keepalives.
    pub fn parse(input: &str) -> Result<Self, StreamError> {
        let mut event_type = DEFAULT_EVENT_TYPE.to_string();
        let mut data = String::new();
        let mut saw_data = false;
        let mut id = None;
        let mut retry = None;

        for line in input.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let (key, value) = match line.split_once(':') {
                Some((key, value)) => (key, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match key {
                "event" => event_type = value.to_string(),
                "data" => {
                    if saw_data {
                        data.push('\n');
                    }
                    data.push_str(value);
                    saw_data = true;
                }
                "id" => id = Some(value.to_string()),
                "retry" => {
                    if let Ok(ms) = value.parse::<u64>() {
                        retry = Some(ms);
                    }
                }
                _ => {
                    trace!("Unknown SSE field: {}", key);
                }
            }
        }

        if !saw_data {
            return Err(StreamError::SseParse("Empty event data".to_string()));
        }

        Ok(Self {
            event_type,
            data,
            id,
            retry,
        })
    }
}

/// Largest frame the decoder buffers before giving up on it.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Incremental decoder that turns arbitrary network chunks into frames.
///
/// Chunk boundaries do not line up with frame boundaries, so bytes are
/// buffered until a blank line terminates a frame. A frame that grows past
/// the size limit is reported once and skipped up to its terminator.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a terminator.
    scanned: usize,
    max_frame_bytes: usize,
    discarding: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_frame_bytes: max_frame_bytes.max(2),
            discarding: false,
        }
    }

    /// Feed a chunk and return every frame it completed. Frames without
    /// data (keepalives) are skipped; an oversized frame yields one
    /// `SseParse` error.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<SseEvent, StreamError>> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.next_frame_end() {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                trace!("Skipped remainder of oversized SSE frame");
                continue;
            }
            let text = String::from_utf8_lossy(&raw[..end]);
            match SseEvent::parse(&text) {
                Ok(event) => frames.push(Ok(event)),
                Err(_) => trace!("Skipping SSE frame without data"),
            }
        }

        if self.buffer.len() > self.max_frame_bytes {
            if !self.discarding {
                frames.push(Err(StreamError::SseParse(format!(
                    "frame exceeds {} bytes",
                    self.max_frame_bytes
                ))));
                self.discarding = true;
            }
            // The last byte may be the first half of the terminator.
            let keep_from = self.buffer.len() - 1;
            self.buffer.drain(..keep_from);
            self.scanned = 0;
        }
        frames
    }

    /// Bytes received but not yet terminated by a blank line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Search only the bytes added since the last call, plus one byte of
    /// overlap for a terminator split across chunks.
    fn next_frame_end(&mut self) -> Option<usize> {
        let start = self.scanned.saturating_sub(1);
        match self.buffer[start..].windows(2).position(|window| window == b"\n\n") {
            Some(offset) => Some(start + offset),
            None => {
                self.scanned = self.buffer.len();
                None
            }
        }
    }
}
