// tests/common/mock_source.rs
//! Channel-fed event source for driving streams from a test.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{mpsc, Mutex};

use livesync_lib::stream::{EventSource, FrameStream, SseEvent, StreamError, StreamRequest};

pub type FrameSender = mpsc::UnboundedSender<Result<SseEvent, StreamError>>;

/// Each `accept()` queues one connection; the next `open` takes it and
/// yields whatever the test sends. Dropping the sender ends the stream.
/// Opens with nothing queued are refused.
#[derive(Default)]
pub struct ChannelSource {
    pending: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<SseEvent, StreamError>>>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ChannelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn accept(&self) -> FrameSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().await.push_back(rx);
        tx
    }

    pub async fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn open(&self, request: &StreamRequest) -> Result<FrameStream, StreamError> {
        self.requests.lock().await.push(request.clone());
        let Some(rx) = self.pending.lock().await.pop_front() else {
            return Err(StreamError::Connection("connection refused".to_string()));
        };
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })))
    }
}
