use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use tracing::{debug, info};

use super::{SseDecoder, SseEvent, StreamError};
use crate::config::SyncConfig;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseEvent, StreamError>> + Send>>;

/// What to open: endpoint path, query parameters and the replay cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
    pub last_event_id: Option<String>,
}

impl StreamRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_last_event_id(mut self, id: Option<String>) -> Self {
        self.last_event_id = id;
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Opens server-push streams. The seam the stream driver is tested through.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<FrameStream, StreamError>;
}

/// reqwest-backed text-event-stream source.
pub struct HttpEventSource {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    connect_timeout: Duration,
}

impl HttpEventSource {
    pub fn new(config: &SyncConfig) -> Result<Self, StreamError> {
        info!("Creating SSE source for URL: {}", config.base_url);

        let connect_timeout = Duration::from_millis(config.request_timeout_ms);
        // No overall timeout: it would also cut the open body.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| StreamError::Connection(format!("Failed to create HTTP client: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| StreamError::Connection(format!("Invalid auth header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            headers,
            connect_timeout,
        })
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn open(&self, request: &StreamRequest) -> Result<FrameStream, StreamError> {
        let url = format!("{}{}", self.base_url, request.path);

        let mut builder = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .query(&request.query);

        // Last-Event-ID mirrors the cursor for servers that honor the header.
        if let Some(last_id) = &request.last_event_id {
            builder = builder.header("Last-Event-ID", last_id);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StreamError::Timeout(self.connect_timeout)
                } else {
                    StreamError::connection(format!("Failed to connect to SSE stream: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        debug!("Connected to SSE stream at {}", url);

        let frames = response
            .bytes_stream()
            .scan(SseDecoder::new(), |decoder, chunk| {
                let out: Vec<Result<SseEvent, StreamError>> = match chunk {
                    Ok(bytes) => decoder.feed(&bytes),
                    Err(e) => vec![Err(StreamError::connection(format!("Stream error: {e}")))],
                };
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(frames))
    }
}
