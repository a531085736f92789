use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::TranscriptEvent;
use crate::config::SyncConfig;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TranscriptError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timeout: {0}")]
    Timeout(String),
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("server returned status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for TranscriptError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return Self::Timeout(value.to_string());
        }
        Self::Request(value.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: usize,
    /// Only events strictly older than this id. `None` means the newest page.
    pub before: Option<String>,
}

/// One page of history, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HistoryPage {
    pub events: Vec<TranscriptEvent>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub active_session: Option<String>,
}

/// Bulk transcript reads.
#[async_trait]
pub trait TranscriptApi: Send + Sync {
    async fn history(
        &self,
        conversation_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, TranscriptError>;
}

pub(crate) fn conversation_path(conversation_id: &str, leaf: &str) -> String {
    format!(
        "/api/conversations/{}/{leaf}",
        urlencoding::encode(conversation_id)
    )
}

pub struct HttpTranscriptApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTranscriptApi {
    pub fn new(config: &SyncConfig) -> Result<Self, TranscriptError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TranscriptError::Request(format!("invalid auth header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(config.request_timeout_ms))
                .default_headers(headers)
                .build()
                .map_err(|error| TranscriptError::Request(error.to_string()))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TranscriptApi for HttpTranscriptApi {
    async fn history(
        &self,
        conversation_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, TranscriptError> {
        let url = format!(
            "{}{}",
            self.base_url,
            conversation_path(conversation_id, "history")
        );
        debug!(conversation_id, limit = query.limit, before = ?query.before, "fetching history");

        let mut request = self
            .client
            .get(url)
            .query(&[("limit", query.limit.to_string())]);
        if let Some(before) = &query.before {
            request = request.query(&[("before", before)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TranscriptError::NotFound(conversation_id.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TranscriptError::Http {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<HistoryPage>().await.map_err(|error| {
            TranscriptError::InvalidResponse(format!("failed to parse history JSON: {error}"))
        })
    }
}
