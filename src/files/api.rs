use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::config::SyncConfig;

const CONTENT_ENDPOINT: &str = "/api/files/content";

/// Opaque server-side version marker (the file's mtime).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read a revision out of a JSON value; servers send mtimes as numbers
    /// or strings.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(raw) if !raw.is_empty() => Some(Self(raw.clone())),
            serde_json::Value::Number(number) => Some(Self(number.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Revision::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom("revision must be a string or number"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileSnapshot {
    pub content: String,
    #[serde(alias = "mtime")]
    pub revision: Revision,
}

/// Result of a write the server processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { revision: Revision },
    /// `expected_revision` did not match; the server kept its copy.
    Conflict { current_revision: Option<Revision> },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FileApiError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timeout: {0}")]
    Timeout(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("server returned status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for FileApiError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return Self::Timeout(value.to_string());
        }
        Self::Request(value.to_string())
    }
}

/// Server-held file contents with optimistic concurrency on write.
#[async_trait]
pub trait FileApi: Send + Sync {
    async fn load(&self, path: &str) -> Result<FileSnapshot, FileApiError>;

    /// Write `content`. With `expected_revision` the server refuses when its
    /// copy moved on; without it the write always wins.
    async fn save(
        &self,
        path: &str,
        content: &str,
        expected_revision: Option<&Revision>,
    ) -> Result<SaveOutcome, FileApiError>;
}

#[derive(Serialize)]
struct SaveRequest<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_revision: Option<&'a Revision>,
}

#[derive(Deserialize)]
struct SavedResponse {
    #[serde(alias = "mtime")]
    revision: Revision,
}

#[derive(Deserialize, Default)]
struct ConflictResponse {
    #[serde(default, alias = "mtime", alias = "revision")]
    current_revision: Option<Revision>,
}

pub struct HttpFileApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFileApi {
    pub fn new(config: &SyncConfig) -> Result<Self, FileApiError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| FileApiError::Request(format!("invalid auth header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(config.request_timeout_ms))
                .default_headers(headers)
                .build()
                .map_err(|error| FileApiError::Request(error.to_string()))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, CONTENT_ENDPOINT)
    }
}

#[async_trait]
impl FileApi for HttpFileApi {
    async fn load(&self, path: &str) -> Result<FileSnapshot, FileApiError> {
        let response = self
            .client
            .get(self.endpoint())
            .query(&[("path", path)])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FileApiError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FileApiError::Http {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<FileSnapshot>().await.map_err(|error| {
            FileApiError::InvalidResponse(format!("failed to parse file content JSON: {error}"))
        })
    }

    async fn save(
        &self,
        path: &str,
        content: &str,
        expected_revision: Option<&Revision>,
    ) -> Result<SaveOutcome, FileApiError> {
        debug!(path, forced = expected_revision.is_none(), "saving file");
        let response = self
            .client
            .put(self.endpoint())
            .query(&[("path", path)])
            .json(&SaveRequest {
                content,
                expected_revision,
            })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let body: ConflictResponse = response.json().await.unwrap_or_default();
            return Ok(SaveOutcome::Conflict {
                current_revision: body.current_revision,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FileApiError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let saved: SavedResponse = response.json().await.map_err(|error| {
            FileApiError::InvalidResponse(format!("failed to parse save response JSON: {error}"))
        })?;
        Ok(SaveOutcome::Saved {
            revision: saved.revision,
        })
    }
}
