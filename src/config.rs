use serde::{Deserialize, Serialize};

pub const ENV_BASE_URL: &str = "LIVESYNC_BASE_URL";
pub const ENV_AUTH_TOKEN: &str = "LIVESYNC_AUTH_TOKEN";
pub const ENV_BACKOFF_BASE_MS: &str = "LIVESYNC_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_CAP_MS: &str = "LIVESYNC_BACKOFF_CAP_MS";
pub const ENV_MAX_ATTEMPTS: &str = "LIVESYNC_MAX_ATTEMPTS";
pub const ENV_AUTOSAVE_MS: &str = "LIVESYNC_AUTOSAVE_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Path of the process-wide change-notification stream.
    #[serde(default = "default_events_path")]
    pub events_path: String,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default = "default_autosave_debounce_ms")]
    pub autosave_debounce_ms: u64,
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Freshness window for query results stored without their own policy.
    #[serde(default = "default_stale_time_ms")]
    pub default_stale_time_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            cap_ms: default_backoff_cap_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_token: None,
            events_path: default_events_path(),
            backoff: BackoffConfig::default(),
            autosave_debounce_ms: default_autosave_debounce_ms(),
            history_page_size: default_history_page_size(),
            request_timeout_ms: default_request_timeout_ms(),
            default_stale_time_ms: default_stale_time_ms(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `LIVESYNC_*` variables (a `.env` file is
    /// loaded first when present).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from `lookup`. Blank values are ignored.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let read = |key: &'static str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(base_url) = read(ENV_BASE_URL) {
            self.base_url = base_url.trim().to_string();
        }
        if let Some(token) = read(ENV_AUTH_TOKEN) {
            self.auth_token = Some(token.trim().to_string());
        }
        if let Some(value) = read(ENV_BACKOFF_BASE_MS) {
            self.backoff.base_ms = parse_env(ENV_BACKOFF_BASE_MS, &value)?;
        }
        if let Some(value) = read(ENV_BACKOFF_CAP_MS) {
            self.backoff.cap_ms = parse_env(ENV_BACKOFF_CAP_MS, &value)?;
        }
        if let Some(value) = read(ENV_MAX_ATTEMPTS) {
            self.backoff.max_attempts = parse_env(ENV_MAX_ATTEMPTS, &value)?;
        }
        if let Some(value) = read(ENV_AUTOSAVE_MS) {
            self.autosave_debounce_ms = parse_env(ENV_AUTOSAVE_MS, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url cannot be empty".to_string()));
        }
        if !self.events_path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "events_path must start with '/'".to_string(),
            ));
        }
        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "backoff.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.backoff.base_ms == 0 || self.backoff.cap_ms < self.backoff.base_ms {
            return Err(ConfigError::Invalid(
                "backoff requires 0 < base_ms <= cap_ms".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.history_page_size == 0 {
            return Err(ConfigError::Invalid(
                "history_page_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_events_path() -> String {
    "/api/events".to_string()
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_autosave_debounce_ms() -> u64 {
    2_000
}

fn default_history_page_size() -> usize {
    100
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_stale_time_ms() -> u64 {
    30_000
}
