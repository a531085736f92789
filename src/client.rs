use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::bus::EventBus;
use crate::cache::QueryCache;
use crate::config::SyncConfig;
use crate::files::{FileApi, FileSyncStore, HttpFileApi};
use crate::stream::{ConnectionState, EventSource, HttpEventSource, Visibility};
use crate::transcript::{HttpTranscriptApi, TranscriptApi, TranscriptCache, TranscriptSync};
use crate::SyncError;

/// Owns every sync component and their wiring.
///
/// Nothing connects until `connect()`; `close()` tears the connection and
/// the file listener down again. Consumers get handles from the accessors
/// instead of reaching for globals.
pub struct SyncClient {
    config: SyncConfig,
    bus: EventBus,
    files: FileSyncStore,
    transcripts: TranscriptSync,
    file_listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    /// HTTP-backed client for `config.base_url`.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let source: Arc<dyn EventSource> = Arc::new(HttpEventSource::new(&config)?);
        let file_api: Arc<dyn FileApi> = Arc::new(HttpFileApi::new(&config)?);
        let transcript_api: Arc<dyn TranscriptApi> = Arc::new(HttpTranscriptApi::new(&config)?);
        Ok(Self::with_parts(config, source, file_api, transcript_api))
    }

    /// Client over caller-supplied transports.
    pub fn with_parts(
        config: SyncConfig,
        source: Arc<dyn EventSource>,
        file_api: Arc<dyn FileApi>,
        transcript_api: Arc<dyn TranscriptApi>,
    ) -> Self {
        let cache = QueryCache::from_config(&config);
        let bus = EventBus::new(&config, source.clone(), cache);
        let files = FileSyncStore::from_config(file_api, &config);
        let transcripts = TranscriptSync::new(
            &config,
            source,
            TranscriptCache::from_config(transcript_api, &config),
        );

        Self {
            config,
            bus,
            files,
            transcripts,
            file_listener: Mutex::new(None),
        }
    }

    /// Open the change-notification stream and start routing file changes.
    /// Must run inside a tokio runtime.
    pub fn connect(&self) {
        {
            let mut listener = self.file_listener.lock();
            if listener.as_ref().map(|task| task.is_finished()).unwrap_or(true) {
                *listener = Some(self.files.attach(&self.bus));
            }
        }
        self.bus.connect();
        info!(base_url = %self.config.base_url, "sync client connected");
    }

    /// Drop the notification stream and stop the file listener. Open files,
    /// cached queries and conversation logs are kept.
    pub fn close(&self) {
        self.bus.close();
        if let Some(listener) = self.file_listener.lock().take() {
            listener.abort();
        }
    }

    /// Manual reconnect after the connection was reported lost.
    pub fn reconnect(&self) {
        self.bus.reconnect();
    }

    /// Forward page visibility to the bus and every conversation stream.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.bus.set_visibility(visibility);
        self.transcripts.set_visibility(visibility);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.bus.state()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn queries(&self) -> &QueryCache {
        self.bus.cache()
    }

    pub fn files(&self) -> &FileSyncStore {
        &self.files
    }

    pub fn transcripts(&self) -> &TranscriptSync {
        &self.transcripts
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.close();
    }
}
