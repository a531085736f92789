//! Reconnect driver shared by every push stream.
//!
//! One driver task owns one transport connection. It opens the stream,
//! hands frames to a `StreamHandler`, retries with exponential backoff on
//! failure, gives up after the configured number of consecutive failures,
//! and parks while the page is hidden. The owning `StreamController`
//! steers it through a command channel and observes it through a `watch`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BackoffPolicy, ConnectionState, EventSource, FrameStream, SseEvent, StreamError, StreamRequest};

/// Page visibility as reported by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Consumer side of a stream. Callbacks run on the driver task, in order.
#[async_trait]
pub trait StreamHandler: Send + 'static {
    /// Build the request for the next open. Runs before every attempt, so
    /// it is where a cursor is read or a cold-start backfill happens.
    async fn prepare(&mut self) -> Result<StreamRequest, StreamError>;

    fn on_frame(&mut self, frame: SseEvent);

    fn on_open(&mut self) {}

    fn on_disconnect(&mut self, _error: &StreamError) {}

    /// Retries exhausted (or a non-retryable failure). Terminal until a
    /// manual reconnect.
    fn on_lost(&mut self, _error: &StreamError) {}

    fn on_suspend(&mut self) {}

    /// Page became visible again after being hidden.
    fn on_resume(&mut self) {}

    /// A finished handler stops the driver the next time the stream ends.
    fn is_finished(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Suspend,
    Resume,
    Reconnect,
    Close,
}

enum SessionEnd {
    /// A command (or a dropped controller, `None`) cut the session short.
    Interrupted(Option<Command>),
    Failed(StreamError),
}

/// Handle to a running stream driver. Dropping it stops the driver.
pub struct StreamController {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<ConnectionState>>,
    task: JoinHandle<()>,
}

impl StreamController {
    /// Spawn a driver for `handler` on the current tokio runtime and start
    /// connecting immediately.
    pub fn spawn<H: StreamHandler>(
        name: impl Into<String>,
        source: Arc<dyn EventSource>,
        policy: BackoffPolicy,
        handler: H,
    ) -> Self {
        let name = name.into();
        let (commands, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::new(policy.max_attempts));
        let state = Arc::new(state);

        let driver = Driver {
            name: name.clone(),
            source,
            policy,
            handler,
            state: state.clone(),
        };
        let task = tokio::spawn(driver.run(rx));

        Self {
            name,
            commands,
            state,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        match visibility {
            Visibility::Hidden => self.send(Command::Suspend),
            Visibility::Visible => self.send(Command::Resume),
        }
    }

    /// Leave the terminal state (or cut a backoff wait short) and connect now.
    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    /// Stop the driver and drop its transport.
    pub fn close(&self) {
        self.send(Command::Close);
        self.task.abort();
        self.state.send_modify(|state| state.connected = false);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(stream = %self.name, ?command, "stream driver already stopped");
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Driver<H> {
    name: String,
    source: Arc<dyn EventSource>,
    policy: BackoffPolicy,
    handler: H,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl<H: StreamHandler> Driver<H> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            if self.current().is_idle() {
                match commands.recv().await {
                    Some(command) => {
                        if !self.apply(command) {
                            break;
                        }
                    }
                    None => break,
                }
                continue;
            }

            match self.run_session(&mut commands).await {
                SessionEnd::Interrupted(Some(command)) => {
                    if !self.apply(command) {
                        break;
                    }
                }
                SessionEnd::Interrupted(None) => break,
                SessionEnd::Failed(error) => {
                    if self.handler.is_finished() {
                        info!(stream = %self.name, "stream finished: {error}");
                        break;
                    }
                    if !self.retry_after(error, &mut commands).await {
                        break;
                    }
                }
            }
        }

        self.update(|state| state.connected = false);
        debug!(stream = %self.name, "stream driver stopped");
    }

    /// Prepare, open and pump one connection until it fails or a command
    /// interrupts it.
    async fn run_session(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> SessionEnd {
        let opened = {
            let open = open_stream(&self.source, &mut self.handler);
            tokio::pin!(open);
            loop {
                tokio::select! {
                    biased;
                    command = commands.recv() => match command {
                        Some(Command::Resume) => continue,
                        other => return SessionEnd::Interrupted(other),
                    },
                    result = &mut open => break result,
                }
            }
        };

        let mut frames = match opened {
            Ok(frames) => frames,
            Err(error) => return SessionEnd::Failed(error),
        };

        self.update(|state| {
            state.connected = true;
            state.attempt = 0;
        });
        info!(stream = %self.name, "stream connected");
        self.handler.on_open();

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Resume) => {}
                    other => return SessionEnd::Interrupted(other),
                },
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => self.handler.on_frame(frame),
                    Some(Err(StreamError::SseParse(message))) => {
                        warn!(stream = %self.name, "dropping malformed frame: {message}");
                    }
                    Some(Err(error)) => return SessionEnd::Failed(error),
                    None => return SessionEnd::Failed(StreamError::Closed),
                },
            }
        }
    }

    /// Record a failure and either wait out the backoff delay or enter the
    /// terminal state. Returns false when the driver should exit.
    async fn retry_after(
        &mut self,
        error: StreamError,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let current = self.current();
        let delay = self.policy.delay(current.attempt);
        let attempt = current.attempt.saturating_add(1);
        self.update(|state| {
            state.connected = false;
            state.attempt = attempt;
        });

        if !error.is_retryable() || attempt >= self.policy.max_attempts {
            self.update(|state| state.lost = true);
            error!(
                stream = %self.name,
                attempts = attempt,
                "stream connection lost, manual reconnect required: {error}"
            );
            self.handler.on_lost(&error);
            return true;
        }

        warn!(
            stream = %self.name,
            "stream disconnected ({error}), reconnecting in {delay:?} (attempt {attempt}/{})",
            self.policy.max_attempts
        );
        self.handler.on_disconnect(&error);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Resume) => {}
                    Some(command) => return self.apply(command),
                    None => return false,
                },
                _ = &mut sleep => return true,
            }
        }
    }

    /// Apply a control command. Returns false for `Close`.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Close => return false,
            Command::Suspend => {
                if !self.current().suspended {
                    // attempt is left as is; resume resets it.
                    self.update(|state| {
                        state.suspended = true;
                        state.connected = false;
                    });
                    info!(stream = %self.name, "stream suspended");
                    self.handler.on_suspend();
                }
            }
            Command::Resume => {
                if self.current().suspended {
                    self.update(|state| {
                        state.suspended = false;
                        state.lost = false;
                        state.attempt = 0;
                    });
                    info!(stream = %self.name, "stream resumed");
                    self.handler.on_resume();
                }
            }
            Command::Reconnect => {
                self.update(|state| {
                    state.connected = false;
                    state.lost = false;
                    state.attempt = 0;
                });
                info!(stream = %self.name, "manual reconnect requested");
            }
        }
        true
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn update(&self, modify: impl FnOnce(&mut ConnectionState)) {
        self.state.send_modify(modify);
    }
}

async fn open_stream<H: StreamHandler>(
    source: &Arc<dyn EventSource>,
    handler: &mut H,
) -> Result<FrameStream, StreamError> {
    let request = handler.prepare().await?;
    source.open(&request).await
}
