use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

use super::event_types::{is_synthetic, KIND_CONNECTED, KIND_CONNECTION_LOST};
use super::ChangeNotification;
use crate::cache::{kind_matches, InvalidationRouter, QueryCache};
use crate::config::SyncConfig;
use crate::stream::{
    BackoffPolicy, ConnectionState, EventSource, SseEvent, StreamController, StreamError,
    StreamHandler, StreamRequest, Visibility,
};

const BUS_CAPACITY: usize = 1024;
const GENERIC_FRAME: &str = "message";

type Handler = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

struct Subscriber {
    pattern: String,
    handler: Handler,
}

/// State shared between the bus handle, its stream driver and subscriptions.
struct BusShared {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    tx: broadcast::Sender<ChangeNotification>,
    last_event: watch::Sender<Option<ChangeNotification>>,
    cache: QueryCache,
    router: InvalidationRouter,
}

impl BusShared {
    /// Invalidate routed namespaces, then fan out to handlers and receivers.
    fn dispatch(&self, notification: ChangeNotification) {
        let keys = self.router.route(&notification.kind);
        if !keys.is_empty() {
            self.cache.invalidate_many(&keys);
        }

        self.last_event.send_replace(Some(notification.clone()));

        // Collected first so a handler may unsubscribe itself.
        let handlers: Vec<Handler> = self
            .subscribers
            .iter()
            .filter(|subscriber| kind_matches(&subscriber.pattern, &notification.kind))
            .map(|subscriber| subscriber.handler.clone())
            .collect();
        for handler in handlers {
            handler(&notification);
        }

        if self.tx.send(notification).is_err() {
            trace!("event bus publish had no receivers");
        }
    }
}

/// Process-wide change-notification bus.
///
/// Owns the single connection to the server's push endpoint. Every received
/// notification invalidates the namespaces the router maps it to, then is
/// delivered to matching subscribers and broadcast receivers.
pub struct EventBus {
    shared: Arc<BusShared>,
    source: Arc<dyn EventSource>,
    policy: BackoffPolicy,
    events_path: String,
    controller: Mutex<Option<StreamController>>,
    visibility: Mutex<Visibility>,
}

impl EventBus {
    pub fn new(config: &SyncConfig, source: Arc<dyn EventSource>, cache: QueryCache) -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        let (last_event, _) = watch::channel(None);
        Self {
            shared: Arc::new(BusShared {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                tx,
                last_event,
                cache,
                router: InvalidationRouter::new(),
            }),
            source,
            policy: BackoffPolicy::from(&config.backoff),
            events_path: config.events_path.clone(),
            controller: Mutex::new(None),
            visibility: Mutex::new(Visibility::Visible),
        }
    }

    /// Start the stream driver. No-op while one is already running.
    pub fn connect(&self) {
        let mut controller = self.controller.lock();
        if controller.as_ref().map(|c| c.is_running()).unwrap_or(false) {
            debug!("event bus already connected");
            return;
        }

        info!(path = %self.events_path, "event bus connecting");
        let handler = BusStreamHandler {
            shared: self.shared.clone(),
            path: self.events_path.clone(),
        };
        let started = StreamController::spawn("events", self.source.clone(), self.policy, handler);
        if *self.visibility.lock() == Visibility::Hidden {
            started.set_visibility(Visibility::Hidden);
        }
        *controller = Some(started);
    }

    /// Drop the connection. Subscriptions stay registered for a later `connect()`.
    pub fn close(&self) {
        if let Some(controller) = self.controller.lock().take() {
            controller.close();
            info!("event bus closed");
        }
    }

    /// Manual reconnect, the only way out of the terminal lost state.
    pub fn reconnect(&self) {
        let running = {
            let controller = self.controller.lock();
            match controller.as_ref() {
                Some(controller) if controller.is_running() => {
                    controller.reconnect();
                    true
                }
                _ => false,
            }
        };
        if !running {
            self.connect();
        }
    }

    /// Forward a page visibility change. Becoming visible after being hidden
    /// reconnects and marks every cached namespace stale.
    pub fn set_visibility(&self, visibility: Visibility) {
        *self.visibility.lock() = visibility;
        if let Some(controller) = self.controller.lock().as_ref() {
            controller.set_visibility(visibility);
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.controller.lock().as_ref() {
            Some(controller) => controller.state(),
            None => {
                let mut state = ConnectionState::new(self.policy.max_attempts);
                state.suspended = *self.visibility.lock() == Visibility::Hidden;
                state
            }
        }
    }

    pub fn watch_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.controller.lock().as_ref().map(|c| c.watch_state())
    }

    pub fn last_event(&self) -> Option<ChangeNotification> {
        self.shared.last_event.borrow().clone()
    }

    /// Register `handler` for kinds matching `pattern` (`"kind"`, `"ns.*"` or `"*"`).
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        handler: impl Fn(&ChangeNotification) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let pattern = pattern.into();
        debug!(id, %pattern, "event bus subscriber added");
        self.shared.subscribers.insert(
            id,
            Subscriber {
                pattern,
                handler: Arc::new(handler),
            },
        );
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Get a new receiver for every dispatched notification.
    pub fn receiver(&self) -> broadcast::Receiver<ChangeNotification> {
        self.shared.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Dispatch a notification as if it had arrived on the stream.
    pub fn publish(&self, notification: ChangeNotification) {
        if notification.is_heartbeat() {
            return;
        }
        self.shared.dispatch(notification);
    }

    pub fn cache(&self) -> &QueryCache {
        &self.shared.cache
    }

    pub fn router(&self) -> &InvalidationRouter {
        &self.shared.router
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.close();
    }
}

/// RAII handle for a bus subscription.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    id: u64,
    shared: Weak<BusShared>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers.remove(&self.id);
            debug!(id = self.id, "event bus subscriber removed");
        }
    }
}

struct BusStreamHandler {
    shared: Arc<BusShared>,
    path: String,
}

#[async_trait]
impl StreamHandler for BusStreamHandler {
    async fn prepare(&mut self) -> Result<StreamRequest, StreamError> {
        Ok(StreamRequest::new(self.path.clone()))
    }

    fn on_open(&mut self) {
        self.shared
            .dispatch(ChangeNotification::new(KIND_CONNECTED, Map::new()));
    }

    fn on_frame(&mut self, frame: SseEvent) {
        if frame.event_type != GENERIC_FRAME {
            trace!(event = %frame.event_type, "ignoring named frame on generic channel");
            return;
        }

        match ChangeNotification::from_json(&frame.data) {
            Ok(notification) if notification.is_heartbeat() => {
                trace!("heartbeat");
            }
            Ok(notification) if is_synthetic(&notification.kind) => {
                warn!(kind = %notification.kind, "server sent a locally reserved kind, ignoring");
            }
            Ok(notification) => {
                debug!(kind = %notification.kind, "notification received");
                self.shared.dispatch(notification);
            }
            Err(e) => warn!("dropping malformed notification: {e}"),
        }
    }

    fn on_lost(&mut self, error: &StreamError) {
        let mut payload = Map::new();
        payload.insert("error".to_string(), Value::String(error.to_string()));
        self.shared
            .dispatch(ChangeNotification::new(KIND_CONNECTION_LOST, payload));
    }

    fn on_resume(&mut self) {
        // Events may have been missed while hidden.
        let marked = self.shared.cache.invalidate_all();
        info!(marked, "event bus resumed, full cache resync");
    }
}
