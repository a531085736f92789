//! Cross-module tests.
//!
//! - `events`: the event bus over a scripted stream, routing into the
//!   query cache, lifecycle notifications
//! - `integration`: a whole `SyncClient` wired to in-memory fakes

use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::bus::{ChangeNotification, EventBus, Subscription};
use crate::stream::{SseEvent, StreamError};


#[cfg(test)]
mod integration;

/// A generic-channel frame as the server sends it.
pub fn notification_frame(kind: &str, data: serde_json::Value) -> Result<SseEvent, StreamError> {
    Ok(SseEvent::message(
        json!({ "type": kind, "data": data, "timestamp": "2026-03-01T12:00:00Z" }).to_string(),
    ))
}

/// Subscribe to `pattern` and collect the kinds it receives.
pub fn record_kinds(bus: &EventBus, pattern: &str) -> (Arc<Mutex<Vec<String>>>, Subscription) {
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = kinds.clone();
    let subscription = bus.subscribe(pattern, move |notification: &ChangeNotification| {
        sink.lock().unwrap().push(notification.kind.clone());
    });
    (kinds, subscription)
}
