//! Change-notification bus.
//!
//! The event bus provides:
//! - One shared connection to the server's push endpoint
//! - Publish-subscribe fan-out of typed change notifications
//! - Routing of each notification to the cache namespaces it invalidates
//!
//! # Architecture
//!
//! Notifications flow from server → stream driver → EventBus → consumers:
//! - `StreamController`: owns the transport, reconnects with backoff
//! - `EventBus`: parses frames, drops heartbeats, invalidates the
//!   `QueryCache` through the `InvalidationRouter`, then notifies
//!   subscribers and broadcast receivers

mod event_bus;
pub mod event_types;
mod notification;

pub use event_bus::{EventBus, Subscription};
pub use notification::ChangeNotification;
