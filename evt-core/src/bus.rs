//! Message bus abstraction
//!
//! The harness talks to EVerest over a publish/subscribe bus. Everything above
//! this module only sees [`MessageBus`]; the MQTT client lives in
//! [`crate::mqtt`] and [`LocalBus`] provides an in-process broker for tests
//! and for wiring several probes together without a broker.
//!
//! Delivery guarantees:
//! - each subscription gets its own delivery task, so handlers of one
//!   subscription never run concurrently with each other
//! - messages on a topic reach a handler in publish order
//! - a handler may publish or subscribe from inside its callback

use crate::topic;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace};

/// Errors raised by bus implementations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus is disconnected")]
    Disconnected,

    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),

    #[error("invalid publish topic: {0}")]
    InvalidTopic(String),

    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("no tokio runtime available for delivery tasks")]
    NoRuntime,

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MQTT client error: {0}")]
    Client(String),
}

/// A message delivered to a subscriber
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Decode the payload as JSON
    pub fn json(&self) -> Result<serde_json::Value, BusError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Payload as text, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Subscription callback
pub type Handler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Handle returned by [`MessageBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Topic-based publish/subscribe transport
pub trait MessageBus: Send + Sync {
    /// Publish a payload. Fails immediately while disconnected, nothing is queued.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Register a handler for every topic matching `pattern`
    fn subscribe(&self, pattern: &str, handler: Handler) -> Result<SubscriptionId, BusError>;

    /// Drop a subscription. Messages already queued for it may still be delivered.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError>;

    /// Connection state. Implementations without a connection are always up.
    fn connection_state(&self) -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(true);
        rx
    }

    fn is_connected(&self) -> bool {
        *self.connection_state().borrow()
    }
}

/// Convenience helpers on top of any [`MessageBus`]
pub trait MessageBusExt: MessageBus {
    fn publish_json<T: Serialize + ?Sized>(&self, topic: &str, value: &T) -> Result<(), BusError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload)
    }

    fn subscribe_fn<F>(&self, pattern: &str, f: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(BusMessage) + Send + Sync + 'static,
    {
        self.subscribe(pattern, Arc::new(f))
    }
}

impl<B: MessageBus + ?Sized> MessageBusExt for B {}

struct Route {
    id: SubscriptionId,
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// Fan-out of incoming messages to subscription delivery tasks
///
/// Shared by every bus implementation. Each route owns an unbounded channel
/// drained by one spawned task which invokes the handler.
pub struct Router {
    next_id: AtomicU64,
    routes: RwLock<Vec<Route>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Register a route and start its delivery task
    pub fn add(&self, pattern: &str, handler: Handler) -> Result<SubscriptionId, BusError> {
        if !topic::is_valid_pattern(pattern) {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();

        runtime.spawn(async move {
            while let Some(msg) = rx.recv().await {
                let topic = msg.topic.clone();
                if panic::catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                    error!("Handler of {} panicked on {}", id, topic);
                }
            }
            trace!("Delivery task for {} finished", id);
        });

        self.routes.write().push(Route {
            id,
            pattern: pattern.to_string(),
            tx,
        });
        debug!("Subscribed {} to {}", id, pattern);
        Ok(id)
    }

    /// Remove a route, returning its pattern
    pub fn remove(&self, id: SubscriptionId) -> Option<String> {
        let mut routes = self.routes.write();
        let pos = routes.iter().position(|r| r.id == id)?;
        let route = routes.remove(pos);
        debug!("Unsubscribed {} from {}", id, route.pattern);
        Some(route.pattern)
    }

    /// Queue a message on every matching route. Returns the number of matches.
    pub fn route(&self, topic: &str, payload: &[u8]) -> usize {
        let routes = self.routes.read();
        let mut delivered = 0;
        for route in routes.iter().filter(|r| topic::topic_matches(&r.pattern, topic)) {
            let msg = BusMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            if route.tx.send(msg).is_ok() {
                delivered += 1;
            }
        }
        trace!("Routed {} to {} subscriber(s)", topic, delivered);
        delivered
    }

    /// Distinct patterns currently subscribed
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.routes.read().iter().map(|r| r.pattern.clone()).collect();
        patterns.sort();
        patterns.dedup();
        patterns
    }

    pub fn has_pattern(&self, pattern: &str) -> bool {
        self.routes.read().iter().any(|r| r.pattern == pattern)
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process bus
///
/// Publishing routes synchronously into the subscriber queues. The connection
/// flag can be toggled to exercise outage handling.
pub struct LocalBus {
    router: Router,
    connected: watch::Sender<bool>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        let (connected, _) = watch::channel(true);
        Arc::new(Self {
            router: Router::new(),
            connected,
        })
    }

    /// Simulate a broker outage or recovery
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    pub fn subscription_count(&self) -> usize {
        self.router.len()
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if !*self.connected.borrow() {
            return Err(BusError::Disconnected);
        }
        if !topic::is_valid_topic(topic) {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }
        self.router.route(topic, &payload);
        Ok(())
    }

    fn subscribe(&self, pattern: &str, handler: Handler) -> Result<SubscriptionId, BusError> {
        self.router.add(pattern, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.router
            .remove(id)
            .map(|_| ())
            .ok_or(BusError::UnknownSubscription(id))
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}
