//! Probe module
//!
//! A stand-in EVerest module driven by test code. It can implement commands
//! for the modules that require it, call commands on the modules it requires,
//! publish and subscribe to variables and raise errors. Every interaction
//! goes through a [`MessageBus`], so two probes on one bus can talk to each
//! other without any EVerest process.
//!
//! Command calls are correlated by a fresh call id. The reply subscription
//! exists only for the duration of one call and is removed on completion,
//! timeout or cancellation; replies arriving after that are dropped.

use crate::bus::{BusError, BusMessage, MessageBus, MessageBusExt, SubscriptionId};
use crate::error_record::{
    ErrorFilter, ErrorRecord, ErrorRecordError, ErrorRegistry, ImplementationIdentifier, Severity,
};
use crate::types::{
    CommandRequest, CommandResponse, Connections, Fulfillment, RemoteErrorKind, RemoteFailure,
    Topics, DEFAULT_PREFIX,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Default timeout for command calls
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("command {command} of implementation {implementation_id} is already implemented")]
    AlreadyImplemented {
        implementation_id: String,
        command: String,
    },

    #[error("requirement {0} has no connection")]
    UnknownConnection(String),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("remote {kind} error: {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("transport failed: {0}")]
    TransportFailed(#[from] BusError),

    #[error("no active error with uuid {0}")]
    UnknownError(String),

    #[error("probe module was stopped")]
    Stopped,

    #[error(transparent)]
    Errors(#[from] ErrorRecordError),
}

/// Probe module configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub module_id: String,
    pub prefix: String,
    pub connections: Connections,
    pub command_timeout: Duration,
    /// Capacity of queues returned by [`ProbeModule::subscribe_variable_to_queue`]
    pub queue_capacity: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            module_id: "probe".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            connections: Connections::new(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            queue_capacity: 256,
        }
    }
}

impl ProbeConfig {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Append a fulfillment to a requirement
    pub fn with_connection(mut self, requirement_id: impl Into<String>, fulfillment: Fulfillment) -> Self {
        self.connections
            .entry(requirement_id.into())
            .or_default()
            .push(fulfillment);
        self
    }

    pub fn with_connections(mut self, connections: Connections) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

type CommandHandler = Arc<dyn Fn(Value) -> Result<Value, RemoteFailure> + Send + Sync>;

struct Inner {
    config: ProbeConfig,
    topics: Topics,
    bus: Arc<dyn MessageBus>,
    commands: Mutex<HashMap<(String, String), SubscriptionId>>,
    pending: Mutex<HashMap<String, oneshot::Sender<CommandResponse>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    ready: watch::Sender<bool>,
    errors: Mutex<ErrorRegistry>,
}

impl Inner {
    fn handle_command(&self, handler: &CommandHandler, command: &str, msg: BusMessage) {
        let request: CommandRequest = match serde_json::from_slice(&msg.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed command request on {}: {}", msg.topic, e);
                return;
            }
        };
        debug!("Command {} called by {} ({})", command, request.origin, request.id);

        let result = catch_unwind(AssertUnwindSafe(|| handler(request.args)))
            .unwrap_or_else(|_| Err(RemoteFailure::handler(format!("handler for {} panicked", command))));

        let response = CommandResponse::from_result(request.id, result);
        if let Err(e) = self.bus.publish_json(&request.reply_to, &response) {
            warn!("Failed to reply to {}: {}", request.reply_to, e);
        }
    }

    fn deliver_response(&self, msg: BusMessage) {
        let response: CommandResponse = match serde_json::from_slice(&msg.payload) {
            Ok(response) => response,
            Err(e) => {
                warn!("Malformed command response on {}: {}", msg.topic, e);
                return;
            }
        };
        match self.pending.lock().remove(&response.id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!("Dropping response for unknown call {}", response.id),
        }
    }

    fn resolve(&self, requirement_id: &str, index: usize) -> Result<&Fulfillment, ProbeError> {
        self.config
            .connections
            .get(requirement_id)
            .and_then(|list| list.get(index))
            .ok_or_else(|| ProbeError::UnknownConnection(requirement_id.to_string()))
    }

    fn origin(&self, implementation_id: &str) -> ImplementationIdentifier {
        ImplementationIdentifier::new(&self.config.module_id, implementation_id)
    }
}

/// Removes the pending entry and reply subscription when a call ends
struct PendingCall<'a> {
    inner: &'a Inner,
    call_id: String,
    subscription: Option<SubscriptionId>,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.call_id);
        if let Some(id) = self.subscription.take() {
            if let Err(e) = self.inner.bus.unsubscribe(id) {
                debug!("Reply subscription cleanup failed: {}", e);
            }
        }
    }
}

/// Test-controlled EVerest module
#[derive(Clone)]
pub struct ProbeModule {
    inner: Arc<Inner>,
}

impl ProbeModule {
    pub fn new(bus: Arc<dyn MessageBus>, config: ProbeConfig) -> Self {
        let (ready, _) = watch::channel(false);
        let topics = Topics::new(config.prefix.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                topics,
                bus,
                commands: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                ready,
                errors: Mutex::new(ErrorRegistry::new()),
            }),
        }
    }

    pub fn module_id(&self) -> &str {
        &self.inner.config.module_id
    }

    pub fn topics(&self) -> &Topics {
        &self.inner.topics
    }

    pub fn connections(&self) -> &Connections {
        &self.inner.config.connections
    }

    /// Number of command calls still awaiting a reply
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Serve a command on one of the probe's implementations
    pub fn implement_command<F>(&self, implementation_id: &str, name: &str, handler: F) -> Result<(), ProbeError>
    where
        F: Fn(Value) -> Result<Value, RemoteFailure> + Send + Sync + 'static,
    {
        let key = (implementation_id.to_string(), name.to_string());
        let mut commands = self.inner.commands.lock();
        if commands.contains_key(&key) {
            return Err(ProbeError::AlreadyImplemented {
                implementation_id: key.0,
                command: key.1,
            });
        }

        let topic = self
            .inner
            .topics
            .command(&self.inner.config.module_id, implementation_id, name);
        let handler: CommandHandler = Arc::new(handler);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let command = name.to_string();

        let id = self.inner.bus.subscribe_fn(&topic, move |msg| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_command(&handler, &command, msg);
            }
        })?;
        commands.insert(key, id);
        debug!("Implemented command {} on {}", name, topic);
        Ok(())
    }

    /// Call a command on the first fulfillment of a requirement
    pub async fn call_command(&self, requirement_id: &str, name: &str, args: Value) -> Result<Value, ProbeError> {
        self.call_command_with_timeout(requirement_id, name, args, self.inner.config.command_timeout)
            .await
    }

    pub async fn call_command_with_timeout(
        &self,
        requirement_id: &str,
        name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, ProbeError> {
        self.call_command_at(requirement_id, 0, name, args, timeout).await
    }

    /// Call a command on the `index`-th fulfillment of a requirement
    pub async fn call_command_at(
        &self,
        requirement_id: &str,
        index: usize,
        name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, ProbeError> {
        let inner = &*self.inner;
        let target = inner.resolve(requirement_id, index)?;
        let command_topic = inner
            .topics
            .command(&target.module_id, &target.implementation_id, name);

        let call_id = uuid::Uuid::new_v4().to_string();
        let reply_to = inner.topics.response(&inner.config.module_id, &call_id);
        let (tx, rx) = oneshot::channel();
        inner.pending.lock().insert(call_id.clone(), tx);

        let mut guard = PendingCall {
            inner,
            call_id: call_id.clone(),
            subscription: None,
        };

        let weak = Arc::downgrade(&self.inner);
        guard.subscription = Some(inner.bus.subscribe_fn(&reply_to, move |msg| {
            if let Some(inner) = weak.upgrade() {
                inner.deliver_response(msg);
            }
        })?);

        let request = CommandRequest {
            id: call_id,
            args,
            origin: inner.config.module_id.clone(),
            reply_to,
        };
        debug!("Calling {} on {} ({})", name, target, request.id);
        inner.bus.publish_json(&command_topic, &request)?;

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(guard);

        match outcome {
            Ok(Ok(response)) => response.into_result().map_err(|f| ProbeError::Remote {
                kind: f.kind,
                message: f.message,
            }),
            Ok(Err(_)) => Err(ProbeError::Stopped),
            Err(_) => {
                warn!("Command {} on {} timed out after {:?}", name, target, timeout);
                Err(ProbeError::Timeout {
                    what: format!("{} on {}", name, target),
                    after: timeout,
                })
            }
        }
    }

    /// Publish a variable of one of the probe's implementations
    pub fn publish_variable<T: Serialize + ?Sized>(
        &self,
        implementation_id: &str,
        name: &str,
        value: &T,
    ) -> Result<(), ProbeError> {
        let topic = self
            .inner
            .topics
            .variable(&self.inner.config.module_id, implementation_id, name);
        self.inner.bus.publish_json(&topic, value)?;
        Ok(())
    }

    /// Invoke `handler` for every value a required module publishes
    pub fn subscribe_variable<F>(&self, requirement_id: &str, name: &str, handler: F) -> Result<SubscriptionId, ProbeError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let target = self.inner.resolve(requirement_id, 0)?;
        let topic = self
            .inner
            .topics
            .variable(&target.module_id, &target.implementation_id, name);

        let id = self.inner.bus.subscribe_fn(&topic, move |msg| match msg.json() {
            Ok(value) => handler(value),
            Err(e) => warn!("Ignoring non-JSON variable on {}: {}", msg.topic, e),
        })?;
        self.inner.subscriptions.lock().push(id);
        Ok(id)
    }

    /// Buffer a required module's variable in a bounded queue
    pub fn subscribe_variable_to_queue(&self, requirement_id: &str, name: &str) -> Result<VariableQueue, ProbeError> {
        let target = self.inner.resolve(requirement_id, 0)?;
        let topic = self
            .inner
            .topics
            .variable(&target.module_id, &target.implementation_id, name);
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity);

        let queue_topic = topic.clone();
        let subscription = self.inner.bus.subscribe_fn(&topic, move |msg| {
            let value = match msg.json() {
                Ok(value) => value,
                Err(e) => {
                    warn!("Ignoring non-JSON variable on {}: {}", msg.topic, e);
                    return;
                }
            };
            if tx.try_send(value).is_err() {
                warn!("Variable queue for {} is full or closed, dropping value", queue_topic);
            }
        })?;

        Ok(VariableQueue {
            rx,
            topic,
            subscription,
            bus: self.inner.bus.clone(),
        })
    }

    /// Announce readiness and start listening for the global ready signal
    pub fn start(&self) -> Result<(), ProbeError> {
        let ready = self.inner.ready.clone();
        let id = self
            .inner
            .bus
            .subscribe_fn(&self.inner.topics.global_ready(), move |msg| {
                if matches!(msg.json(), Ok(Value::Bool(true))) {
                    ready.send_replace(true);
                }
            })?;
        self.inner.subscriptions.lock().push(id);

        let topic = self.inner.topics.module_ready(&self.inner.config.module_id);
        self.inner.bus.publish_json(&topic, &true)?;
        info!("Probe module {} started", self.inner.config.module_id);
        Ok(())
    }

    /// Wait for the framework-wide ready signal
    pub async fn wait_to_be_ready(&self, timeout: Duration) -> Result<(), ProbeError> {
        let mut rx = self.inner.ready.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ProbeError::Stopped),
            Err(_) => Err(ProbeError::Timeout {
                what: "global ready signal".to_string(),
                after: timeout,
            }),
        };
        result
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Raise an error on one of the probe's implementations
    pub fn raise_error(
        &self,
        implementation_id: &str,
        error_type: &str,
        sub_type: &str,
        message: &str,
        severity: Severity,
    ) -> Result<ErrorRecord, ProbeError> {
        let record = ErrorRecord::new(
            error_type,
            sub_type,
            message,
            severity,
            self.inner.origin(implementation_id),
        );
        let record = self.inner.errors.lock().raise(record)?.clone();

        let topic = self
            .inner
            .topics
            .error_raised(&self.inner.config.module_id, implementation_id, error_type);
        self.inner.bus.publish_json(&topic, &record)?;
        info!("Raised {} ({:?}) on {}", error_type, severity, implementation_id);
        Ok(record)
    }

    pub fn clear_error(&self, implementation_id: &str, error_type: &str, sub_type: &str) -> Result<ErrorRecord, ProbeError> {
        let origin = self.inner.origin(implementation_id);
        let record = self.inner.errors.lock().clear(error_type, sub_type, &origin)?;

        let topic = self
            .inner
            .topics
            .error_cleared(&self.inner.config.module_id, implementation_id, error_type);
        self.inner.bus.publish_json(&topic, &record)?;
        info!("Cleared {} on {}", error_type, implementation_id);
        Ok(record)
    }

    /// Clear a previously raised error by its uuid
    pub fn clear_error_by_uuid(&self, uuid: &str) -> Result<ErrorRecord, ProbeError> {
        let record = self
            .inner
            .errors
            .lock()
            .clear_by_uuid(uuid)
            .ok_or_else(|| ProbeError::UnknownError(uuid.to_string()))?;

        let topic = self.inner.topics.error_cleared(
            &record.origin.module_id,
            &record.origin.implementation_id,
            &record.error_type,
        );
        self.inner.bus.publish_json(&topic, &record)?;
        Ok(record)
    }

    pub fn clear_all_errors(&self, implementation_id: &str) -> Result<Vec<ErrorRecord>, ProbeError> {
        let origin = self.inner.origin(implementation_id);
        let cleared = self.inner.errors.lock().clear_all(&origin);
        for record in &cleared {
            let topic = self.inner.topics.error_cleared(
                &self.inner.config.module_id,
                implementation_id,
                &record.error_type,
            );
            self.inner.bus.publish_json(&topic, record)?;
        }
        Ok(cleared)
    }

    /// Errors raised by this probe matching a filter
    pub fn errors(&self, filter: &ErrorFilter) -> Vec<ErrorRecord> {
        self.inner.errors.lock().query(filter)
    }

    /// Serve `get_errors` on `implementation_id` from the probe's own records
    ///
    /// Arguments are `{"filters": ErrorFilter}`, the result is the list of
    /// matching records, the same shape the ErrorHistory module answers with.
    pub fn serve_error_history(&self, implementation_id: &str) -> Result<(), ProbeError> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.implement_command(implementation_id, "get_errors", move |args| {
            let filter: ErrorFilter = match args.get("filters") {
                Some(filters) if !filters.is_null() => serde_json::from_value(filters.clone())
                    .map_err(|e| RemoteFailure::new(RemoteErrorKind::SchemaValidationError, e.to_string()))?,
                _ => ErrorFilter::default(),
            };
            let inner = weak
                .upgrade()
                .ok_or_else(|| RemoteFailure::new(RemoteErrorKind::Shutdown, "probe stopped"))?;
            let records = inner.errors.lock().query(&filter);
            serde_json::to_value(records).map_err(|e| RemoteFailure::handler(e.to_string()))
        })
    }

    /// Drop every subscription and fail outstanding calls
    pub fn stop(&self) {
        let commands: Vec<SubscriptionId> = self.inner.commands.lock().drain().map(|(_, id)| id).collect();
        let subscriptions: Vec<SubscriptionId> = self.inner.subscriptions.lock().drain(..).collect();
        for id in commands.into_iter().chain(subscriptions) {
            if let Err(e) = self.inner.bus.unsubscribe(id) {
                debug!("Unsubscribe during stop failed: {}", e);
            }
        }
        self.inner.pending.lock().clear();
        self.inner.ready.send_replace(false);
        info!("Probe module {} stopped", self.inner.config.module_id);
    }
}

/// Bounded buffer of variable values
///
/// Unsubscribes when dropped. Values arriving while the queue is full are
/// discarded with a warning.
pub struct VariableQueue {
    rx: mpsc::Receiver<Value>,
    topic: String,
    subscription: SubscriptionId,
    bus: Arc<dyn MessageBus>,
}

impl VariableQueue {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Value, ProbeError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(ProbeError::Stopped),
            Err(_) => Err(ProbeError::Timeout {
                what: format!("value on {}", self.topic),
                after: timeout,
            }),
        }
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

impl Drop for VariableQueue {
    fn drop(&mut self) {
        if let Err(e) = self.bus.unsubscribe(self.subscription) {
            debug!("Variable queue cleanup for {} failed: {}", self.topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use serde_json::json;

    fn pair() -> (Arc<LocalBus>, ProbeModule, ProbeModule) {
        let bus = LocalBus::new();
        let caller = ProbeModule::new(
            bus.clone(),
            ProbeConfig::new("probe")
                .with_connection("evse", Fulfillment::new("peer", "main"))
                .with_command_timeout(Duration::from_secs(2)),
        );
        let peer = ProbeModule::new(bus.clone(), ProbeConfig::new("peer"));
        (bus, caller, peer)
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (_bus, caller, peer) = pair();
        peer.implement_command("main", "echo", |args| Ok(json!({ "got": args })))
            .unwrap();

        let result = caller
            .call_command("evse", "echo", json!({"value": 7}))
            .await
            .unwrap();
        assert_eq!(result, json!({"got": {"value": 7}}));
        assert_eq!(caller.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_surfaces_kind_and_message() {
        let (_bus, caller, peer) = pair();
        peer.implement_command("main", "fail", |_| Err(RemoteFailure::handler("no power")))
            .unwrap();

        let err = caller.call_command("evse", "fail", json!({})).await.unwrap_err();
        match err {
            ProbeError::Remote { kind, message } => {
                assert_eq!(kind, RemoteErrorKind::HandlerException);
                assert_eq!(message, "no power");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_handler_exception() {
        let (_bus, caller, peer) = pair();
        peer.implement_command("main", "explode", |_| panic!("kaboom"))
            .unwrap();

        let err = caller.call_command("evse", "explode", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Remote {
                kind: RemoteErrorKind::HandlerException,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_cleans_up_and_drops_late_reply() {
        let (bus, caller, peer) = pair();
        peer.implement_command("main", "slow", |_| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(json!("late"))
        })
        .unwrap();
        let baseline = bus.subscription_count();

        let err = caller
            .call_command_with_timeout("evse", "slow", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { .. }));
        assert_eq!(caller.pending_calls(), 0);
        assert_eq!(bus.subscription_count(), baseline);

        // the late reply must not resurrect anything
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(caller.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_implementation_rejected() {
        let (_bus, _caller, peer) = pair();
        peer.implement_command("main", "cmd", |_| Ok(Value::Null)).unwrap();
        let err = peer.implement_command("main", "cmd", |_| Ok(Value::Null)).unwrap_err();
        assert!(matches!(err, ProbeError::AlreadyImplemented { .. }));
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let (_bus, caller, _peer) = pair();
        let err = caller.call_command("nope", "x", json!({})).await.unwrap_err();
        assert!(matches!(err, ProbeError::UnknownConnection(r) if r == "nope"));
    }

    #[tokio::test]
    async fn test_call_fails_while_disconnected() {
        let (bus, caller, _peer) = pair();
        bus.set_connected(false);
        let err = caller.call_command("evse", "x", json!({})).await.unwrap_err();
        assert!(matches!(err, ProbeError::TransportFailed(BusError::Disconnected)));
        assert_eq!(caller.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_variable_queue_preserves_order() {
        let (_bus, caller, peer) = pair();
        let mut queue = caller
            .subscribe_variable_to_queue("evse", "session_event")
            .unwrap();

        for i in 0..5 {
            peer.publish_variable("main", "session_event", &json!({ "n": i }))
                .unwrap();
        }
        for i in 0..5 {
            let value = queue.recv_timeout(Duration::from_secs(1)).await.unwrap();
            assert_eq!(value["n"], i);
        }
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropping_queue_releases_subscription() {
        let (bus, caller, _peer) = pair();
        let baseline = bus.subscription_count();

        let queue = caller
            .subscribe_variable_to_queue("evse", "session_event")
            .unwrap();
        assert_eq!(bus.subscription_count(), baseline + 1);
        drop(queue);
        assert_eq!(bus.subscription_count(), baseline);

        // a subscription already gone is only logged
        let queue = caller
            .subscribe_variable_to_queue("evse", "session_event")
            .unwrap();
        bus.unsubscribe(queue.subscription).unwrap();
        drop(queue);
        assert_eq!(bus.subscription_count(), baseline);
    }

    #[tokio::test]
    async fn test_subscribe_variable_callback() {
        let (_bus, caller, peer) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        caller
            .subscribe_variable("evse", "limits", move |v| {
                let _ = tx.send(v);
            })
            .unwrap();

        peer.publish_variable("main", "limits", &json!(16.0)).unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!(16.0));
    }

    #[tokio::test]
    async fn test_readiness_handshake() {
        let (bus, caller, _peer) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_fn("everest/modules/probe/ready", move |msg| {
            let _ = tx.send(msg.json().unwrap());
        })
        .unwrap();

        caller.start().unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!(true));

        let err = caller.wait_to_be_ready(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { .. }));

        bus.publish_json("everest/ready", &true).unwrap();
        caller.wait_to_be_ready(Duration::from_secs(1)).await.unwrap();
        assert!(caller.is_ready());
    }

    #[tokio::test]
    async fn test_raise_and_clear_error_publishes_records() {
        let (bus, caller, _peer) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_fn("everest/modules/probe/impl/main/#", move |msg| {
            let _ = tx.send((msg.topic.clone(), msg.json().unwrap()));
        })
        .unwrap();

        let record = caller
            .raise_error("main", "evse_board_support/MREC6UnderVoltage", "", "low", Severity::High)
            .unwrap();
        let (topic, payload) = rx.recv().await.unwrap();
        assert!(topic.ends_with("/error/evse_board_support/MREC6UnderVoltage"));
        assert_eq!(payload["uuid"], record.uuid);
        assert_eq!(payload["state"], "Active");

        caller
            .clear_error("main", "evse_board_support/MREC6UnderVoltage", "")
            .unwrap();
        let (topic, payload) = rx.recv().await.unwrap();
        assert!(topic.contains("/error-cleared/"));
        assert_eq!(payload["state"], "ClearedByModule");
    }

    #[tokio::test]
    async fn test_error_history_query() {
        let bus = LocalBus::new();
        let history = ProbeModule::new(bus.clone(), ProbeConfig::new("error_history"));
        let caller = ProbeModule::new(
            bus.clone(),
            ProbeConfig::new("probe")
                .with_connection("error_history", Fulfillment::new("error_history", "error_history"))
                .with_command_timeout(Duration::from_secs(2)),
        );
        history.serve_error_history("error_history").unwrap();

        let raised: Vec<ErrorRecord> = [
            ("test_errors/TestErrorA", Severity::Low),
            ("test_errors/TestErrorB", Severity::Low),
            ("test_errors/TestErrorC", Severity::High),
            ("test_errors/TestErrorD", Severity::Medium),
        ]
        .iter()
        .map(|(error_type, severity)| history.raise_error("main", error_type, "", "raised", *severity).unwrap())
        .collect();

        let high = caller
            .call_command("error_history", "get_errors", json!({"filters": {"severity_filter": "HIGH_GE"}}))
            .await
            .unwrap();
        let high = high.as_array().unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0]["type"], "test_errors/TestErrorC");

        for record in &raised[..3] {
            history.clear_error_by_uuid(&record.uuid).unwrap();
        }
        let cleared = caller
            .call_command("error_history", "get_errors", json!({"filters": {"state_filter": "ClearedByModule"}}))
            .await
            .unwrap();
        let mut uuids: Vec<&str> = cleared
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["uuid"].as_str().unwrap())
            .collect();
        uuids.sort_unstable();
        let mut expected: Vec<&str> = raised[..3].iter().map(|r| r.uuid.as_str()).collect();
        expected.sort_unstable();
        assert_eq!(uuids, expected);

        let all = caller.call_command("error_history", "get_errors", json!({})).await.unwrap();
        assert_eq!(all.as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_stop_releases_subscriptions() {
        let (bus, caller, _peer) = pair();
        caller.implement_command("main", "a", |_| Ok(Value::Null)).unwrap();
        caller.start().unwrap();
        assert!(bus.subscription_count() > 0);

        caller.stop();
        assert_eq!(bus.subscription_count(), 0);
    }
}
