//! Mock CSMS
//!
//! A WebSocket server that a real charging station connects to. It:
//! - answers station Calls through a swappable [`HandlerTable`]
//! - rejects malformed frames with the matching CallError
//! - sends CSMS-initiated Calls and correlates the station's answers
//! - records all traffic into a [`MessageHistory`] for assertions
//!
//! Responses to station Calls leave in the order the Calls arrived, even
//! when a later handler finishes first.

pub mod handlers;
pub mod history;

pub use handlers::{
    async_handler, fail_with, handler_fn, respond_with, Handler, HandlerContext, HandlerError, HandlerResult,
    HandlerTable,
};
pub use history::{
    payload_matches, AssertionError, Direction, HistoryEntry, MessageHistory, ValidationMode, Validator,
};

use crate::config::CsmsConfig;
use crate::ocpp::messages::*;
use crate::ocpp::version::OcppVersion;
use futures_util::future::{self, BoxFuture};
use futures_util::stream::FuturesOrdered;
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, info, warn};

/// A station Call kept in recording mode
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub action: String,
    pub message_id: String,
    pub payload: Value,
}

/// CSMS-initiated call awaiting the station's answer
struct PendingCall {
    action: String,
    reply: oneshot::Sender<Result<Value, OcppError>>,
}

struct Connection {
    generation: u64,
    station_id: String,
    outbound: mpsc::UnboundedSender<Message>,
    close: Option<oneshot::Sender<()>>,
}

/// A finished station Call on its way back to the station
struct Reply {
    message_id: String,
    action: Option<String>,
    result: HandlerResult,
    /// Whether answering frees the message id for reuse
    release: bool,
}

type ReplyFuture = BoxFuture<'static, Reply>;

struct Shared {
    config: CsmsConfig,
    handlers: RwLock<Arc<HandlerTable>>,
    history: Arc<MessageHistory>,
    pending: Mutex<HashMap<String, PendingCall>>,
    in_flight: Mutex<HashSet<String>>,
    connection: Mutex<Option<Connection>>,
    connected: watch::Sender<Option<String>>,
    recording: AtomicBool,
    recorded: Mutex<Vec<RecordedCall>>,
    next_generation: AtomicU64,
}

impl Shared {
    fn version(&self) -> OcppVersion {
        self.config.version
    }

    fn attach(&self, station_id: &str, outbound: mpsc::UnboundedSender<Message>) -> (u64, oneshot::Receiver<()>) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (close_tx, close_rx) = oneshot::channel();
        let previous = self.connection.lock().replace(Connection {
            generation,
            station_id: station_id.to_string(),
            outbound,
            close: Some(close_tx),
        });

        if let Some(mut previous) = previous {
            warn!(
                "Station {} connected while {} was attached, closing the older connection",
                station_id, previous.station_id
            );
            if let Some(close) = previous.close.take() {
                let _ = close.send(());
            }
        }

        self.in_flight.lock().clear();
        self.connected.send_replace(Some(station_id.to_string()));
        info!("Charging station {} connected", station_id);
        (generation, close_rx)
    }

    fn detach(&self, generation: u64) {
        let mut connection = self.connection.lock();
        if connection.as_ref().map(|c| c.generation) != Some(generation) {
            return;
        }
        if let Some(old) = connection.take() {
            info!("Charging station {} disconnected", old.station_id);
        }
        drop(connection);

        // dropping the senders fails every outstanding call with ConnectionClosed
        self.pending.lock().clear();
        self.in_flight.lock().clear();
        self.connected.send_replace(None);
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.connection.lock().as_ref().map(|c| c.outbound.clone())
    }

    /// Handle one inbound text frame, queueing any answer it needs
    fn dispatch(&self, station_id: &str, text: &str, replies: &mut FuturesOrdered<ReplyFuture>) {
        debug!("<- {}", text);

        let message = match OcppMessage::parse(text.as_bytes()) {
            Ok(message) => message,
            Err(frame) => {
                warn!("Rejecting frame from {}: {}", station_id, frame);
                replies.push_back(ready_reply(
                    frame.message_id.clone(),
                    None,
                    Err(HandlerError::new(frame.code, frame.description.clone())),
                    false,
                ));
                return;
            }
        };

        match message {
            OcppMessage::Call(call) => self.dispatch_call(station_id, call, replies),
            OcppMessage::CallResult(result) => {
                let pending = self.pending.lock().remove(&result.message_id);
                let action = pending.as_ref().map(|p| p.action.clone());
                let payload = result.payload.clone();
                self.history.record(Direction::StationToCsms, action, result.into());
                match pending {
                    Some(p) => {
                        let _ = p.reply.send(Ok(payload));
                    }
                    None => debug!("Dropping CallResult for unknown message id"),
                }
            }
            OcppMessage::CallError(error) => {
                let pending = self.pending.lock().remove(&error.message_id);
                let action = pending.as_ref().map(|p| p.action.clone());
                let remote = OcppError::RemoteError {
                    code: error.error_code,
                    description: error.error_description.clone(),
                    details: error.error_details.clone(),
                };
                self.history.record(Direction::StationToCsms, action, error.into());
                match pending {
                    Some(p) => {
                        let _ = p.reply.send(Err(remote));
                    }
                    None => debug!("Dropping CallError for unknown message id: {}", remote),
                }
            }
        }
    }

    fn dispatch_call(&self, station_id: &str, call: Call, replies: &mut FuturesOrdered<ReplyFuture>) {
        let Call {
            message_id,
            action,
            payload,
        } = call.clone();

        // a rejected duplicate never reaches the history or the recording
        if !self.in_flight.lock().insert(message_id.clone()) {
            warn!("{} reused in-flight message id {}", station_id, message_id);
            replies.push_back(ready_reply(
                message_id,
                Some(action),
                Err(HandlerError::generic("message id already in flight")),
                false,
            ));
            return;
        }

        self.history
            .record(Direction::StationToCsms, Some(action.clone()), call.into());

        if self.recording.load(Ordering::SeqCst) {
            self.recorded.lock().push(RecordedCall {
                action: action.clone(),
                message_id: message_id.clone(),
                payload: payload.clone(),
            });
        }

        if self.config.validate_payloads {
            if let Err(violation) = self.config.schemas.validate(self.version(), &action, &payload) {
                warn!("{} payload rejected: {}", action, violation);
                replies.push_back(ready_reply(
                    message_id,
                    Some(action),
                    Err(HandlerError::new(ErrorCode::FormationViolation, violation)),
                    true,
                ));
                return;
            }
        }

        let handler = self.handlers.read().get(&action).cloned();
        let Some(handler) = handler else {
            replies.push_back(ready_reply(
                message_id,
                Some(action.clone()),
                Err(HandlerError::new(
                    ErrorCode::NotImplemented,
                    format!("no handler for {}", action),
                )),
                true,
            ));
            return;
        };

        let ctx = HandlerContext {
            station_id: station_id.to_string(),
            message_id: message_id.clone(),
            action: action.clone(),
            version: self.version(),
        };
        let running = handler(ctx, payload);
        replies.push_back(Box::pin(async move {
            let result = match AssertUnwindSafe(running).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(HandlerError::internal(format!("{} handler panicked", action))),
            };
            Reply {
                message_id,
                action: Some(action),
                result,
                release: true,
            }
        }));
    }

    /// Turn a finished reply into the frame to send, recording it
    fn finish(&self, reply: Reply) -> String {
        let message: OcppMessage = match reply.result {
            Ok(payload) => CallResult {
                message_id: reply.message_id.clone(),
                payload,
            }
            .into(),
            Err(e) => CallError::new(reply.message_id.clone(), e.code, e.description)
                .with_details(e.details)
                .into(),
        };
        let text = message.to_text();
        self.history.record(Direction::CsmsToStation, reply.action, message);
        if reply.release {
            self.in_flight.lock().remove(&reply.message_id);
        }
        debug!("-> {}", text);
        text
    }
}

fn ready_reply(message_id: String, action: Option<String>, result: HandlerResult, release: bool) -> ReplyFuture {
    Box::pin(future::ready(Reply {
        message_id,
        action,
        result,
        release,
    }))
}

/// Mock Central System
pub struct CsmsMock {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl CsmsMock {
    /// Bind the listener and start accepting stations
    pub async fn start(config: CsmsConfig) -> Result<Self, OcppError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let handlers = HandlerTable::defaults(config.version);
        let (connected, _) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            recording: AtomicBool::new(config.record_calls),
            config,
            handlers: RwLock::new(Arc::new(handlers)),
            history: Arc::new(MessageHistory::new()),
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            connection: Mutex::new(None),
            connected,
            recorded: Mutex::new(Vec::new()),
            next_generation: AtomicU64::new(0),
        });

        info!(
            "CSMS mock (OCPP {}) listening on ws://{}",
            shared.version(),
            local_addr
        );
        let task = tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx));

        Ok(Self {
            shared,
            local_addr,
            shutdown,
            accept_task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn version(&self) -> OcppVersion {
        self.shared.version()
    }

    /// Base URL without a station identity
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn station_url(&self, station_id: &str) -> String {
        format!("{}/{}", self.url(), station_id)
    }

    pub fn history(&self) -> Arc<MessageHistory> {
        self.shared.history.clone()
    }

    /// Identity of the attached station
    pub fn station_id(&self) -> Option<String> {
        self.shared.connected.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.borrow().is_some()
    }

    /// Wait until a station is attached, returning its identity
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<String, OcppError> {
        let mut rx = self.shared.connected.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(station)) => Ok(station.clone().unwrap_or_default()),
            Ok(Err(_)) => Err(OcppError::ConnectionClosed),
            Err(_) => Err(OcppError::Timeout {
                action: "station connection".to_string(),
            }),
        }
    }

    /// Wait until no station is attached
    pub async fn wait_for_disconnection(&self, timeout: Duration) -> Result<(), OcppError> {
        let mut rx = self.shared.connected.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(Option::is_none)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(OcppError::Timeout {
                action: "station disconnection".to_string(),
            }),
        };
        result
    }

    /// Current handler table
    pub fn handlers(&self) -> Arc<HandlerTable> {
        self.shared.handlers.read().clone()
    }

    /// Override the answer to one action
    pub fn set_handler(&self, action: impl Into<String>, handler: Handler) {
        let mut guard = self.shared.handlers.write();
        let mut table = HandlerTable::clone(&guard);
        table.insert(action, handler);
        *guard = Arc::new(table);
    }

    /// Answer an action with a fixed payload
    pub fn respond_with(&self, action: impl Into<String>, payload: impl Serialize) {
        self.set_handler(action, respond_with(payload));
    }

    pub fn remove_handler(&self, action: &str) {
        let mut guard = self.shared.handlers.write();
        let mut table = HandlerTable::clone(&guard);
        table.remove(action);
        *guard = Arc::new(table);
    }

    pub fn replace_handlers(&self, table: HandlerTable) {
        *self.shared.handlers.write() = Arc::new(table);
    }

    /// Go back to the default answers of the version
    pub fn reset_handlers(&self) {
        self.replace_handlers(HandlerTable::defaults(self.version()));
    }

    pub fn set_recording(&self, enabled: bool) {
        self.shared.recording.store(enabled, Ordering::SeqCst);
    }

    /// Station Calls kept while recording, optionally of one action
    pub fn recorded_calls(&self, action: Option<&str>) -> Vec<RecordedCall> {
        self.shared
            .recorded
            .lock()
            .iter()
            .filter(|c| action.map_or(true, |a| c.action == a))
            .cloned()
            .collect()
    }

    pub fn call_count(&self, action: &str) -> usize {
        self.shared.recorded.lock().iter().filter(|c| c.action == action).count()
    }

    pub fn clear_recorded(&self) {
        self.shared.recorded.lock().clear();
    }

    /// Send a Call to the station and wait for its answer
    pub async fn call(&self, action: &str, payload: impl Serialize) -> Result<Value, OcppError> {
        self.call_with_timeout(action, payload, self.shared.config.response_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        action: &str,
        payload: impl Serialize,
        timeout: Duration,
    ) -> Result<Value, OcppError> {
        let outbound = self.shared.outbound().ok_or(OcppError::NotConnected)?;
        let call = Call::new(action, payload)?;
        let message_id = call.message_id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.shared.pending.lock().insert(
            message_id.clone(),
            PendingCall {
                action: action.to_string(),
                reply: reply_tx,
            },
        );

        let message = OcppMessage::Call(call);
        let text = message.to_text();
        self.shared
            .history
            .record(Direction::CsmsToStation, Some(action.to_string()), message);
        debug!("-> {}", text);

        if outbound.send(Message::Text(text)).is_err() {
            self.shared.pending.lock().remove(&message_id);
            return Err(OcppError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcppError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.lock().remove(&message_id);
                Err(OcppError::Timeout {
                    action: action.to_string(),
                })
            }
        }
    }

    /// Send a raw text frame, bypassing framing and correlation
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), OcppError> {
        let outbound = self.shared.outbound().ok_or(OcppError::NotConnected)?;
        outbound
            .send(Message::Text(text.into()))
            .map_err(|_| OcppError::ConnectionClosed)
    }

    /// CSMS calls still waiting for the station
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub async fn wait_for_and_validate(
        &self,
        action: &str,
        expected: &Value,
        validator: Option<&Validator>,
        timeout: Duration,
    ) -> Result<bool, AssertionError> {
        self.shared
            .history
            .wait_for_and_validate(action, expected, validator, timeout)
            .await
    }

    pub async fn expect(&self, action: &str, expected: &Value, timeout: Duration) -> Result<(), AssertionError> {
        self.shared.history.expect(action, expected, None, timeout).await
    }

    /// Close the station connection; the station may reconnect
    pub fn disconnect(&self) {
        let mut connection = self.shared.connection.lock();
        if let Some(close) = connection.as_mut().and_then(|c| c.close.take()) {
            let _ = close.send(());
        }
    }

    /// Stop accepting and close the station connection
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.disconnect();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("CSMS accept loop did not stop in time");
            }
        }
        info!("CSMS mock on {} stopped", self.local_addr);
    }
}

impl Drop for CsmsMock {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("TCP connection from {}", peer);
                    let shared = shared.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_socket(shared, stream, shutdown).await {
                            warn!("Station connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

async fn serve_socket(
    shared: Arc<Shared>,
    stream: TcpStream,
    shutdown: watch::Receiver<bool>,
) -> Result<(), OcppError> {
    let version = shared.version();
    let expected = shared.config.station_id.clone();
    let mut station_id = None;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let identity = request.uri().path().rsplit('/').next().unwrap_or_default();
        if identity.is_empty() {
            return Err(reject(StatusCode::NOT_FOUND, "missing charging station identity"));
        }
        if expected.as_deref().map_or(false, |id| id != identity) {
            return Err(reject(StatusCode::NOT_FOUND, "unknown charging station identity"));
        }

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if offered.split(',').any(|p| p.trim() == version.subprotocol()) {
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(version.subprotocol()),
            );
        } else if !offered.trim().is_empty() {
            return Err(reject(StatusCode::BAD_REQUEST, "unsupported OCPP subprotocol"));
        }

        station_id = Some(identity.to_string());
        Ok(response)
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(shared.config.max_message_size),
        ..Default::default()
    };
    let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config))
        .await
        .map_err(|e| OcppError::WebSocket(e.to_string()))?;

    let station_id = station_id.unwrap_or_default();
    run_connection(shared, ws, station_id, shutdown).await;
    Ok(())
}

async fn run_connection(
    shared: Arc<Shared>,
    ws: WebSocketStream<TcpStream>,
    station_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (generation, mut close_rx) = shared.attach(&station_id, outbound_tx);
    let (mut sink, mut stream) = ws.split();
    let mut replies: FuturesOrdered<ReplyFuture> = FuturesOrdered::new();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.dispatch(&station_id, &text, &mut replies),
                Some(Ok(Message::Binary(_))) => warn!("Ignoring binary frame from {}", station_id),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error from {}: {}", station_id, e);
                    break;
                }
            },
            Some(reply) = replies.next(), if !replies.is_empty() => {
                let text = shared.finish(reply);
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Failed to answer {}: {}", station_id, e);
                    break;
                }
            }
            Some(message) = outbound_rx.recv() => {
                if let Err(e) = sink.send(message).await {
                    warn!("Failed to send to {}: {}", station_id, e);
                    break;
                }
            }
            _ = &mut close_rx => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    shared.detach(generation);
}
