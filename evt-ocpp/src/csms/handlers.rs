//! Action handlers of the CSMS mock
//!
//! A handler turns the payload of a station Call into either the CallResult
//! payload or a [`HandlerError`] that becomes a CallError. Handlers are
//! async so a scenario can hold a response back; synchronous closures are
//! wrapped with [`handler_fn`].

use crate::ocpp::messages::ErrorCode;
use crate::ocpp::types::*;
use crate::ocpp::version::OcppVersion;
use chrono::Utc;
use futures_util::future::{self, BoxFuture};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Boot interval handed out by the default 1.6 handler
pub const DEFAULT_HEARTBEAT_INTERVAL_V16: i32 = 1440;

/// Boot interval handed out by the default 2.x handler
pub const DEFAULT_HEARTBEAT_INTERVAL_V2: i32 = 300;

/// What the handler knows about the Call it answers
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub station_id: String,
    pub message_id: String,
    pub action: String,
    pub version: OcppVersion,
}

/// A handler failure answered with a CallError
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: json!({}),
        }
    }

    pub fn generic(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::GenericError, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

pub type Handler = Arc<dyn Fn(HandlerContext, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap a synchronous closure as a handler
pub fn handler_fn<F>(f: F) -> Handler
where
    F: Fn(&HandlerContext, Value) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(move |ctx, payload| {
        let result = f(&ctx, payload);
        Box::pin(future::ready(result))
    })
}

/// Wrap an async closure as a handler
pub fn async_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx, payload| Box::pin(f(ctx, payload)))
}

/// Always answer with the same payload
pub fn respond_with(payload: impl Serialize) -> Handler {
    let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
    handler_fn(move |_, _| Ok(payload.clone()))
}

/// Always answer with a CallError
pub fn fail_with(error: HandlerError) -> Handler {
    handler_fn(move |_, _| Err(error.clone()))
}

/// Action name to handler
///
/// The mock holds the table behind an `Arc` and swaps whole tables, so a
/// handler lookup never observes a half-updated table.
#[derive(Clone, Default)]
pub struct HandlerTable {
    routes: HashMap<String, Handler>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable").field("actions", &self.actions()).finish()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default answers for the station actions of a version
    pub fn defaults(version: OcppVersion) -> Self {
        match version {
            OcppVersion::V16 => default_v16(),
            OcppVersion::V201 | OcppVersion::V21 => default_v2(),
        }
    }

    pub fn insert(&mut self, action: impl Into<String>, handler: Handler) -> Option<Handler> {
        self.routes.insert(action.into(), handler)
    }

    pub fn with(mut self, action: impl Into<String>, handler: Handler) -> Self {
        self.insert(action, handler);
        self
    }

    pub fn remove(&mut self, action: &str) -> Option<Handler> {
        self.routes.remove(action)
    }

    pub fn get(&self, action: &str) -> Option<&Handler> {
        self.routes.get(action)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.routes.contains_key(action)
    }

    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn boot_accepted(interval: i32) -> Handler {
    handler_fn(move |_, _| {
        to_payload(BootNotificationResponse {
            status: RegistrationStatus::Accepted,
            current_time: Utc::now(),
            interval,
        })
    })
}

fn heartbeat() -> Handler {
    handler_fn(|_, _| to_payload(HeartbeatResponse { current_time: Utc::now() }))
}

fn empty() -> Handler {
    respond_with(json!({}))
}

fn to_payload(value: impl Serialize) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| HandlerError::internal(e.to_string()))
}

fn default_v16() -> HandlerTable {
    let mut table = HandlerTable::new()
        .with("BootNotification", boot_accepted(DEFAULT_HEARTBEAT_INTERVAL_V16))
        .with("Heartbeat", heartbeat())
        .with(
            "Authorize",
            respond_with(AuthorizeResponse16 {
                id_tag_info: IdTagInfo::accepted(),
            }),
        )
        .with(
            "StartTransaction",
            respond_with(StartTransactionResponse {
                transaction_id: 1,
                id_tag_info: IdTagInfo::accepted(),
            }),
        )
        .with(
            "DataTransfer",
            respond_with(DataTransferResponse {
                status: DataTransferStatus::UnknownVendorId,
            }),
        )
        .with("SignCertificate", respond_with(json!({"status": "Accepted"})));

    for action in [
        "StopTransaction",
        "StatusNotification",
        "MeterValues",
        "DiagnosticsStatusNotification",
        "FirmwareStatusNotification",
        "LogStatusNotification",
        "SecurityEventNotification",
        "SignedFirmwareStatusNotification",
    ] {
        table.insert(action, empty());
    }
    table
}

fn default_v2() -> HandlerTable {
    let mut table = HandlerTable::new()
        .with("BootNotification", boot_accepted(DEFAULT_HEARTBEAT_INTERVAL_V2))
        .with("Heartbeat", heartbeat())
        .with(
            "Authorize",
            respond_with(AuthorizeResponse {
                id_token_info: IdTokenInfo {
                    status: AuthorizationStatus::Accepted,
                    cache_expiry_date_time: None,
                },
            }),
        )
        .with(
            "DataTransfer",
            respond_with(DataTransferResponse {
                status: DataTransferStatus::UnknownVendorId,
            }),
        )
        .with("SignCertificate", respond_with(json!({"status": "Accepted"})))
        .with("NotifyEVChargingNeeds", respond_with(json!({"status": "Accepted"})))
        .with("GetCertificateStatus", respond_with(json!({"status": "Accepted"})));

    for action in [
        "TransactionEvent",
        "StatusNotification",
        "MeterValues",
        "NotifyReport",
        "NotifyEvent",
        "NotifyMonitoringReport",
        "NotifyChargingLimit",
        "ClearedChargingLimit",
        "ReportChargingProfiles",
        "NotifyCustomerInformation",
        "NotifyDisplayMessages",
        "ReservationStatusUpdate",
        "SecurityEventNotification",
        "FirmwareStatusNotification",
        "LogStatusNotification",
        "PublishFirmwareStatusNotification",
    ] {
        table.insert(action, empty());
    }
    table
}
