//! OCPP-J message framing
//!
//! Every OCPP version since 1.6 uses the same RPC framing over WebSocket:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Parsing reports failures as a [`FrameError`] already carrying the error
//! code a CSMS must answer with.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Message id used when the id of a broken frame cannot be recovered
pub const UNKNOWN_MESSAGE_ID: &str = "-1";

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// RPC framework error codes of OCPP 1.6 and 2.x
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    FormationViolation,
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurenceConstraintViolation,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
        }
    }

    /// Unknown codes map to `GenericError`
    pub fn from_wire(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("OCPP error from station: {code} - {description}")]
    RemoteError {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("timeout waiting for response to {action}")]
    Timeout { action: String },

    #[error("no charging station connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame that could not be parsed, with the code to answer it with
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{code}: {description} (message id {message_id})")]
pub struct FrameError {
    pub message_id: String,
    pub code: ErrorCode,
    pub description: String,
}

impl FrameError {
    fn new(message_id: impl Into<String>, code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            code,
            description: description.into(),
        }
    }

    /// The CALLERROR answering this frame
    pub fn to_call_error(&self) -> CallError {
        CallError::new(self.message_id.clone(), self.code, self.description.clone())
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ])
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_value(&self) -> Value {
        serde_json::json!([MessageType::CallResult as i32, &self.message_id, &self.payload])
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(message_id: impl Into<String>, error_code: ErrorCode, error_description: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.as_str(),
            &self.error_description,
            &self.error_details
        ])
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON text or bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| {
            FrameError::new(UNKNOWN_MESSAGE_ID, ErrorCode::RpcFrameworkError, format!("invalid JSON: {}", e))
        })?;
        Self::from_value(value)
    }

    /// Interpret an already decoded JSON value as an OCPP frame
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Array(mut array) = value else {
            return Err(FrameError::new(
                UNKNOWN_MESSAGE_ID,
                ErrorCode::RpcFrameworkError,
                "frame is not a JSON array",
            ));
        };

        let message_id = array
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_MESSAGE_ID)
            .to_string();

        let msg_type = array.first().and_then(Value::as_i64).ok_or_else(|| {
            FrameError::new(
                message_id.clone(),
                ErrorCode::RpcFrameworkError,
                "missing message type",
            )
        })?;

        let expected_len = match msg_type {
            2 => 4,
            3 => 3,
            4 => 5,
            other => {
                return Err(FrameError::new(
                    message_id,
                    ErrorCode::MessageTypeNotSupported,
                    format!("unknown message type {}", other),
                ))
            }
        };

        if array.len() != expected_len {
            return Err(FrameError::new(
                message_id,
                ErrorCode::FormationViolation,
                format!("message type {} needs {} elements, got {}", msg_type, expected_len, array.len()),
            ));
        }
        if !array[1].is_string() {
            return Err(FrameError::new(
                UNKNOWN_MESSAGE_ID,
                ErrorCode::RpcFrameworkError,
                "message id is not a string",
            ));
        }

        match msg_type {
            2 => {
                // CALL: [2, messageId, action, payload]
                let action = array[2]
                    .as_str()
                    .ok_or_else(|| {
                        FrameError::new(message_id.clone(), ErrorCode::FormationViolation, "action is not a string")
                    })?
                    .to_string();
                let payload = array.swap_remove(3);
                if !payload.is_object() {
                    return Err(FrameError::new(
                        message_id,
                        ErrorCode::FormationViolation,
                        "payload is not an object",
                    ));
                }
                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload,
                }))
            }
            3 => Ok(OcppMessage::CallResult(CallResult {
                message_id,
                payload: array.swap_remove(2),
            })),
            _ => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                let error_code = array[2]
                    .as_str()
                    .map(ErrorCode::from_wire)
                    .unwrap_or(ErrorCode::GenericError);
                let error_description = array[3].as_str().unwrap_or("").to_string();
                let error_details = array.swap_remove(4);
                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    /// Payload of a call or result, details of an error
    pub fn payload(&self) -> &Value {
        match self {
            OcppMessage::Call(c) => &c.payload,
            OcppMessage::CallResult(r) => &r.payload,
            OcppMessage::CallError(e) => &e.error_details,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            OcppMessage::Call(c) => c.to_value(),
            OcppMessage::CallResult(r) => r.to_value(),
            OcppMessage::CallError(e) => e.to_value(),
        }
    }

    /// Serialize to the text sent in a WebSocket frame
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

impl fmt::Display for OcppMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl From<Call> for OcppMessage {
    fn from(call: Call) -> Self {
        OcppMessage::Call(call)
    }
}

impl From<CallResult> for OcppMessage {
    fn from(result: CallResult) -> Self {
        OcppMessage::CallResult(result)
    }
}

impl From<CallError> for OcppMessage {
    fn from(error: CallError) -> Self {
        OcppMessage::CallError(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_serialization() {
        let call = Call::new("Heartbeat", serde_json::json!({})).unwrap();
        let text = OcppMessage::from(call).to_text();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, "msg-123");
                assert_eq!(call.action, "Heartbeat");
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id, "msg-123");
                assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_malformed_json_is_rpc_framework_error() {
        let err = OcppMessage::parse(b"{Malformed").unwrap_err();
        assert_eq!(err.code, ErrorCode::RpcFrameworkError);
        assert_eq!(err.message_id, UNKNOWN_MESSAGE_ID);
    }

    #[test]
    fn test_unknown_type_keeps_message_id() {
        let err = OcppMessage::parse(br#"[99,"MessageId"]"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::MessageTypeNotSupported);
        assert_eq!(err.message_id, "MessageId");

        let reply = err.to_call_error().to_value();
        assert_eq!(reply[0], 4);
        assert_eq!(reply[1], "MessageId");
        assert_eq!(reply[2], "MessageTypeNotSupported");
    }

    #[test]
    fn test_wrong_arity_is_formation_violation() {
        let err = OcppMessage::parse(br#"[2,"abc","Heartbeat"]"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::FormationViolation);
        assert_eq!(err.message_id, "abc");
    }

    #[test]
    fn test_unknown_error_code_maps_to_generic() {
        let msg = OcppMessage::parse(br#"[4,"a","SomethingNew","",{}]"#).unwrap();
        match msg {
            OcppMessage::CallError(e) => assert_eq!(e.error_code, ErrorCode::GenericError),
            _ => panic!("Expected CallError"),
        }
    }
}
