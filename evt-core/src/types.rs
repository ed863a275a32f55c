//! Module wiring and bus envelope types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Default EVerest topic prefix
pub const DEFAULT_PREFIX: &str = "everest/";

/// Identifier of a module instance in the active configuration
pub type ModuleId = String;

/// One implementation fulfilling a requirement of another module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub module_id: ModuleId,
    pub implementation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

impl Fulfillment {
    pub fn new(module_id: impl Into<String>, implementation_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            implementation_id: implementation_id.into(),
            interface: None,
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }
}

impl fmt::Display for Fulfillment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module_id, self.implementation_id)
    }
}

/// Requirement id to the ordered list of fulfillments
pub type Connections = BTreeMap<String, Vec<Fulfillment>>;

/// Topic layout for one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Topics {
    /// A missing trailing `/` is added
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn implementation(&self, module_id: &str, implementation_id: &str) -> String {
        format!("{}modules/{}/impl/{}", self.prefix, module_id, implementation_id)
    }

    pub fn command(&self, module_id: &str, implementation_id: &str, name: &str) -> String {
        format!("{}/cmd/{}", self.implementation(module_id, implementation_id), name)
    }

    pub fn variable(&self, module_id: &str, implementation_id: &str, name: &str) -> String {
        format!("{}/var/{}", self.implementation(module_id, implementation_id), name)
    }

    pub fn error_raised(&self, module_id: &str, implementation_id: &str, error_type: &str) -> String {
        format!("{}/error/{}", self.implementation(module_id, implementation_id), error_type)
    }

    pub fn error_cleared(&self, module_id: &str, implementation_id: &str, error_type: &str) -> String {
        format!(
            "{}/error-cleared/{}",
            self.implementation(module_id, implementation_id),
            error_type
        )
    }

    /// Reply topic for one command invocation
    pub fn response(&self, module_id: &str, call_id: &str) -> String {
        format!("{}modules/{}/response/{}", self.prefix, module_id, call_id)
    }

    pub fn module_ready(&self, module_id: &str) -> String {
        format!("{}modules/{}/ready", self.prefix, module_id)
    }

    pub fn global_ready(&self) -> String {
        format!("{}ready", self.prefix)
    }
}

/// Command invocation envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: String,
    #[serde(default)]
    pub args: Value,
    pub origin: ModuleId,
    #[serde(rename = "replyTo")]
    pub reply_to: String,
}

/// Failure class reported by a command handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    HandlerException,
    SchemaValidationError,
    MessageParsingError,
    NotImplemented,
    Shutdown,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteErrorKind::HandlerException => "HandlerException",
            RemoteErrorKind::SchemaValidationError => "SchemaValidationError",
            RemoteErrorKind::MessageParsingError => "MessageParsingError",
            RemoteErrorKind::NotImplemented => "NotImplemented",
            RemoteErrorKind::Shutdown => "Shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Error payload of a failed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    #[serde(rename = "type")]
    pub kind: RemoteErrorKind,
    #[serde(rename = "msg")]
    pub message: String,
}

impl RemoteFailure {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::HandlerException, message)
    }
}

/// Command reply envelope, carries either `retval` or `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retval: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFailure>,
}

impl CommandResponse {
    pub fn from_result(id: String, result: Result<Value, RemoteFailure>) -> Self {
        match result {
            Ok(retval) => Self {
                id,
                retval: Some(retval),
                error: None,
            },
            Err(error) => Self {
                id,
                retval: None,
                error: Some(error),
            },
        }
    }

    /// A reply without `retval` counts as `null`
    pub fn into_result(self) -> Result<Value, RemoteFailure> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.retval.unwrap_or(Value::Null)),
        }
    }
}
