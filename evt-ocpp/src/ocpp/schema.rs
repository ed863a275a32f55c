//! Payload schema validation
//!
//! The registry maps (version, action) to a compiled JSON schema for the
//! request payload. A small built-in set covers the station messages the
//! scenario catalogue relies on; complete official schema directories can be
//! loaded on top with [`SchemaRegistry::load_dir`]. Actions without a schema
//! pass validation.

use super::version::OcppVersion;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("I/O error reading schemas: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid schema for {action}: {message}")]
    Invalid { action: String, message: String },
}

/// Compiled request schemas keyed by version and action
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: HashMap<(OcppVersion, String), jsonschema::Validator>,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .schemas
            .keys()
            .map(|(v, a)| format!("{}/{}", v, a))
            .collect();
        keys.sort();
        f.debug_struct("SchemaRegistry").field("schemas", &keys).finish()
    }
}

impl SchemaRegistry {
    /// Empty registry, every payload passes
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in station request schemas
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for (version, action, schema) in builtin_schemas() {
            if let Err(e) = registry.register(version, action, &schema) {
                tracing::error!("Built-in schema {} {} rejected: {}", version, action, e);
            }
        }
        registry
    }

    pub fn register(&mut self, version: OcppVersion, action: &str, schema: &Value) -> Result<(), SchemaError> {
        let validator = jsonschema::validator_for(schema).map_err(|e| SchemaError::Invalid {
            action: action.to_string(),
            message: e.to_string(),
        })?;
        self.schemas.insert((version, action.to_string()), validator);
        Ok(())
    }

    /// Load official request schemas from a directory
    ///
    /// `Foo.json` and `FooRequest.json` register action `Foo`; response
    /// schemas (`FooResponse.json`) are skipped. Returns the number loaded.
    pub fn load_dir(&mut self, version: OcppVersion, dir: &Path) -> Result<usize, SchemaError> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.ends_with("Response") {
                continue;
            }
            let action = stem.strip_suffix("Request").unwrap_or(stem).to_string();

            let text = std::fs::read_to_string(&path)?;
            let schema: Value = serde_json::from_str(&text).map_err(|source| SchemaError::Json {
                path: path.clone(),
                source,
            })?;
            self.register(version, &action, &schema)?;
            loaded += 1;
        }
        debug!("Loaded {} OCPP {} schemas from {}", loaded, version, dir.display());
        Ok(loaded)
    }

    pub fn has_schema(&self, version: OcppVersion, action: &str) -> bool {
        self.schemas.contains_key(&(version, action.to_string()))
    }

    /// Validate a request payload, returning the first violation
    pub fn validate(&self, version: OcppVersion, action: &str, payload: &Value) -> Result<(), String> {
        let Some(validator) = self.schemas.get(&(version, action.to_string())) else {
            return Ok(());
        };
        match validator.iter_errors(payload).next() {
            Some(error) => Err(error.to_string()),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

fn string(max_len: u64) -> Value {
    json!({"type": "string", "maxLength": max_len})
}

fn builtin_schemas() -> Vec<(OcppVersion, &'static str, Value)> {
    let v16 = vec![
        (
            "BootNotification",
            json!({
                "type": "object",
                "properties": {
                    "chargePointVendor": string(20),
                    "chargePointModel": string(20),
                    "chargePointSerialNumber": string(25),
                    "chargeBoxSerialNumber": string(25),
                    "firmwareVersion": string(50)
                },
                "required": ["chargePointVendor", "chargePointModel"]
            }),
        ),
        (
            "Authorize",
            json!({
                "type": "object",
                "properties": {"idTag": string(20)},
                "required": ["idTag"]
            }),
        ),
        (
            "StatusNotification",
            json!({
                "type": "object",
                "properties": {
                    "connectorId": {"type": "integer", "minimum": 0},
                    "errorCode": {"type": "string"},
                    "status": {"type": "string", "enum": [
                        "Available", "Preparing", "Charging", "SuspendedEVSE", "SuspendedEV",
                        "Finishing", "Reserved", "Unavailable", "Faulted"
                    ]}
                },
                "required": ["connectorId", "errorCode", "status"]
            }),
        ),
        (
            "StartTransaction",
            json!({
                "type": "object",
                "properties": {
                    "connectorId": {"type": "integer", "minimum": 1},
                    "idTag": string(20),
                    "meterStart": {"type": "integer"},
                    "timestamp": {"type": "string"}
                },
                "required": ["connectorId", "idTag", "meterStart", "timestamp"]
            }),
        ),
        (
            "StopTransaction",
            json!({
                "type": "object",
                "properties": {
                    "transactionId": {"type": "integer"},
                    "meterStop": {"type": "integer"},
                    "timestamp": {"type": "string"},
                    "idTag": string(20)
                },
                "required": ["transactionId", "meterStop", "timestamp"]
            }),
        ),
        ("Heartbeat", json!({"type": "object"})),
    ];

    let component = json!({
        "type": "object",
        "properties": {"name": string(50), "instance": string(50)},
        "required": ["name"]
    });
    let variable = json!({
        "type": "object",
        "properties": {"name": string(50), "instance": string(50)},
        "required": ["name"]
    });

    let v2 = vec![
        (
            "BootNotification",
            json!({
                "type": "object",
                "properties": {
                    "chargingStation": {
                        "type": "object",
                        "properties": {"model": string(20), "vendorName": string(50)},
                        "required": ["model", "vendorName"]
                    },
                    "reason": {"type": "string"}
                },
                "required": ["chargingStation", "reason"]
            }),
        ),
        (
            "Authorize",
            json!({
                "type": "object",
                "properties": {
                    "idToken": {
                        "type": "object",
                        "properties": {"idToken": string(36), "type": {"type": "string"}},
                        "required": ["idToken", "type"]
                    }
                },
                "required": ["idToken"]
            }),
        ),
        (
            "StatusNotification",
            json!({
                "type": "object",
                "properties": {
                    "timestamp": {"type": "string"},
                    "connectorStatus": {"type": "string", "enum": [
                        "Available", "Occupied", "Reserved", "Unavailable", "Faulted"
                    ]},
                    "evseId": {"type": "integer"},
                    "connectorId": {"type": "integer"}
                },
                "required": ["timestamp", "connectorStatus", "evseId", "connectorId"]
            }),
        ),
        (
            "TransactionEvent",
            json!({
                "type": "object",
                "properties": {
                    "eventType": {"type": "string", "enum": ["Started", "Updated", "Ended"]},
                    "timestamp": {"type": "string"},
                    "triggerReason": {"type": "string"},
                    "seqNo": {"type": "integer", "minimum": 0},
                    "transactionInfo": {
                        "type": "object",
                        "properties": {"transactionId": string(36)},
                        "required": ["transactionId"]
                    }
                },
                "required": ["eventType", "timestamp", "triggerReason", "seqNo", "transactionInfo"]
            }),
        ),
        (
            "SetVariables",
            json!({
                "type": "object",
                "properties": {
                    "setVariableData": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "attributeValue": string(1000),
                                "component": component,
                                "variable": variable
                            },
                            "required": ["attributeValue", "component", "variable"]
                        }
                    }
                },
                "required": ["setVariableData"]
            }),
        ),
        ("Heartbeat", json!({"type": "object"})),
    ];

    let mut all = Vec::new();
    for (action, schema) in v16 {
        all.push((OcppVersion::V16, action, schema));
    }
    for (action, schema) in v2 {
        all.push((OcppVersion::V201, action, schema.clone()));
        all.push((OcppVersion::V21, action, schema));
    }
    all
}
